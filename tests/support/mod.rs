// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory HEIF writer and a stand-in HEVC decoder.
//!
//! The stand-in "bitstream" is `[width: u16][height: u16]` (big-endian)
//! followed by `width * height` 8-bit luma samples, so tests can predict every
//! output sample.
#![allow(dead_code)]

use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use zenheic_decode::{CodecConfig, DecodeFailure, DecodedPlanes, PixelFormat, Plane};

pub const ALPHA_URN: &str = "urn:mpeg:hevc:2015:auxid:1";

pub fn boxed(name: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = (8 + payload.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

fn full_boxed(name: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = vec![version];
    body.extend_from_slice(&flags.to_be_bytes()[1..]);
    body.extend_from_slice(payload);
    boxed(name, &body)
}

pub fn bitstream(width: u16, height: u16, samples: &[u8]) -> Vec<u8> {
    assert_eq!(samples.len(), usize::from(width) * usize::from(height));
    let mut out = width.to_be_bytes().to_vec();
    out.extend_from_slice(&height.to_be_bytes());
    out.extend_from_slice(samples);
    out
}

pub fn fake_decoder(_config: &CodecConfig<'_>, coded: &[u8]) -> Result<DecodedPlanes, DecodeFailure> {
    if coded.len() < 4 {
        return Err("bitstream too short".into());
    }
    let width = u32::from(u16::from_be_bytes([coded[0], coded[1]]));
    let height = u32::from(u16::from_be_bytes([coded[2], coded[3]]));
    let samples = &coded[4..];
    if samples.len() != (width * height) as usize {
        return Err("sample count doesn't match the frame size".into());
    }
    Ok(DecodedPlanes {
        pixel_format: PixelFormat::Monochrome,
        bit_depth: 8,
        planes: vec![Plane::new(width, height, 1, samples.to_vec())?],
    })
}

/// [`fake_decoder`] that counts its calls.
pub fn counting_decoder(calls: &AtomicUsize) -> impl Fn(&CodecConfig<'_>, &[u8]) -> Result<DecodedPlanes, DecodeFailure> + Sync + '_ {
    move |config: &CodecConfig<'_>, coded: &[u8]| {
        calls.fetch_add(1, Ordering::SeqCst);
        fake_decoder(config, coded)
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

pub fn ispe(width: u32, height: u32) -> Vec<u8> {
    let mut payload = width.to_be_bytes().to_vec();
    payload.extend_from_slice(&height.to_be_bytes());
    full_boxed(b"ispe", 0, 0, &payload)
}

/// Monochrome 8-bit configuration, 4-byte NAL lengths, no parameter sets.
pub fn hvcc() -> Vec<u8> {
    boxed(
        b"hvcC",
        &[1, 0x01, 0x60, 0, 0, 0, 0x90, 0, 0, 0, 0, 0, 0x5a, 0xf0, 0, 0xfc, 0xfc, 0xf8, 0xf8, 0, 0, 0x0f, 0],
    )
}

/// `turns` quarter turns counter-clockwise.
pub fn irot(turns: u8) -> Vec<u8> {
    boxed(b"irot", &[turns])
}

/// 0 mirrors left-right, 1 top-bottom.
pub fn imir(axis: u8) -> Vec<u8> {
    boxed(b"imir", &[axis])
}

pub fn clap(width: (u32, u32), height: (u32, u32), horiz_off: (i32, u32), vert_off: (i32, u32)) -> Vec<u8> {
    let mut payload = Vec::new();
    for field in [width.0, width.1, height.0, height.1] {
        payload.extend_from_slice(&field.to_be_bytes());
    }
    payload.extend_from_slice(&horiz_off.0.to_be_bytes());
    payload.extend_from_slice(&horiz_off.1.to_be_bytes());
    payload.extend_from_slice(&vert_off.0.to_be_bytes());
    payload.extend_from_slice(&vert_off.1.to_be_bytes());
    boxed(b"clap", &payload)
}

pub fn pixi(depths: &[u8]) -> Vec<u8> {
    let mut payload = vec![depths.len() as u8];
    payload.extend_from_slice(depths);
    full_boxed(b"pixi", 0, 0, &payload)
}

pub fn auxc(urn: &str) -> Vec<u8> {
    let mut payload = urn.as_bytes().to_vec();
    payload.push(0);
    full_boxed(b"auxC", 0, 0, &payload)
}

pub fn colr_nclx(primaries: u16, transfer: u16, matrix: u16, full_range: bool) -> Vec<u8> {
    let mut payload = b"nclx".to_vec();
    for field in [primaries, transfer, matrix] {
        payload.extend_from_slice(&field.to_be_bytes());
    }
    payload.push(if full_range { 0x80 } else { 0 });
    boxed(b"colr", &payload)
}

pub fn colr_icc(profile: &[u8]) -> Vec<u8> {
    let mut payload = b"prof".to_vec();
    payload.extend_from_slice(profile);
    boxed(b"colr", &payload)
}

// ---------------------------------------------------------------------------
// Files
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq)]
enum Storage {
    Mdat,
    /// Two extents with junk between them
    SplitMdat,
    Idat,
}

struct Item {
    id: u32,
    kind: [u8; 4],
    hidden: bool,
    data: Vec<u8>,
    storage: Storage,
}

/// Writes `ftyp`, `meta` and `mdat`, in that order.
pub struct HeifBuilder {
    major_brand: [u8; 4],
    compatible_brands: Vec<[u8; 4]>,
    handler: [u8; 4],
    primary: Option<u32>,
    items: Vec<Item>,
    properties: Vec<Vec<u8>>,
    /// (item, 1-based property index, essential)
    associations: Vec<(u32, u8, bool)>,
    references: Vec<([u8; 4], u32, Vec<u32>)>,
}

impl HeifBuilder {
    pub fn new() -> Self {
        Self {
            major_brand: *b"heic",
            compatible_brands: vec![*b"mif1", *b"heic"],
            handler: *b"pict",
            primary: None,
            items: Vec::new(),
            properties: Vec::new(),
            associations: Vec::new(),
            references: Vec::new(),
        }
    }

    pub fn brands(&mut self, major: &[u8; 4], compatible: &[[u8; 4]]) -> &mut Self {
        self.major_brand = *major;
        self.compatible_brands = compatible.to_vec();
        self
    }

    pub fn handler(&mut self, handler: &[u8; 4]) -> &mut Self {
        self.handler = *handler;
        self
    }

    pub fn primary(&mut self, id: u32) -> &mut Self {
        self.primary = Some(id);
        self
    }

    fn add(&mut self, id: u32, kind: &[u8; 4], data: &[u8], storage: Storage) -> &mut Self {
        self.items.push(Item { id, kind: *kind, hidden: false, data: data.to_vec(), storage });
        self
    }

    /// An item stored in `mdat`. Items without data get no `iloc` entry.
    pub fn item(&mut self, id: u32, kind: &[u8; 4], data: &[u8]) -> &mut Self {
        self.add(id, kind, data, Storage::Mdat)
    }

    /// An item whose data is split over two `mdat` extents.
    pub fn split_item(&mut self, id: u32, kind: &[u8; 4], data: &[u8]) -> &mut Self {
        self.add(id, kind, data, Storage::SplitMdat)
    }

    pub fn idat_item(&mut self, id: u32, kind: &[u8; 4], data: &[u8]) -> &mut Self {
        self.add(id, kind, data, Storage::Idat)
    }

    pub fn hide(&mut self, id: u32) -> &mut Self {
        for item in self.items.iter_mut().filter(|i| i.id == id) {
            item.hidden = true;
        }
        self
    }

    pub fn property(&mut self, id: u32, property: Vec<u8>, essential: bool) -> &mut Self {
        self.properties.push(property);
        let index = self.properties.len() as u8;
        self.associations.push((id, index, essential));
        self
    }

    pub fn reference(&mut self, kind: &[u8; 4], from: u32, to: &[u32]) -> &mut Self {
        self.references.push((*kind, from, to.to_vec()));
        self
    }

    /// A coded image whose decoded size equals its `ispe`.
    pub fn image(&mut self, id: u32, width: u16, height: u16, samples: &[u8]) -> &mut Self {
        self.item(id, b"hvc1", &bitstream(width, height, samples))
            .property(id, hvcc(), true)
            .property(id, ispe(u32::from(width), u32::from(height)), false)
    }

    /// An image filled with one sample value.
    pub fn flat_image(&mut self, id: u32, width: u16, height: u16, value: u8) -> &mut Self {
        let samples = vec![value; usize::from(width) * usize::from(height)];
        self.image(id, width, height, &samples)
    }

    /// A grid whose descriptor lives in `idat`.
    pub fn grid(&mut self, id: u32, rows: u8, columns: u8, output: (u32, u32), tiles: &[u32]) -> &mut Self {
        let mut descriptor = vec![0, 1, rows - 1, columns - 1];
        descriptor.extend_from_slice(&output.0.to_be_bytes());
        descriptor.extend_from_slice(&output.1.to_be_bytes());
        self.idat_item(id, b"grid", &descriptor)
            .property(id, ispe(output.0, output.1), false)
            .reference(b"dimg", id, tiles)
    }

    /// A hidden alpha image for `of`.
    pub fn alpha(&mut self, id: u32, of: u32, width: u16, height: u16, samples: &[u8]) -> &mut Self {
        self.image(id, width, height, samples)
            .property(id, auxc(ALPHA_URN), true)
            .reference(b"auxl", id, &[of])
            .hide(id)
    }

    fn meta(&self, mdat_payload_start: u32) -> Vec<u8> {
        let mut children = Vec::new();
        let mut hdlr = vec![0; 4];
        hdlr.extend_from_slice(&self.handler);
        hdlr.extend_from_slice(&[0; 13]);
        children.extend(full_boxed(b"hdlr", 0, 0, &hdlr));

        if let Some(primary) = self.primary {
            children.extend(full_boxed(b"pitm", 0, 0, &(primary as u16).to_be_bytes()));
        }

        let mut infes = (self.items.len() as u16).to_be_bytes().to_vec();
        for item in &self.items {
            let mut infe = (item.id as u16).to_be_bytes().to_vec();
            infe.extend_from_slice(&[0, 0]);
            infe.extend_from_slice(&item.kind);
            infe.push(0);
            infes.extend(full_boxed(b"infe", 2, u32::from(item.hidden), &infe));
        }
        children.extend(full_boxed(b"iinf", 0, 0, &infes));

        let (entries, _, _) = self.layout(mdat_payload_start);
        let mut iloc = vec![0x44, 0x00];
        iloc.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for (id, method, extents) in &entries {
            iloc.extend_from_slice(&(*id as u16).to_be_bytes());
            iloc.extend_from_slice(&u16::from(*method).to_be_bytes());
            iloc.extend_from_slice(&[0, 0]);
            iloc.extend_from_slice(&(extents.len() as u16).to_be_bytes());
            for extent in extents {
                iloc.extend_from_slice(&(extent.start as u32).to_be_bytes());
                iloc.extend_from_slice(&(extent.len() as u32).to_be_bytes());
            }
        }
        children.extend(full_boxed(b"iloc", 1, 0, &iloc));

        if !self.references.is_empty() {
            let mut irefs = Vec::new();
            for (kind, from, to) in &self.references {
                let mut payload = (*from as u16).to_be_bytes().to_vec();
                payload.extend_from_slice(&(to.len() as u16).to_be_bytes());
                for id in to {
                    payload.extend_from_slice(&(*id as u16).to_be_bytes());
                }
                irefs.extend(boxed(kind, &payload));
            }
            children.extend(full_boxed(b"iref", 0, 0, &irefs));
        }

        if !self.properties.is_empty() {
            let ipco = boxed(b"ipco", &self.properties.concat());
            let mut ipma = Vec::new();
            let mut ids: Vec<u32> = self.associations.iter().map(|a| a.0).collect();
            ids.sort_unstable();
            ids.dedup();
            ipma.extend_from_slice(&(ids.len() as u32).to_be_bytes());
            for id in ids {
                let mine: Vec<_> = self.associations.iter().filter(|a| a.0 == id).collect();
                ipma.extend_from_slice(&(id as u16).to_be_bytes());
                ipma.push(mine.len() as u8);
                for (_, index, essential) in mine {
                    ipma.push(u8::from(*essential) << 7 | index);
                }
            }
            let mut iprp = ipco;
            iprp.extend(full_boxed(b"ipma", 0, 0, &ipma));
            children.extend(boxed(b"iprp", &iprp));
        }

        let (_, _, idat) = self.layout(mdat_payload_start);
        if !idat.is_empty() {
            children.extend(boxed(b"idat", &idat));
        }
        full_boxed(b"meta", 0, 0, &children)
    }

    /// `iloc` entries (id, construction method, extents), `mdat` payload and
    /// `idat` payload.
    #[allow(clippy::type_complexity)]
    fn layout(&self, mdat_payload_start: u32) -> (Vec<(u32, u8, Vec<Range<usize>>)>, Vec<u8>, Vec<u8>) {
        let base = mdat_payload_start as usize;
        let mut entries = Vec::new();
        let mut mdat = Vec::new();
        let mut idat = Vec::new();
        for item in self.items.iter().filter(|i| !i.data.is_empty()) {
            match item.storage {
                Storage::Mdat => {
                    let start = base + mdat.len();
                    mdat.extend_from_slice(&item.data);
                    entries.push((item.id, 0, vec![start..start + item.data.len()]));
                },
                Storage::SplitMdat => {
                    let (head, tail) = item.data.split_at(item.data.len() / 2);
                    let first = base + mdat.len();
                    mdat.extend_from_slice(head);
                    mdat.extend_from_slice(b"junk");
                    let second = base + mdat.len();
                    mdat.extend_from_slice(tail);
                    entries.push((item.id, 0, vec![first..first + head.len(), second..second + tail.len()]));
                },
                Storage::Idat => {
                    let start = idat.len();
                    idat.extend_from_slice(&item.data);
                    entries.push((item.id, 1, vec![start..start + item.data.len()]));
                },
            }
        }
        (entries, mdat, idat)
    }

    pub fn build(&self) -> Vec<u8> {
        let mut ftyp = self.major_brand.to_vec();
        ftyp.extend_from_slice(&[0; 4]);
        for brand in &self.compatible_brands {
            ftyp.extend_from_slice(brand);
        }
        let mut out = boxed(b"ftyp", &ftyp);

        // offsets don't change the size of 'meta'
        let meta_len = self.meta(0).len();
        let mdat_payload_start = (out.len() + meta_len + 8) as u32;
        out.extend(self.meta(mdat_payload_start));
        let (_, mdat, _) = self.layout(mdat_payload_start);
        out.extend(boxed(b"mdat", &mdat));
        out
    }
}

/// Type and byte range of each top-level box.
pub fn top_level_boxes(file: &[u8]) -> Vec<([u8; 4], Range<usize>)> {
    let mut boxes = Vec::new();
    let mut pos = 0;
    while pos + 8 <= file.len() {
        let size = u32::from_be_bytes(file[pos..pos + 4].try_into().unwrap()) as usize;
        let name: [u8; 4] = file[pos + 4..pos + 8].try_into().unwrap();
        boxes.push((name, pos..pos + size));
        pos += size;
    }
    boxes
}

/// Luma samples of a plane, row by row, without padding.
pub fn samples(plane: &Plane) -> Vec<u8> {
    (0..plane.height()).flat_map(|y| plane.row(y).unwrap().to_vec()).collect()
}
