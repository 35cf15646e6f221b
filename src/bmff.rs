// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Box tree construction.
//!
//! The tree holds byte ranges into the caller's buffer rather than copies,
//! so building it never allocates more than one node per box.

use log::debug;
use std::ops::Range;

use crate::boxes::{BoxType, FourCC};
use crate::cursor::ByteCursor;
use crate::{Error, Result, ToU64, TryVec};

/// Containers nested deeper than this are rejected.
const MAX_BOX_DEPTH: usize = 16;

/// Basic ISO box structure.
///
/// HEIF files are a sequence of possibly-nested 'box' structures.  Each box
/// begins with a header describing the length of the box's data and a
/// four-byte box type which identifies the type of the box.
///
/// See ISO 14496-12:2015 § 4.2
#[derive(Debug, Clone, Copy)]
pub(crate) struct BoxHeader {
    /// Box type.
    pub(crate) name: BoxType,
    /// Size of the box in bytes, header included.
    pub(crate) size: u64,
    /// Offset to the start of the contained data (or header size).
    pub(crate) offset: u64,
    /// Absolute position of the box in the file.
    pub(crate) start: usize,
    /// Uuid for extended type.
    #[allow(unused)]
    pub(crate) uuid: Option<[u8; 16]>,
}

impl BoxHeader {
    /// 4-byte size + 4-byte type
    const MIN_SIZE: u64 = 8;
    /// 4-byte size + 4-byte type + 8-byte size
    const MIN_LARGE_SIZE: u64 = 16;
}

/// Contents of a box: either nested boxes, or opaque bytes to be interpreted
/// later by whoever knows the box type.
#[derive(Debug)]
pub(crate) enum BoxBody {
    Container {
        /// Bytes between the header and the first child (full-box version,
        /// flags and entry counts).
        prefix: Range<usize>,
        children: TryVec<BmffBox>,
    },
    Leaf(Range<usize>),
}

#[derive(Debug)]
pub(crate) struct BmffBox {
    pub(crate) head: BoxHeader,
    pub(crate) body: BoxBody,
}

impl BmffBox {
    pub(crate) const fn name(&self) -> BoxType {
        self.head.name
    }

    /// Byte range of everything after the header.
    pub(crate) fn payload_range(&self) -> Range<usize> {
        match &self.body {
            BoxBody::Leaf(range) => range.clone(),
            BoxBody::Container { prefix, children } => {
                let end = children.iter().last().map_or(prefix.end, |c| c.end());
                prefix.start..end
            },
        }
    }

    fn end(&self) -> usize {
        // size was validated against the enclosing range when the box was read
        self.head.start + self.head.size as usize
    }

    pub(crate) fn children(&self) -> &[BmffBox] {
        match &self.body {
            BoxBody::Container { children, .. } => children,
            BoxBody::Leaf(_) => &[],
        }
    }

    /// Prefix bytes of a container, payload of a leaf.
    pub(crate) fn leading<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        match &self.body {
            BoxBody::Container { prefix, .. } => &data[prefix.clone()],
            BoxBody::Leaf(range) => &data[range.clone()],
        }
    }
}

/// Number of bytes preceding the first child box of a known container, or
/// `None` for boxes which are not containers.
fn container_prefix_len(name: BoxType, payload: &[u8]) -> Result<Option<usize>> {
    Ok(Some(match name {
        BoxType::ItemPropertiesBox
        | BoxType::ItemPropertyContainerBox
        | BoxType::DataInformationBox => 0,
        BoxType::MetadataBox | BoxType::ItemReferenceBox => 4,
        BoxType::DataReferenceBox => 8,
        BoxType::ItemInfoBox => {
            let version = *payload.first().ok_or(Error::MalformedBox("iinf box is empty"))?;
            if version == 0 { 6 } else { 8 }
        },
        _ => return Ok(None),
    }))
}

/// Read and parse a box header at the cursor position.
///
/// `end` is the end of the enclosing container; a box with size 0 extends up
/// to it. See ISO 14496-12:2015 § 4.2
fn read_box_header(src: &mut ByteCursor<'_>, end: usize) -> Result<BoxHeader> {
    let start = src.position();
    let size32 = src.read_u32()?;
    let name = BoxType::from(src.read_u32()?);
    let size = match size32 {
        // extends to the end of the enclosing container, usually the last mdat
        0 => (end - start).to_u64(),
        1 => {
            let size64 = src.read_u64()?;
            if size64 < BoxHeader::MIN_LARGE_SIZE {
                return Err(Error::MalformedBox("malformed wide size"));
            }
            size64
        },
        _ => {
            if u64::from(size32) < BoxHeader::MIN_SIZE {
                return Err(Error::MalformedBox("malformed size"));
            }
            u64::from(size32)
        },
    };
    let mut offset = match size32 {
        1 => BoxHeader::MIN_LARGE_SIZE,
        _ => BoxHeader::MIN_SIZE,
    };
    let uuid = if name == BoxType::UuidBox {
        if size >= offset + 16 {
            let mut buffer = [0u8; 16];
            buffer.copy_from_slice(src.read_bytes(16)?);
            offset += 16;
            Some(buffer)
        } else {
            debug!("malformed uuid, skipping");
            None
        }
    } else {
        None
    };
    if offset > size {
        return Err(Error::MalformedBox("box size smaller than its header"));
    }
    Ok(BoxHeader { name, size, offset, start, uuid })
}

/// Parse the boxes of a whole file.
///
/// Top-level boxes running past the end of `data` mean the file was cut
/// short, so they are reported as [`Error::TruncatedInput`].
pub(crate) fn read_file_boxes(data: &[u8]) -> Result<TryVec<BmffBox>> {
    if data.is_empty() {
        return Err(Error::TruncatedInput);
    }
    read_boxes(data, 0..data.len(), 0)
}

fn read_boxes(data: &[u8], range: Range<usize>, depth: usize) -> Result<TryVec<BmffBox>> {
    if depth > MAX_BOX_DEPTH {
        return Err(Error::MalformedBox("boxes nested too deeply"));
    }
    let top_level = depth == 0;
    // inside a parent, running out of bytes is the parent's fault
    let overrun = if top_level {
        Error::TruncatedInput
    } else {
        Error::MalformedBox("child box exceeds its parent")
    };

    let mut src = ByteCursor::new(&data[..range.end]);
    src.seek(range.start)?;

    let mut boxes = TryVec::new();
    while src.remaining() > 0 {
        let head = match read_box_header(&mut src, range.end) {
            Ok(head) => head,
            Err(Error::TruncatedInput) => return Err(overrun),
            Err(e) => return Err(e),
        };
        let available = (range.end - head.start).to_u64();
        if head.size > available {
            debug!("{:?} claims {} bytes, {} available", head.name, head.size, available);
            return Err(overrun);
        }
        let content_start = head.start + head.offset as usize;
        let content_end = head.start + head.size as usize;
        let payload = &data[content_start..content_end];

        let body = match container_prefix_len(head.name, payload)? {
            Some(prefix_len) => {
                if prefix_len > payload.len() {
                    return Err(Error::MalformedBox("container header exceeds box"));
                }
                let prefix = content_start..content_start + prefix_len;
                let children = read_boxes(data, prefix.end..content_end, depth + 1)?;
                BoxBody::Container { prefix, children }
            },
            _ => BoxBody::Leaf(content_start..content_end),
        };
        src.seek(content_end)?;
        boxes.push(BmffBox { head, body })?;
    }
    Ok(boxes)
}

/// Find the only child of the given type.
pub(crate) fn find_unique<'b>(boxes: &'b [BmffBox], name: BoxType, what: &'static str) -> Result<Option<&'b BmffBox>> {
    let mut found = None;
    for b in boxes.iter().filter(|b| b.name() == name) {
        if found.is_some() {
            return Err(Error::InvalidData(what));
        }
        found = Some(b);
    }
    Ok(found)
}

/// Render a box tree, one box per line, for diagnostics.
pub(crate) fn describe(boxes: &[BmffBox], depth: usize, out: &mut std::string::String) {
    use std::fmt::Write as _;
    for b in boxes {
        let name: FourCC = b.name().into();
        let _ = writeln!(out, "{:indent$}{} @{} size={}", "", name, b.head.start, b.head.size, indent = depth * 2);
        describe(b.children(), depth + 1, out);
    }
}

#[cfg(test)]
fn raw_box(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
    let mut out = ((payload.len() + 8) as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

#[test]
fn nested_containers_keep_absolute_ranges() {
    let ispe = raw_box(b"ispe", &[0, 0, 0, 0, 0, 0, 0, 4, 0, 0, 0, 2]);
    let ipco = raw_box(b"ipco", &ispe);
    let iprp = raw_box(b"iprp", &ipco);
    let mut meta_payload = vec![0, 0, 0, 0];
    meta_payload.extend_from_slice(&iprp);
    let mut file = raw_box(b"ftyp", b"heic\0\0\0\0mif1");
    let meta_start = file.len();
    file.extend_from_slice(&raw_box(b"meta", &meta_payload));

    let boxes = read_file_boxes(&file).unwrap();
    assert_eq!(boxes.len(), 2);
    let meta = &boxes[1];
    assert_eq!(meta.name(), BoxType::MetadataBox);
    assert_eq!(meta.head.start, meta_start);
    let ispe_box = &meta.children()[0].children()[0].children()[0];
    assert_eq!(ispe_box.name(), BoxType::ImageSpatialExtentsBox);
    // 3 nested headers (meta, iprp, ipco) + meta's full-box prefix + own header
    assert_eq!(ispe_box.payload_range().start, meta_start + 8 + 4 + 8 + 8 + 8);
    assert_eq!(ispe_box.payload_range().len(), 12);
}

#[test]
fn size_zero_extends_to_parent_end() {
    let mut file = raw_box(b"ftyp", b"heic\0\0\0\0");
    file.extend_from_slice(&[0, 0, 0, 0]);
    file.extend_from_slice(b"mdat");
    file.extend_from_slice(&[1, 2, 3]);
    let boxes = read_file_boxes(&file).unwrap();
    assert_eq!(boxes[1].name(), BoxType::MediaDataBox);
    assert_eq!(boxes[1].payload_range(), file.len() - 3..file.len());
}

#[test]
fn largesize_header() {
    let mut file = std::vec::Vec::new();
    file.extend_from_slice(&1u32.to_be_bytes());
    file.extend_from_slice(b"free");
    file.extend_from_slice(&18u64.to_be_bytes());
    file.extend_from_slice(&[7, 7]);
    let boxes = read_file_boxes(&file).unwrap();
    assert_eq!(boxes[0].head.offset, 16);
    assert_eq!(boxes[0].payload_range(), 16..18);
}

#[test]
fn overruns_are_truncation_at_top_level_and_malformed_inside() {
    let file = raw_box(b"ftyp", b"heic\0\0\0\0");
    assert!(matches!(read_file_boxes(&file[..file.len() - 1]), Err(Error::TruncatedInput)));
    assert!(matches!(read_file_boxes(&file[..5]), Err(Error::TruncatedInput)));
    assert!(matches!(read_file_boxes(&[]), Err(Error::TruncatedInput)));

    // child claims 100 bytes inside a complete 20-byte parent
    let mut child = 100u32.to_be_bytes().to_vec();
    child.extend_from_slice(b"ipco");
    let iprp = raw_box(b"iprp", &child);
    assert!(matches!(read_file_boxes(&iprp), Err(Error::MalformedBox(_))));

    let tiny = [0, 0, 0, 4, b'f', b'r', b'e', b'e'];
    assert!(matches!(read_file_boxes(&tiny), Err(Error::MalformedBox(_))));
}

#[test]
fn deep_nesting_is_rejected() {
    let mut inner = std::vec::Vec::new();
    for _ in 0..(MAX_BOX_DEPTH + 2) {
        inner = raw_box(b"dinf", &inner);
    }
    assert!(matches!(read_file_boxes(&inner), Err(Error::MalformedBox(_))));
}
