// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::{debug, warn};
use std::borrow::Cow;
use std::ops::Range;

use crate::bmff::{self, BmffBox};
use crate::boxes::{BoxType, FourCC, item_type};
use crate::codec::HevcConfig;
use crate::grid::{self, GridLayout};
use crate::image::{ColorInfo, MirrorAxis};
use crate::meta::{self, CleanAperture, ColourProperty, ConstructionMethod, ExtentRange, FileTypeBox, HeifMeta, ParseOptions};
use crate::{DecodeConfig, Error, ResourceTracker, Result, Stop, TryVec, Unstoppable};

/// An entry of the item list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemInfo<'data> {
    pub item_id: u32,
    pub item_type: FourCC,
    pub name: &'data str,
    /// Not meant to be shown on its own
    pub hidden: bool,
}

/// Zero-copy view of a HEIF container.
///
/// The box tree and item tables hold offsets into the caller's buffer; item
/// data is only copied when an item is split over several extents.
///
/// # Example
///
/// ```no_run
/// use zenheic_decode::HeifParser;
///
/// let bytes = std::fs::read("image.heic")?;
/// let parser = HeifParser::from_bytes(&bytes)?;
/// if let Some(id) = parser.primary_item_id() {
///     let coded = parser.item_data(id)?; // Cow::Borrowed for single-extent
///     println!("{} bytes, {:?}", coded.len(), parser.image_extents(id));
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct HeifParser<'data> {
    data: &'data [u8],
    boxes: TryVec<BmffBox>,
    ftyp: FileTypeBox,
    meta: HeifMeta<'data>,
    mdat_ranges: TryVec<Range<usize>>,
    config: DecodeConfig,
}

impl<'data> HeifParser<'data> {
    /// Parse a HEIF file held in memory, with no resource limits.
    pub fn from_bytes(data: &'data [u8]) -> Result<Self> {
        Self::from_bytes_with_config(data, &DecodeConfig::unlimited(), &Unstoppable)
    }

    /// Parse a HEIF file with resource limits and lenient-mode settings.
    pub fn from_bytes_with_config(data: &'data [u8], config: &DecodeConfig, stop: &dyn Stop) -> Result<Self> {
        let options = ParseOptions { lenient: config.lenient };
        let boxes = bmff::read_file_boxes(data)?;
        stop.check()?;

        // 'ftyp' box must occur first; see ISO 14496-12:2015 § 4.3.1
        let ftyp = match boxes.first() {
            Some(b) if b.name() == BoxType::FileTypeBox => {
                meta::read_ftyp(&data[b.payload_range()]).map_err(|e| match e {
                    Error::TruncatedInput => Error::MalformedBox("ftyp box too short"),
                    e => e,
                })?
            },
            _ => return Err(Error::InvalidData("'ftyp' box must occur first")),
        };
        if !ftyp.has_heif_brand() {
            if options.lenient {
                warn!("no HEIF brand in ftyp (major brand {})", ftyp.major_brand);
            } else {
                return Err(Error::InvalidData("ftyp has no HEIF brand"));
            }
        }

        let meta_box = bmff::find_unique(&boxes, BoxType::MetadataBox, "There should be zero or one meta boxes per ISO 14496-12:2015 § 8.11.1.1")?
            .ok_or(Error::MissingMeta)?;

        let mut mdat_ranges = TryVec::new();
        for b in boxes.iter() {
            match b.name() {
                BoxType::MediaDataBox => mdat_ranges.push(b.payload_range())?,
                BoxType::FileTypeBox | BoxType::MetadataBox => (),
                name => debug!("skipping top-level {:?}", name),
            }
        }

        let meta = meta::read_meta(meta_box, data, &options)?;
        stop.check()?;

        Ok(Self {
            data,
            boxes,
            ftyp,
            meta,
            mdat_ranges,
            config: config.clone(),
        })
    }

    pub fn major_brand(&self) -> FourCC {
        self.ftyp.major_brand
    }

    pub fn compatible_brands(&self) -> &[FourCC] {
        &self.ftyp.compatible_brands
    }

    /// The item named by 'pitm', if the file has one.
    pub fn primary_item_id(&self) -> Option<u32> {
        self.meta.primary_item_id
    }

    /// All items in 'iinf' order.
    pub fn items(&self) -> impl Iterator<Item = ItemInfo<'data>> + '_ {
        self.meta.item_infos.iter().map(|info| ItemInfo {
            item_id: info.item_id,
            item_type: info.item_type,
            name: info.name,
            hidden: info.hidden,
        })
    }

    /// Images meant to be shown on their own, primary first.
    ///
    /// Leaves out hidden items, metadata, thumbnails, auxiliary images and
    /// grid tiles.
    pub fn top_level_image_ids(&self) -> Result<Vec<u32>> {
        Ok(self.meta.top_level_items()?.to_vec())
    }

    /// Bytes of an item, concatenated across its extents.
    ///
    /// Borrowed from the input unless the item has several extents. Extents
    /// past the end of the input are [`Error::TruncatedInput`].
    pub fn item_data(&self, item_id: u32) -> Result<Cow<'data, [u8]>> {
        let location = self
            .meta
            .location(item_id)
            .ok_or(Error::InvalidData("item has no iloc entry"))?;
        let (source, source_name) = match location.construction_method {
            ConstructionMethod::File => (self.data, "file"),
            ConstructionMethod::Idat => (self.meta.idat.ok_or(Error::InvalidData("idat item without idat box"))?, "idat"),
        };

        if let [extent] = &location.extents[..] {
            return Ok(Cow::Borrowed(self.extent_bytes(source, location.construction_method, extent)?));
        }

        let mut total = 0usize;
        for extent in location.extents.iter() {
            total = total.saturating_add(self.extent_bytes(source, location.construction_method, extent)?.len());
        }
        let mut out = std::vec::Vec::new();
        out.try_reserve_exact(total)?;
        for extent in location.extents.iter() {
            out.extend_from_slice(self.extent_bytes(source, location.construction_method, extent)?);
        }
        debug!("item {item_id}: {} extents in {source_name}, {total} bytes", location.extents.len());
        Ok(Cow::Owned(out))
    }

    fn extent_bytes(&self, source: &'data [u8], method: ConstructionMethod, extent: &ExtentRange) -> Result<&'data [u8]> {
        // a file extent past the end means the file was cut short; idat is complete
        let out_of_range = match method {
            ConstructionMethod::File => Error::TruncatedInput,
            ConstructionMethod::Idat => Error::InvalidData("extent outside idat"),
        };
        let start = usize::try_from(extent.start()).map_err(|_| Error::TruncatedInput)?;
        let end = match extent {
            ExtentRange::WithLength(range) => usize::try_from(range.end).map_err(|_| Error::TruncatedInput)?,
            ExtentRange::ToEnd(_) if method == ConstructionMethod::File => self
                .mdat_ranges
                .iter()
                .find(|mdat| mdat.contains(&start))
                .map_or(source.len(), |mdat| mdat.end),
            ExtentRange::ToEnd(_) => source.len(),
        };
        match source.get(start..end) {
            Some(bytes) => Ok(bytes),
            None => Err(out_of_range),
        }
    }

    fn item_type(&self, item_id: u32) -> Option<FourCC> {
        self.meta.item_info(item_id).map(|info| info.item_type)
    }

    /// Width and height from the item's 'ispe' property.
    pub fn image_extents(&self, item_id: u32) -> Option<(u32, u32)> {
        self.meta.ispe(item_id).map(|e| (e.width, e.height))
    }

    /// The grid descriptor, for `grid` items.
    pub fn grid_layout(&self, item_id: u32) -> Result<Option<GridLayout>> {
        if !self.item_type(item_id).is_some_and(|t| t == item_type::GRID) {
            return Ok(None);
        }
        grid::read_grid(&self.item_data(item_id)?).map(Some)
    }

    /// Tile item ids of a `grid` item in raster order.
    pub fn grid_tile_ids(&self, item_id: u32) -> Result<Vec<u32>> {
        let layout = self.grid_layout(item_id)?.ok_or(Error::InvalidData("item is not a grid"))?;
        let tracker = ResourceTracker::new(&self.config);
        Ok(grid::grid_tiles(&self.meta, item_id, &layout, &tracker)?.to_vec())
    }

    /// Counter-clockwise rotation from 'irot', in degrees.
    pub fn rotation(&self, item_id: u32) -> Option<u16> {
        self.meta.rotation(item_id)
    }

    pub fn mirror(&self, item_id: u32) -> Option<MirrorAxis> {
        self.meta.mirror(item_id)
    }

    pub fn clean_aperture(&self, item_id: u32) -> Option<CleanAperture> {
        self.meta.clean_aperture(item_id)
    }

    /// The auxiliary item holding this image's alpha channel.
    pub fn alpha_item_id(&self, item_id: u32) -> Option<u32> {
        self.meta.alpha_item(item_id)
    }

    /// Whether the colour samples are premultiplied by the alpha item.
    pub fn is_premultiplied(&self, item_id: u32) -> bool {
        self.alpha_item_id(item_id)
            .is_some_and(|alpha| self.meta.is_premultiplied(item_id, alpha))
    }

    pub fn hevc_config(&self, item_id: u32) -> Option<&HevcConfig<'data>> {
        self.meta.hevc_config(item_id)
    }

    /// Bits per channel from 'pixi'.
    pub fn channel_depths(&self, item_id: u32) -> Option<&[u8]> {
        self.meta.channel_depths(item_id)
    }

    /// Colour description from 'colr'.
    pub fn color(&self, item_id: u32) -> Result<Option<ColorInfo>> {
        Ok(match self.meta.colour(item_id) {
            None => None,
            Some(&ColourProperty::Nclx {
                colour_primaries,
                transfer_characteristics,
                matrix_coefficients,
                full_range,
            }) => Some(ColorInfo::Nclx {
                colour_primaries,
                transfer_characteristics,
                matrix_coefficients,
                full_range,
            }),
            Some(ColourProperty::Icc(profile)) => {
                let mut icc = std::vec::Vec::new();
                icc.try_reserve_exact(profile.len())?;
                icc.extend_from_slice(profile);
                Some(ColorInfo::Icc(icc))
            },
        })
    }

    /// An indented listing of the box tree.
    pub fn describe_boxes(&self) -> std::string::String {
        let mut out = std::string::String::new();
        bmff::describe(&self.boxes, 0, &mut out);
        out
    }

    pub(crate) fn meta(&self) -> &HeifMeta<'data> {
        &self.meta
    }

    pub(crate) fn config(&self) -> &DecodeConfig {
        &self.config
    }

    pub(crate) fn options(&self) -> ParseOptions {
        ParseOptions { lenient: self.config.lenient }
    }
}

#[cfg(test)]
fn test_box(name: &[u8; 4], payload: &[u8]) -> std::vec::Vec<u8> {
    let mut out = (8 + payload.len() as u32).to_be_bytes().to_vec();
    out.extend_from_slice(name);
    out.extend_from_slice(payload);
    out
}

#[test]
fn ftyp_must_come_first_and_carry_a_heif_brand() {
    let meta_only = test_box(b"free", &[]);
    assert!(matches!(HeifParser::from_bytes(&meta_only), Err(Error::InvalidData(_))));

    let avif = test_box(b"ftyp", b"avif\0\0\0\0mif1");
    assert!(matches!(HeifParser::from_bytes(&avif), Err(Error::MissingMeta)));

    let not_heif = test_box(b"ftyp", b"isom\0\0\0\0mp41");
    assert!(matches!(HeifParser::from_bytes(&not_heif), Err(Error::InvalidData(_))));
    let lenient = DecodeConfig::unlimited().lenient(true);
    assert!(matches!(HeifParser::from_bytes_with_config(&not_heif, &lenient, &Unstoppable), Err(Error::MissingMeta)));

    assert!(matches!(HeifParser::from_bytes(&[]), Err(Error::TruncatedInput)));
    assert!(matches!(HeifParser::from_bytes(&avif[..10]), Err(Error::TruncatedInput)));
}
