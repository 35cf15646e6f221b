// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Item information, locations, references and properties from the `meta` box.

use arrayvec::ArrayVec;
use bitreader::BitReader;
use log::{debug, warn};
use std::convert::{TryFrom, TryInto as _};
use std::ops::{Range, RangeFrom};

use crate::bmff::BmffBox;
use crate::boxes::{BoxType, FourCC, item_type, reference_type};
use crate::codec::HevcConfig;
use crate::cursor::ByteCursor;
use crate::image::MirrorAxis;
use crate::{Error, Result, ToUsize, TryVec};

const HEIF_BRANDS: [&[u8; 4]; 8] = [b"mif1", b"msf1", b"heic", b"heix", b"heim", b"heis", b"hevc", b"hevx"];

const ALPHA_URNS: [&[u8]; 2] = [b"urn:mpeg:hevc:2015:auxid:1", b"urn:mpeg:mpegB:cicp:systems:auxiliary:alpha"];

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ParseOptions {
    /// Tolerate non-zero flags, trailing bytes, unknown handlers and brands
    pub(crate) lenient: bool,
}

/// File type box 'ftyp'.
#[derive(Debug)]
pub(crate) struct FileTypeBox {
    pub(crate) major_brand: FourCC,
    #[allow(unused)]
    pub(crate) minor_version: u32,
    pub(crate) compatible_brands: TryVec<FourCC>,
}

impl FileTypeBox {
    pub(crate) fn has_heif_brand(&self) -> bool {
        HEIF_BRANDS
            .iter()
            .any(|brand| self.major_brand == *brand || self.compatible_brands.iter().any(|b| b == brand))
    }
}

/// Used for 'infe' boxes within 'iinf' boxes
/// See ISO 14496-12:2015 § 8.11.6
/// Only versions {2, 3} are supported
#[derive(Debug)]
pub(crate) struct ItemInfoEntry<'a> {
    pub(crate) item_id: u32,
    pub(crate) item_type: FourCC,
    pub(crate) name: &'a str,
    pub(crate) hidden: bool,
}

/// Potential sizes (in bytes) of variable-sized fields of the 'iloc' box
/// See ISO 14496-12:2015 § 8.11.3
#[derive(Debug)]
enum IlocFieldSize {
    Zero,
    Four,
    Eight,
}

impl IlocFieldSize {
    const fn to_bits(&self) -> u8 {
        match self {
            Self::Zero => 0,
            Self::Four => 32,
            Self::Eight => 64,
        }
    }
}

impl TryFrom<u8> for IlocFieldSize {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            4 => Ok(Self::Four),
            8 => Ok(Self::Eight),
            _ => Err(Error::InvalidData("value must be in the set {0, 4, 8}")),
        }
    }
}

#[derive(PartialEq)]
enum IlocVersion {
    Zero,
    One,
    Two,
}

impl TryFrom<u8> for IlocVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::Zero),
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            _ => Err(Error::Unsupported("unsupported version in 'iloc' box")),
        }
    }
}

/// Where an item's bytes live.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) enum ConstructionMethod {
    /// Absolute offsets into the file
    File,
    /// Offsets into the `idat` box
    Idat,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ExtentRange {
    WithLength(Range<u64>),
    /// Length 0 in `iloc`: up to the end of the source
    ToEnd(RangeFrom<u64>),
}

impl ExtentRange {
    pub(crate) const fn start(&self) -> u64 {
        match self {
            Self::WithLength(r) => r.start,
            Self::ToEnd(r) => r.start,
        }
    }
}

/// Used for 'iloc' boxes
/// See ISO 14496-12:2015 § 8.11.3
/// `base_offset` is folded into the ranges in `extents`
#[derive(Debug)]
pub(crate) struct ItemLocation {
    pub(crate) item_id: u32,
    pub(crate) construction_method: ConstructionMethod,
    pub(crate) extents: TryVec<ExtentRange>,
}

/// All references of one type from one item.
/// See ISO 14496-12:2015 § 8.11.12
#[derive(Debug)]
pub(crate) struct ItemReference {
    pub(crate) reference_type: FourCC,
    pub(crate) from_item_id: u32,
    pub(crate) to_item_ids: TryVec<u32>,
}

/// Image spatial extents (dimensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ImageSpatialExtents {
    pub(crate) width: u32,
    pub(crate) height: u32,
}

/// Clean aperture ('clap'): a crop window given as rationals, centred on the
/// image and shifted by the offsets.
///
/// See ISO 14496-12:2015 § 12.1.4
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanAperture {
    pub width_n: u32,
    pub width_d: u32,
    pub height_n: u32,
    pub height_d: u32,
    pub horiz_off_n: i32,
    pub horiz_off_d: u32,
    pub vert_off_n: i32,
    pub vert_off_d: u32,
}

#[derive(Debug, PartialEq)]
pub(crate) enum ColourProperty<'a> {
    Nclx {
        colour_primaries: u16,
        transfer_characteristics: u16,
        matrix_coefficients: u16,
        full_range: bool,
    },
    Icc(&'a [u8]),
}

#[derive(Debug, PartialEq)]
pub(crate) struct AuxiliaryTypeProperty<'a> {
    aux_data: &'a [u8],
}

impl AuxiliaryTypeProperty<'_> {
    #[must_use]
    pub(crate) fn type_subtype(&self) -> (&[u8], &[u8]) {
        let split = self.aux_data.iter().position(|&b| b == b'\0').map(|pos| self.aux_data.split_at(pos));
        if let Some((aux_type, rest)) = split {
            (aux_type, &rest[1..])
        } else {
            (self.aux_data, &[])
        }
    }

    pub(crate) fn is_alpha(&self) -> bool {
        let aux_type = self.type_subtype().0;
        ALPHA_URNS.iter().any(|urn| *urn == aux_type)
    }
}

#[derive(Debug)]
pub(crate) enum ItemProperty<'a> {
    ImageSpatialExtents(ImageSpatialExtents),
    HevcConfig(HevcConfig<'a>),
    /// Recognised, but there is no AV1 path through the decoder bridge
    Av1Config,
    /// Counter-clockwise rotation in degrees
    Rotation(u16),
    Mirror(MirrorAxis),
    CleanAperture(CleanAperture),
    Channels(ArrayVec<u8, 16>),
    Colour(ColourProperty<'a>),
    AuxiliaryType(AuxiliaryTypeProperty<'a>),
    /// Kept so later property indices stay correct
    Unsupported(FourCC),
}

#[derive(Debug)]
struct Association {
    item_id: u32,
    essential: bool,
    property_index: u16,
}

/// Everything resolved from the `meta` box.
///
/// Strings and property payloads borrow from the input buffer.
#[derive(Debug)]
pub(crate) struct HeifMeta<'a> {
    pub(crate) handler_type: Option<FourCC>,
    pub(crate) primary_item_id: Option<u32>,
    pub(crate) item_infos: TryVec<ItemInfoEntry<'a>>,
    pub(crate) iloc_items: TryVec<ItemLocation>,
    pub(crate) item_references: TryVec<ItemReference>,
    properties: TryVec<ItemProperty<'a>>,
    associations: TryVec<Association>,
    pub(crate) idat: Option<&'a [u8]>,
}

impl<'a> HeifMeta<'a> {
    pub(crate) fn item_info(&self, item_id: u32) -> Option<&ItemInfoEntry<'a>> {
        self.item_infos.iter().find(|x| x.item_id == item_id)
    }

    pub(crate) fn location(&self, item_id: u32) -> Option<&ItemLocation> {
        self.iloc_items.iter().find(|x| x.item_id == item_id)
    }

    /// Properties associated with an item in `ipma` order, with their essential flag.
    pub(crate) fn properties_of(&self, item_id: u32) -> impl Iterator<Item = (&ItemProperty<'a>, bool)> {
        self.associations
            .iter()
            .filter(move |a| a.item_id == item_id && a.property_index != 0)
            .filter_map(move |a| {
                let property = self.properties.get(usize::from(a.property_index) - 1)?;
                Some((property, a.essential))
            })
    }

    fn find_property<T>(&self, item_id: u32, f: impl Fn(&ItemProperty<'a>) -> Option<T>) -> Option<T> {
        self.properties_of(item_id).find_map(|(p, _)| f(p))
    }

    pub(crate) fn ispe(&self, item_id: u32) -> Option<ImageSpatialExtents> {
        self.find_property(item_id, |p| match p {
            ItemProperty::ImageSpatialExtents(e) => Some(*e),
            _ => None,
        })
    }

    pub(crate) fn hevc_config(&self, item_id: u32) -> Option<&HevcConfig<'a>> {
        self.properties_of(item_id).find_map(|(p, _)| match p {
            ItemProperty::HevcConfig(c) => Some(c),
            _ => None,
        })
    }

    pub(crate) fn rotation(&self, item_id: u32) -> Option<u16> {
        self.find_property(item_id, |p| match p {
            ItemProperty::Rotation(degrees) => Some(*degrees),
            _ => None,
        })
    }

    pub(crate) fn mirror(&self, item_id: u32) -> Option<MirrorAxis> {
        self.find_property(item_id, |p| match p {
            ItemProperty::Mirror(axis) => Some(*axis),
            _ => None,
        })
    }

    pub(crate) fn clean_aperture(&self, item_id: u32) -> Option<CleanAperture> {
        self.find_property(item_id, |p| match p {
            ItemProperty::CleanAperture(clap) => Some(*clap),
            _ => None,
        })
    }

    pub(crate) fn colour(&self, item_id: u32) -> Option<&ColourProperty<'a>> {
        self.properties_of(item_id).find_map(|(p, _)| match p {
            ItemProperty::Colour(c) => Some(c),
            _ => None,
        })
    }

    pub(crate) fn channel_depths(&self, item_id: u32) -> Option<&[u8]> {
        self.properties_of(item_id).find_map(|(p, _)| match p {
            ItemProperty::Channels(c) => Some(c.as_slice()),
            _ => None,
        })
    }

    fn auxiliary_type(&self, item_id: u32) -> Option<&AuxiliaryTypeProperty<'a>> {
        self.properties_of(item_id).find_map(|(p, _)| match p {
            ItemProperty::AuxiliaryType(aux) => Some(aux),
            _ => None,
        })
    }

    /// Fail if an item carries an essential property this crate can't honour.
    pub(crate) fn check_essential(&self, item_id: u32, options: &ParseOptions) -> Result<()> {
        for (property, essential) in self.properties_of(item_id) {
            if let (true, ItemProperty::Unsupported(name)) = (essential, property) {
                if options.lenient {
                    warn!("ignoring essential property {name} of item {item_id}");
                } else {
                    debug!("item {item_id} requires unsupported property {name}");
                    return Err(Error::Unsupported("essential item property is not supported"));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn references(&self, from_item_id: u32, kind: &'static [u8; 4]) -> impl Iterator<Item = &ItemReference> {
        self.item_references
            .iter()
            .filter(move |r| r.from_item_id == from_item_id && r.reference_type == kind)
    }

    /// Target list of the only reference of `kind` from an item.
    pub(crate) fn single_reference(&self, from_item_id: u32, kind: &'static [u8; 4]) -> Result<Option<&[u32]>> {
        let mut refs = self.references(from_item_id, kind);
        let first = refs.next();
        if refs.next().is_some() {
            return Err(Error::InvalidData("more than one reference of the same type from one item"));
        }
        Ok(first.map(|r| &r.to_item_ids[..]))
    }

    /// Items with a reference of `kind` pointing at `to_item_id`.
    fn referencing(&self, to_item_id: u32, kind: &'static [u8; 4]) -> impl Iterator<Item = u32> {
        self.item_references
            .iter()
            .filter(move |r| r.reference_type == kind && r.to_item_ids.contains(&to_item_id))
            .map(|r| r.from_item_id)
    }

    /// The auxiliary alpha item of `item_id`, if there is one.
    pub(crate) fn alpha_item(&self, item_id: u32) -> Option<u32> {
        self.referencing(item_id, reference_type::AUXILIARY)
            .filter(|&aux_id| aux_id != item_id)
            .find(|&aux_id| self.auxiliary_type(aux_id).is_some_and(AuxiliaryTypeProperty::is_alpha))
    }

    /// See `prem` in MIAF § 7.3.5.2
    pub(crate) fn is_premultiplied(&self, item_id: u32, alpha_item_id: u32) -> bool {
        self.references(item_id, reference_type::PREMULTIPLIED)
            .any(|r| r.to_item_ids.contains(&alpha_item_id))
    }

    fn is_top_level(&self, info: &ItemInfoEntry<'_>) -> bool {
        let id = info.item_id;
        if info.hidden {
            return false;
        }
        if [item_type::EXIF, item_type::MIME, item_type::URI].iter().any(|t| info.item_type == *t) {
            return false;
        }
        let is_accessory = self.item_references.iter().any(|r| {
            r.from_item_id == id
                && (r.reference_type == reference_type::THUMBNAIL || r.reference_type == reference_type::AUXILIARY)
        });
        let is_derivation_input = self.referencing(id, reference_type::DERIVED_IMAGE).next().is_some();
        !is_accessory && !is_derivation_input
    }

    /// Images shown to a user, in `iinf` order with the primary item first.
    pub(crate) fn top_level_items(&self) -> Result<TryVec<u32>> {
        let mut ids = TryVec::new();
        if let Some(primary) = self.primary_item_id.and_then(|id| self.item_info(id)) {
            if self.is_top_level(primary) {
                ids.push(primary.item_id)?;
            }
        }
        for info in self.item_infos.iter() {
            if Some(info.item_id) != self.primary_item_id && self.is_top_level(info) {
                ids.push(info.item_id)?;
            }
        }
        Ok(ids)
    }
}

// Parse the extra fields for a full box whose flag fields must be zero.
fn read_fullbox_version_no_flags(src: &mut ByteCursor<'_>, options: &ParseOptions) -> Result<u8> {
    let (version, flags) = src.read_fullbox_extra()?;

    if flags != 0 && !options.lenient {
        return Err(Error::Unsupported("expected flags to be 0"));
    }

    Ok(version)
}

#[cfg_attr(debug_assertions, track_caller)]
fn check_parser_state(src: &ByteCursor<'_>, name: BoxType, options: &ParseOptions) -> Result<()> {
    match src.remaining() {
        0 => Ok(()),
        left if options.lenient => {
            warn!("dropping {left} trailing bytes in {name:?}");
            Ok(())
        },
        _ => Err(Error::InvalidData("unread box content or bad parser sync")),
    }
}

/// Bytes up to the first NUL (or the end), as UTF-8.
fn read_null_terminated<'a>(src: &mut ByteCursor<'a>) -> &'a str {
    let rest = src.rest();
    let bytes = rest.iter().position(|&b| b == 0).map_or(rest, |end| &rest[..end]);
    std::str::from_utf8(bytes).unwrap_or_else(|e| {
        warn!("ignoring non-UTF-8 string: {e}");
        ""
    })
}

/// Parse an ftyp box.
/// See ISO 14496-12:2015 § 4.3
pub(crate) fn read_ftyp(payload: &[u8]) -> Result<FileTypeBox> {
    let mut src = ByteCursor::new(payload);
    let major = src.read_u32()?;
    let minor = src.read_u32()?;
    let bytes_left = src.remaining();
    if bytes_left % 4 != 0 {
        return Err(Error::InvalidData("invalid ftyp size"));
    }
    let brand_count = bytes_left / 4;
    let mut brands = TryVec::with_capacity(brand_count)?;
    for _ in 0..brand_count {
        brands.push(src.read_u32()?.into())?;
    }
    Ok(FileTypeBox {
        major_brand: From::from(major),
        minor_version: minor,
        compatible_brands: brands,
    })
}

/// Parse the `meta` box and everything in it.
///
/// Every box here lies inside a complete top-level box, so a payload shorter
/// than its contents need is a malformed box rather than a truncated file.
pub(crate) fn read_meta<'a>(meta: &BmffBox, data: &'a [u8], options: &ParseOptions) -> Result<HeifMeta<'a>> {
    read_meta_boxes(meta, data, options).map_err(|e| match e {
        Error::TruncatedInput => Error::MalformedBox("box content shorter than its fields"),
        e => e,
    })
}

fn read_meta_boxes<'a>(meta: &BmffBox, data: &'a [u8], options: &ParseOptions) -> Result<HeifMeta<'a>> {
    let mut prefix = ByteCursor::new(meta.leading(data));
    let version = read_fullbox_version_no_flags(&mut prefix, options)?;
    if version != 0 {
        return Err(Error::Unsupported("unsupported meta version"));
    }

    let mut handler_type = None;
    let mut primary_item_id = None;
    let mut item_infos = None;
    let mut iloc_items = None;
    let mut item_references = TryVec::new();
    let mut iprp = None;
    let mut idat = None;

    for b in meta.children() {
        let payload = &data[b.payload_range()];
        match b.name() {
            BoxType::HandlerBox => {
                if handler_type.is_some() {
                    return Err(Error::InvalidData("There should be exactly one hdlr box per ISO 14496-12:2015 § 8.4.3.1"));
                }
                handler_type = Some(read_hdlr(payload)?);
            },
            BoxType::ItemInfoBox => {
                if item_infos.is_some() {
                    return Err(Error::InvalidData("There should be zero or one iinf boxes per ISO 14496-12:2015 § 8.11.6.1"));
                }
                item_infos = Some(read_iinf(b, data)?);
            },
            BoxType::ItemLocationBox => {
                if iloc_items.is_some() {
                    return Err(Error::InvalidData("There should be zero or one iloc boxes per ISO 14496-12:2015 § 8.11.3.1"));
                }
                iloc_items = Some(read_iloc(payload, options)?);
            },
            BoxType::PrimaryItemBox => {
                if primary_item_id.is_some() {
                    return Err(Error::InvalidData("There should be zero or one pitm boxes per ISO 14496-12:2015 § 8.11.4.1"));
                }
                primary_item_id = Some(read_pitm(payload, options)?);
            },
            BoxType::ItemReferenceBox => {
                item_references.append(&mut read_iref(b, data, options)?)?;
            },
            BoxType::ItemPropertiesBox => {
                if iprp.is_some() {
                    return Err(Error::InvalidData("There should be zero or one iprp boxes"));
                }
                iprp = Some(read_iprp(b, data, options)?);
            },
            BoxType::ItemDataBox => {
                if idat.is_some() {
                    return Err(Error::InvalidData("There should be zero or one idat boxes"));
                }
                idat = Some(payload);
            },
            other => debug!("{other:?} in meta (skipped)"),
        }
    }

    match handler_type {
        Some(handler) if handler == b"pict" => (),
        _ if options.lenient => warn!("meta handler is {handler_type:?}, not 'pict'"),
        Some(_) => return Err(Error::InvalidData("meta handler type must be 'pict'")),
        None => return Err(Error::InvalidData("Required hdlr box not present in meta box")),
    }

    let item_infos = item_infos.ok_or(Error::InvalidData("iinf missing"))?;
    let iloc_items = iloc_items.ok_or(Error::InvalidData("iloc missing"))?;

    for (i, info) in item_infos.iter().enumerate() {
        if item_infos[..i].iter().any(|x| x.item_id == info.item_id) {
            return Err(Error::InvalidData("duplicate item_id in iinf"));
        }
    }
    for (i, loc) in iloc_items.iter().enumerate() {
        if iloc_items[..i].iter().any(|x| x.item_id == loc.item_id) {
            return Err(Error::InvalidData("duplicate item_id in iloc"));
        }
    }
    if let Some(primary) = primary_item_id {
        if !item_infos.iter().any(|x| x.item_id == primary) {
            return Err(Error::InvalidData("primary_item_id not present in iinf box"));
        }
    }

    let (properties, associations) = iprp.unwrap_or_else(|| (TryVec::new(), TryVec::new()));

    Ok(HeifMeta {
        handler_type,
        primary_item_id,
        item_infos,
        iloc_items,
        item_references,
        properties,
        associations,
        idat,
    })
}

/// Parse a Handler Reference Box
/// See ISO 14496-12:2015 § 8.4.3
fn read_hdlr(payload: &[u8]) -> Result<FourCC> {
    let mut src = ByteCursor::new(payload);
    let (version, _) = src.read_fullbox_extra()?;
    if version != 0 {
        return Err(Error::Unsupported("hdlr version"));
    }
    src.skip(4)?; // pre_defined
    Ok(FourCC::from(src.read_u32()?))
}

/// Parse a Primary Item Box
/// See ISO 14496-12:2015 § 8.11.4
fn read_pitm(payload: &[u8], options: &ParseOptions) -> Result<u32> {
    let mut src = ByteCursor::new(payload);
    let version = read_fullbox_version_no_flags(&mut src, options)?;

    let item_id = match version {
        0 => src.read_u16()?.into(),
        1 => src.read_u32()?,
        _ => return Err(Error::Unsupported("unsupported pitm version")),
    };
    check_parser_state(&src, BoxType::PrimaryItemBox, options)?;

    Ok(item_id)
}

/// Parse an Item Information Box
/// See ISO 14496-12:2015 § 8.11.6
fn read_iinf<'a>(iinf: &BmffBox, data: &'a [u8]) -> Result<TryVec<ItemInfoEntry<'a>>> {
    let mut prefix = ByteCursor::new(iinf.leading(data));
    let (version, _) = prefix.read_fullbox_extra()?;
    let entry_count = match version {
        0 => prefix.read_u16()?.to_usize(),
        1 => prefix.read_u32()?.to_usize(),
        _ => return Err(Error::Unsupported("unsupported iinf version")),
    };
    if entry_count != iinf.children().len() {
        warn!("iinf declares {entry_count} entries but has {}", iinf.children().len());
    }

    let mut item_infos = TryVec::with_capacity(iinf.children().len())?;
    for b in iinf.children() {
        if b.name() != BoxType::ItemInfoEntry {
            return Err(Error::InvalidData("iinf box should contain only infe boxes"));
        }
        item_infos.push(read_infe(&data[b.payload_range()])?)?;
    }

    Ok(item_infos)
}

/// Parse an Item Info Entry
/// See ISO 14496-12:2015 § 8.11.6.2
fn read_infe(payload: &[u8]) -> Result<ItemInfoEntry<'_>> {
    let mut src = ByteCursor::new(payload);
    // Flag bit 0 marks items not meant to be displayed on their own
    let (version, flags) = src.read_fullbox_extra()?;

    // mif1 brand (see ISO 23008-12:2017 § 10.2.1) only requires v2 and 3
    let item_id = match version {
        2 => src.read_u16()?.into(),
        3 => src.read_u32()?,
        _ => return Err(Error::Unsupported("unsupported version in 'infe' box")),
    };

    let item_protection_index = src.read_u16()?;

    if item_protection_index != 0 {
        return Err(Error::Unsupported("protected items (infe.item_protection_index != 0) are not supported"));
    }

    let item_type = FourCC::from(src.read_u32()?);
    // content_type of mime items and uri_type of uri items follow the name
    let name = read_null_terminated(&mut src);
    let hidden = flags & 1 == 1;
    debug!("infe item_id {item_id} item_type: {item_type} hidden: {hidden}");

    Ok(ItemInfoEntry { item_id, item_type, name, hidden })
}

/// Parse an item location box inside a meta box
/// See ISO 14496-12:2015 § 8.11.3
fn read_iloc(payload: &[u8], options: &ParseOptions) -> Result<TryVec<ItemLocation>> {
    let mut src = ByteCursor::new(payload);
    let version: IlocVersion = read_fullbox_version_no_flags(&mut src, options)?.try_into()?;

    let mut iloc = BitReader::new(src.rest());

    let offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let length_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;
    let base_offset_size: IlocFieldSize = iloc.read_u8(4)?.try_into()?;

    let index_size: Option<IlocFieldSize> = match version {
        IlocVersion::One | IlocVersion::Two => Some(iloc.read_u8(4)?.try_into()?),
        IlocVersion::Zero => {
            let _reserved = iloc.read_u8(4)?;
            None
        },
    };

    let item_count = match version {
        IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
        IlocVersion::Two => iloc.read_u32(32)?,
    };

    // each item needs at least 6 bytes, so the count can't outgrow the payload
    let mut items = TryVec::with_capacity(item_count.to_usize().min(payload.len() / 6))?;

    for _ in 0..item_count {
        let item_id = match version {
            IlocVersion::Zero | IlocVersion::One => iloc.read_u32(16)?,
            IlocVersion::Two => iloc.read_u32(32)?,
        };

        // Version 0 has no construction_method field; it means file offsets.
        let construction_method = match version {
            IlocVersion::Zero => ConstructionMethod::File,
            IlocVersion::One | IlocVersion::Two => {
                let _reserved = iloc.read_u16(12)?;
                match iloc.read_u16(4)? {
                    0 => ConstructionMethod::File,
                    1 => ConstructionMethod::Idat,
                    2 => return Err(Error::Unsupported("construction_method 'item_offset' is not supported")),
                    _ => return Err(Error::InvalidData("construction_method is taken from the set 0, 1 or 2 per ISO 14496-12:2015 § 8.11.3.3")),
                }
            },
        };

        let data_reference_index = iloc.read_u16(16)?;

        if data_reference_index != 0 {
            return Err(Error::Unsupported("external file references (iloc.data_reference_index != 0) are not supported"));
        }

        let base_offset = iloc.read_u64(base_offset_size.to_bits())?;
        let extent_count = iloc.read_u16(16)?;

        if extent_count < 1 {
            return Err(Error::InvalidData("extent_count must have a value 1 or greater per ISO 14496-12:2015 § 8.11.3.3"));
        }

        let mut extents = TryVec::with_capacity(extent_count.to_usize())?;

        for _ in 0..extent_count {
            // Only meaningful for construction_method 2
            if let Some(index_size) = &index_size {
                let _extent_index = iloc.read_u64(index_size.to_bits())?;
            }

            // A zero-sized offset field reads as 0, the beginning of the source.
            let extent_offset = iloc.read_u64(offset_size.to_bits())?;
            let extent_length = iloc.read_u64(length_size.to_bits())?;

            let start = base_offset
                .checked_add(extent_offset)
                .ok_or(Error::InvalidData("offset calculation overflow"))?;
            let extent_range = if extent_length == 0 {
                ExtentRange::ToEnd(RangeFrom { start })
            } else {
                let end = start
                    .checked_add(extent_length)
                    .ok_or(Error::InvalidData("end calculation overflow"))?;
                ExtentRange::WithLength(Range { start, end })
            };

            extents.push(extent_range)?;
        }

        items.push(ItemLocation { item_id, construction_method, extents })?;
    }

    if iloc.remaining() == 0 {
        Ok(items)
    } else if options.lenient {
        warn!("dropping {} trailing bits in iloc", iloc.remaining());
        Ok(items)
    } else {
        Err(Error::InvalidData("invalid iloc size"))
    }
}

/// Parse an Item Reference Box
/// See ISO 14496-12:2015 § 8.11.12
fn read_iref(iref: &BmffBox, data: &[u8], options: &ParseOptions) -> Result<TryVec<ItemReference>> {
    let mut prefix = ByteCursor::new(iref.leading(data));
    let version = read_fullbox_version_no_flags(&mut prefix, options)?;
    if version > 1 {
        return Err(Error::Unsupported("iref version"));
    }

    let mut item_references = TryVec::with_capacity(iref.children().len())?;
    for b in iref.children() {
        let mut src = ByteCursor::new(&data[b.payload_range()]);
        let from_item_id = src.read_u16_or_u32(version == 1)?;
        let reference_count = src.read_u16()?;
        let mut to_item_ids = TryVec::with_capacity(reference_count.to_usize())?;
        for _ in 0..reference_count {
            let to_item_id = src.read_u16_or_u32(version == 1)?;
            if from_item_id == to_item_id {
                return Err(Error::InvalidData("from_item_id and to_item_id must be different"));
            }
            to_item_ids.push(to_item_id)?;
        }
        check_parser_state(&src, b.name(), options)?;
        item_references.push(ItemReference {
            reference_type: b.name().into(),
            from_item_id,
            to_item_ids,
        })?;
    }
    Ok(item_references)
}

type PropertyTables<'a> = (TryVec<ItemProperty<'a>>, TryVec<Association>);

fn read_iprp<'a>(iprp: &BmffBox, data: &'a [u8], options: &ParseOptions) -> Result<PropertyTables<'a>> {
    let mut properties = None;
    let mut associations = TryVec::new();

    for b in iprp.children() {
        match b.name() {
            BoxType::ItemPropertyContainerBox => {
                if properties.is_some() {
                    return Err(Error::InvalidData("There should be exactly one ipco box per iprp"));
                }
                properties = Some(read_ipco(b, data, options)?);
            },
            BoxType::ItemPropertyAssociationBox => {
                associations.append(&mut read_ipma(&data[b.payload_range()])?)?;
            },
            other if options.lenient => warn!("unexpected iprp child {other:?} (skipped)"),
            _ => return Err(Error::InvalidData("unexpected iprp child")),
        }
    }

    let properties = properties.ok_or(Error::InvalidData("iprp without ipco"))?;
    if associations
        .iter()
        .any(|a| usize::from(a.property_index) > properties.len())
    {
        return Err(Error::InvalidData("ipma references a property ipco doesn't have"));
    }
    Ok((properties, associations))
}

fn read_ipma(payload: &[u8]) -> Result<TryVec<Association>> {
    let mut src = ByteCursor::new(payload);
    let (version, flags) = src.read_fullbox_extra()?;

    let mut associations = TryVec::new();

    let entry_count = src.read_u32()?;
    for _ in 0..entry_count {
        let item_id = src.read_u16_or_u32(version >= 1)?;
        let association_count = src.read_u8()?;
        for _ in 0..association_count {
            let num_association_bytes = if flags & 1 == 1 { 2 } else { 1 };
            let association = src.read_bytes(num_association_bytes)?;
            let mut association = BitReader::new(association);
            let essential = association.read_bool()?;
            let property_index = association.read_u16(association.remaining().try_into()?)?;
            associations.push(Association {
                item_id,
                essential,
                property_index,
            })?;
        }
    }
    Ok(associations)
}

fn read_ipco<'a>(ipco: &BmffBox, data: &'a [u8], options: &ParseOptions) -> Result<TryVec<ItemProperty<'a>>> {
    let mut properties = TryVec::with_capacity(ipco.children().len())?;

    for b in ipco.children() {
        let payload = &data[b.payload_range()];
        // Must push for every property to have correct index for them
        let prop = match b.name() {
            BoxType::ImageSpatialExtentsBox => ItemProperty::ImageSpatialExtents(read_ispe(payload, options)?),
            BoxType::HevcConfigurationBox => ItemProperty::HevcConfig(HevcConfig::parse(payload)?),
            BoxType::AV1CodecConfigurationBox => ItemProperty::Av1Config,
            BoxType::ImageRotationBox => ItemProperty::Rotation(read_irot(payload, options)?),
            BoxType::ImageMirrorBox => ItemProperty::Mirror(read_imir(payload, options)?),
            BoxType::CleanApertureBox => ItemProperty::CleanAperture(read_clap(payload, options)?),
            BoxType::PixelInformationBox => ItemProperty::Channels(read_pixi(payload, options)?),
            BoxType::AuxiliaryTypeProperty => ItemProperty::AuxiliaryType(read_auxc(payload, options)?),
            BoxType::ColourInformationBox => match read_colr(payload)? {
                Some(colour) => ItemProperty::Colour(colour),
                None => ItemProperty::Unsupported(b.name().into()),
            },
            other => {
                debug!("{other:?} property (skipped)");
                ItemProperty::Unsupported(other.into())
            },
        };
        properties.push(prop)?;
    }
    Ok(properties)
}

/// Parse an Image Spatial Extents property box
/// See ISO/IEC 23008-12:2017 § 6.5.3
fn read_ispe(payload: &[u8], options: &ParseOptions) -> Result<ImageSpatialExtents> {
    let mut src = ByteCursor::new(payload);
    let _version = read_fullbox_version_no_flags(&mut src, options)?;

    let width = src.read_u32()?;
    let height = src.read_u32()?;

    // Validate dimensions are non-zero (0×0 images are invalid)
    if width == 0 || height == 0 {
        return Err(Error::InvalidData("ispe dimensions cannot be zero"));
    }
    check_parser_state(&src, BoxType::ImageSpatialExtentsBox, options)?;

    Ok(ImageSpatialExtents { width, height })
}

/// See ISO/IEC 23008-12:2017 § 6.5.10
fn read_irot(payload: &[u8], options: &ParseOptions) -> Result<u16> {
    let mut src = ByteCursor::new(payload);
    let angle = src.read_u8()? & 0b11;
    check_parser_state(&src, BoxType::ImageRotationBox, options)?;
    Ok(u16::from(angle) * 90)
}

/// See ISO/IEC 23008-12:2017 § 6.5.12
fn read_imir(payload: &[u8], options: &ParseOptions) -> Result<MirrorAxis> {
    let mut src = ByteCursor::new(payload);
    let axis = if src.read_u8()? & 1 == 0 {
        MirrorAxis::Vertical
    } else {
        MirrorAxis::Horizontal
    };
    check_parser_state(&src, BoxType::ImageMirrorBox, options)?;
    Ok(axis)
}

fn read_clap(payload: &[u8], options: &ParseOptions) -> Result<CleanAperture> {
    let mut src = ByteCursor::new(payload);
    let clap = CleanAperture {
        width_n: src.read_u32()?,
        width_d: src.read_u32()?,
        height_n: src.read_u32()?,
        height_d: src.read_u32()?,
        horiz_off_n: src.read_i32()?,
        horiz_off_d: src.read_u32()?,
        vert_off_n: src.read_i32()?,
        vert_off_d: src.read_u32()?,
    };
    if clap.width_d == 0 || clap.height_d == 0 || clap.horiz_off_d == 0 || clap.vert_off_d == 0 {
        return Err(Error::InvalidData("clap denominator is zero"));
    }
    check_parser_state(&src, BoxType::CleanApertureBox, options)?;
    Ok(clap)
}

fn read_pixi(payload: &[u8], options: &ParseOptions) -> Result<ArrayVec<u8, 16>> {
    let mut src = ByteCursor::new(payload);
    let version = read_fullbox_version_no_flags(&mut src, options)?;
    if version != 0 {
        return Err(Error::Unsupported("pixi version"));
    }

    let num_channels = usize::from(src.read_u8()?);
    let depths = src
        .read_bytes(num_channels)
        .map_err(|_| Error::InvalidData("invalid num_channels"))?;
    let mut channels = ArrayVec::new();
    channels
        .try_extend_from_slice(depths)
        .map_err(|_| Error::Unsupported("more than 16 channels in pixi"))?;

    check_parser_state(&src, BoxType::PixelInformationBox, options)?;
    Ok(channels)
}

fn read_auxc<'a>(payload: &'a [u8], options: &ParseOptions) -> Result<AuxiliaryTypeProperty<'a>> {
    let mut src = ByteCursor::new(payload);
    let version = read_fullbox_version_no_flags(&mut src, options)?;
    if version != 0 {
        return Err(Error::Unsupported("auxC version"));
    }

    Ok(AuxiliaryTypeProperty { aux_data: src.rest() })
}

/// Colour information, or `None` for colour types this crate doesn't know.
/// See ISO/IEC 14496-12:2015 § 12.1.5
fn read_colr(payload: &[u8]) -> Result<Option<ColourProperty<'_>>> {
    let mut src = ByteCursor::new(payload);
    let colour_type = FourCC::from(src.read_u32()?);
    Ok(match &colour_type.value {
        b"nclx" => Some(ColourProperty::Nclx {
            colour_primaries: src.read_u16()?,
            transfer_characteristics: src.read_u16()?,
            matrix_coefficients: src.read_u16()?,
            full_range: src.read_u8()? & 0x80 != 0,
        }),
        b"rICC" | b"prof" => Some(ColourProperty::Icc(src.rest())),
        _ => {
            debug!("colr type {colour_type} (skipped)");
            None
        },
    })
}

#[test]
fn iloc_v1_folds_base_offset_and_reads_idat_method() {
    let payload = [
        1, 0, 0, 0, // version 1
        0x44, 0x40, // offset 4, length 4, base_offset 4, index 0
        0, 2, // 2 items
        0, 1, 0, 0, 0, 0, 0, 0, 0, 0x10, 0, 2, // item 1, file, base 16, 2 extents
        0, 0, 0, 0, 0, 0, 0, 5, // +0, 5 bytes
        0, 0, 0, 8, 0, 0, 0, 0, // +8, to end
        0, 2, 0, 1, 0, 0, 0, 0, 0, 0, 0, 1, // item 2, idat, base 0, 1 extent
        0, 0, 0, 3, 0, 0, 0, 2, // +3, 2 bytes
    ];
    let items = read_iloc(&payload, &ParseOptions::default()).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].construction_method, ConstructionMethod::File);
    assert_eq!(items[0].extents[0], ExtentRange::WithLength(16..21));
    assert_eq!(items[0].extents[1], ExtentRange::ToEnd(24..));
    assert_eq!(items[1].construction_method, ConstructionMethod::Idat);
    assert_eq!(items[1].extents[0], ExtentRange::WithLength(3..5));
}

#[test]
fn iloc_rejects_item_offset_method() {
    let payload = [
        1, 0, 0, 0, 0x44, 0x00, 0, 1, // v1, 1 item
        0, 1, 0, 2, 0, 0, 0, 1, // item 1, method 2
        0, 0, 0, 0, 0, 0, 0, 1,
    ];
    assert!(matches!(read_iloc(&payload, &ParseOptions::default()), Err(Error::Unsupported(_))));
}

#[test]
fn ipma_reads_wide_and_narrow_indices() {
    let narrow = [0, 0, 0, 0, 0, 0, 0, 1, 0, 7, 2, 0x81, 0x02];
    let a = read_ipma(&narrow).unwrap();
    assert_eq!(a.len(), 2);
    assert_eq!((a[0].item_id, a[0].essential, a[0].property_index), (7, true, 1));
    assert_eq!((a[1].essential, a[1].property_index), (false, 2));

    let wide = [1, 0, 0, 1, 0, 0, 0, 1, 0, 0, 0, 9, 1, 0x80, 0x90];
    let a = read_ipma(&wide).unwrap();
    assert_eq!((a[0].item_id, a[0].essential, a[0].property_index), (9, true, 0x90));
}

#[test]
fn auxc_alpha_urns() {
    let hevc = AuxiliaryTypeProperty { aux_data: b"urn:mpeg:hevc:2015:auxid:1\0" };
    assert!(hevc.is_alpha());
    let mpegb = AuxiliaryTypeProperty { aux_data: b"urn:mpeg:mpegB:cicp:systems:auxiliary:alpha" };
    assert!(mpegb.is_alpha());
    let depth = AuxiliaryTypeProperty { aux_data: b"urn:mpeg:hevc:2015:auxid:2\0\x01" };
    assert!(!depth.is_alpha());
    assert_eq!(depth.type_subtype().1, &[1]);
}

#[test]
fn fixed_size_properties_reject_trailing_bytes_unless_lenient() {
    let strict = ParseOptions::default();
    let lenient = ParseOptions { lenient: true };
    assert!(matches!(read_irot(&[3, 0], &strict), Err(Error::InvalidData(_))));
    assert_eq!(read_irot(&[3, 0], &lenient).unwrap(), 270);
    assert_eq!(read_imir(&[1], &strict).unwrap(), MirrorAxis::Horizontal);
    let pixi = [0, 0, 0, 0, 3, 8, 8, 8, 0, 0];
    assert!(read_pixi(&pixi, &strict).is_err());
    assert_eq!(read_pixi(&pixi, &lenient).unwrap().as_slice(), &[8, 8, 8]);
    assert!(matches!(read_ispe(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1], &strict), Err(Error::InvalidData(_))));
}
