// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;

macro_rules! box_database {
    ($($(#[$attr:meta])* $boxenum:ident $boxtype:literal),*,) => {
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub(crate) enum BoxType {
            $($(#[$attr])* $boxenum),*,
            UnknownBox(u32),
        }

        impl From<u32> for BoxType {
            fn from(t: u32) -> Self {
                match t {
                    $($(#[$attr])* $boxtype => Self::$boxenum),*,
                    _ => Self::UnknownBox(t),
                }
            }
        }

        impl From<BoxType> for u32 {
            fn from(b: BoxType) -> Self {
                match b {
                    $($(#[$attr])* BoxType::$boxenum => $boxtype),*,
                    BoxType::UnknownBox(t) => t,
                }
            }
        }

        impl fmt::Debug for BoxType {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let fourcc: FourCC = From::from(*self);
                fmt::Debug::fmt(&fourcc, f)
            }
        }
    }
}

/// A four-character code, as used for box types, item types, brands and
/// reference types.
#[derive(Default, PartialEq, Eq, Clone, Copy, Hash)]
pub struct FourCC {
    pub value: [u8; 4],
}

impl FourCC {
    /// The code as text, if it is printable ASCII.
    pub fn as_str(&self) -> Option<&str> {
        if self.value.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            std::str::from_utf8(&self.value).ok()
        } else {
            None
        }
    }
}

impl From<u32> for FourCC {
    fn from(number: u32) -> Self {
        Self { value: number.to_be_bytes() }
    }
}

impl From<BoxType> for FourCC {
    fn from(t: BoxType) -> Self {
        let box_num: u32 = Into::into(t);
        From::from(box_num)
    }
}

impl From<[u8; 4]> for FourCC {
    fn from(value: [u8; 4]) -> Self {
        Self { value }
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.write_str(s),
            None => write!(f, "{:?}", self.value),
        }
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.write_str(s),
            None => write!(f, "0x{:08x}", u32::from_be_bytes(self.value)),
        }
    }
}

impl PartialEq<&[u8; 4]> for FourCC {
    fn eq(&self, other: &&[u8; 4]) -> bool {
        self.value.eq(*other)
    }
}

impl PartialEq<[u8; 4]> for FourCC {
    fn eq(&self, other: &[u8; 4]) -> bool {
        self.value.eq(other)
    }
}

box_database!(
    FileTypeBox                       0x6674_7970, // "ftyp"
    MediaDataBox                      0x6d64_6174, // "mdat"
    FreeSpaceBox                      0x6672_6565, // "free"
    SkipBox                           0x736b_6970, // "skip"
    MetadataBox                       0x6d65_7461, // "meta"
    HandlerBox                        0x6864_6c72, // "hdlr"
    DataInformationBox                0x6469_6e66, // "dinf"
    DataReferenceBox                  0x6472_6566, // "dref"
    PrimaryItemBox                    0x7069_746d, // "pitm"
    ItemInfoBox                       0x6969_6e66, // "iinf"
    ItemInfoEntry                     0x696e_6665, // "infe"
    ItemLocationBox                   0x696c_6f63, // "iloc"
    ItemReferenceBox                  0x6972_6566, // "iref"
    ItemDataBox                       0x6964_6174, // "idat"
    ItemPropertiesBox                 0x6970_7270, // "iprp"
    ItemPropertyContainerBox          0x6970_636f, // "ipco"
    ItemPropertyAssociationBox        0x6970_6d61, // "ipma"
    ImageSpatialExtentsBox            0x6973_7065, // "ispe"
    HevcConfigurationBox              0x6876_6343, // "hvcC"
    AV1CodecConfigurationBox          0x6176_3143, // "av1C"
    PixelInformationBox               0x7069_7869, // "pixi"
    ColourInformationBox              0x636f_6c72, // "colr"
    AuxiliaryTypeProperty             0x6175_7843, // "auxC"
    ImageRotationBox                  0x6972_6f74, // "irot"
    ImageMirrorBox                    0x696d_6972, // "imir"
    CleanApertureBox                  0x636c_6170, // "clap"
    UuidBox                           0x7575_6964, // "uuid"
);

/// Item types with a meaning in this crate.
pub(crate) mod item_type {
    pub(crate) const HEVC: &[u8; 4] = b"hvc1";
    pub(crate) const GRID: &[u8; 4] = b"grid";
    pub(crate) const IDENTITY: &[u8; 4] = b"iden";
    pub(crate) const OVERLAY: &[u8; 4] = b"iovl";
    pub(crate) const EXIF: &[u8; 4] = b"Exif";
    pub(crate) const MIME: &[u8; 4] = b"mime";
    pub(crate) const URI: &[u8; 4] = b"uri ";
}

/// Item reference types with a meaning in this crate.
pub(crate) mod reference_type {
    pub(crate) const DERIVED_IMAGE: &[u8; 4] = b"dimg";
    pub(crate) const THUMBNAIL: &[u8; 4] = b"thmb";
    pub(crate) const AUXILIARY: &[u8; 4] = b"auxl";
    pub(crate) const PREMULTIPLIED: &[u8; 4] = b"prem";
}

#[test]
fn box_type_round_trips_through_u32() {
    let t = BoxType::from(u32::from_be_bytes(*b"iloc"));
    assert_eq!(t, BoxType::ItemLocationBox);
    assert_eq!(FourCC::from(t), b"iloc");
    let unknown = BoxType::from(u32::from_be_bytes(*b"zzzz"));
    assert_eq!(unknown, BoxType::UnknownBox(u32::from_be_bytes(*b"zzzz")));
    assert_eq!(format!("{unknown:?}"), "zzzz");
}

#[test]
fn fourcc_display_escapes_binary_codes() {
    assert_eq!(FourCC::from(*b"uri ").to_string(), "uri ");
    assert_eq!(FourCC::from([0, 1, 2, 3]).to_string(), "0x00010203");
}
