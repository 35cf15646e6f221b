// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::{Error, Result, ToU64, ToUsize};

/// Plane layout of decoded YCbCr (or monochrome) samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Monochrome,
    Yuv420,
    Yuv422,
    Yuv444,
}

impl PixelFormat {
    /// Map an HEVC `chroma_format_idc`.
    pub fn from_chroma_format_idc(idc: u8) -> Option<Self> {
        Some(match idc {
            0 => Self::Monochrome,
            1 => Self::Yuv420,
            2 => Self::Yuv422,
            3 => Self::Yuv444,
            _ => return None,
        })
    }

    pub const fn plane_count(self) -> usize {
        match self {
            Self::Monochrome => 1,
            _ => 3,
        }
    }

    /// Horizontal and vertical log2 subsampling of the chroma planes.
    pub const fn chroma_shift(self) -> (u32, u32) {
        match self {
            Self::Monochrome | Self::Yuv444 => (0, 0),
            Self::Yuv420 => (1, 1),
            Self::Yuv422 => (1, 0),
        }
    }

    /// Subsampling of plane `plane`; luma is never subsampled.
    pub(crate) const fn plane_shift(self, plane: usize) -> (u32, u32) {
        if plane == 0 { (0, 0) } else { self.chroma_shift() }
    }

    /// Size of plane `plane` of a `width` × `height` image.
    pub fn plane_size(self, plane: usize, width: u32, height: u32) -> (u32, u32) {
        let (sx, sy) = self.plane_shift(plane);
        (width.div_ceil(1 << sx), height.div_ceil(1 << sy))
    }

    /// Bytes needed for all planes of a tightly packed image.
    pub(crate) fn frame_bytes(self, width: u32, height: u32, bytes_per_sample: u8) -> u64 {
        (0..self.plane_count())
            .map(|p| {
                let (w, h) = self.plane_size(p, width, height);
                u64::from(w) * u64::from(h) * u64::from(bytes_per_sample)
            })
            .sum()
    }
}

/// Samples above 8 bits take two little-endian bytes.
pub(crate) const fn bytes_per_sample(bit_depth: u8) -> u8 {
    if bit_depth > 8 { 2 } else { 1 }
}

/// One plane of samples, rows `stride` bytes apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    width: u32,
    height: u32,
    stride: usize,
    bytes_per_sample: u8,
    data: Vec<u8>,
}

impl Plane {
    /// Wrap tightly packed rows.
    pub fn new(width: u32, height: u32, bytes_per_sample: u8, data: Vec<u8>) -> Result<Self> {
        let stride = width
            .to_usize()
            .checked_mul(usize::from(bytes_per_sample))
            .ok_or(Error::InvalidData("plane row size overflow"))?;
        Self::with_stride(width, height, bytes_per_sample, stride, data)
    }

    /// Wrap rows that start every `stride` bytes.
    pub fn with_stride(width: u32, height: u32, bytes_per_sample: u8, stride: usize, data: Vec<u8>) -> Result<Self> {
        if !matches!(bytes_per_sample, 1 | 2) {
            return Err(Error::InvalidData("bytes per sample must be 1 or 2"));
        }
        let row_bytes = width
            .to_usize()
            .checked_mul(usize::from(bytes_per_sample))
            .ok_or(Error::InvalidData("plane row size overflow"))?;
        if stride < row_bytes {
            return Err(Error::InvalidData("plane stride shorter than a row"));
        }
        let required = match height {
            0 => 0,
            h => stride
                .checked_mul((h - 1).to_usize())
                .and_then(|n| n.checked_add(row_bytes))
                .ok_or(Error::InvalidData("plane size overflow"))?,
        };
        if data.len() < required {
            return Err(Error::InvalidData("plane buffer smaller than its dimensions"));
        }
        Ok(Self { width, height, stride, bytes_per_sample, data })
    }

    /// A zero-filled, tightly packed plane, allocated fallibly.
    pub(crate) fn zeroed(width: u32, height: u32, bytes_per_sample: u8) -> Result<Self> {
        let size = width
            .to_usize()
            .checked_mul(height.to_usize())
            .and_then(|n| n.checked_mul(usize::from(bytes_per_sample)))
            .ok_or(Error::ResourceLimitExceeded("plane too large"))?;
        let mut data = Vec::new();
        data.try_reserve_exact(size)?;
        data.resize(size, 0);
        Self::new(width, height, bytes_per_sample, data)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Distance between the starts of consecutive rows, in bytes.
    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn bytes_per_sample(&self) -> u8 {
        self.bytes_per_sample
    }

    /// Raw buffer, including any row padding.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub(crate) fn row_bytes(&self) -> usize {
        self.width.to_usize() * usize::from(self.bytes_per_sample)
    }

    /// Row `y` without its padding, or `None` past the last row.
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        if y >= self.height {
            return None;
        }
        let start = y.to_usize() * self.stride;
        self.data.get(start..start + self.row_bytes())
    }

    pub(crate) fn row_mut(&mut self, y: u32) -> &mut [u8] {
        let start = y.to_usize() * self.stride;
        let end = start + self.row_bytes();
        &mut self.data[start..end]
    }

    /// The sample at (`x`, `y`).
    pub fn sample(&self, x: u32, y: u32) -> Option<u16> {
        if x >= self.width {
            return None;
        }
        let row = self.row(y)?;
        let at = x.to_usize() * usize::from(self.bytes_per_sample);
        Some(match self.bytes_per_sample {
            1 => u16::from(row[at]),
            _ => u16::from_le_bytes([row[at], row[at + 1]]),
        })
    }

    pub(crate) fn byte_size(&self) -> u64 {
        self.data.len().to_u64()
    }
}

/// A frame as produced by an [`ElementaryStreamDecoder`](crate::ElementaryStreamDecoder).
///
/// Planes are in Y, Cb, Cr order; chroma planes are sized for
/// `pixel_format`'s subsampling of the luma plane, rounding up.
#[derive(Debug)]
pub struct DecodedPlanes {
    pub pixel_format: PixelFormat,
    pub bit_depth: u8,
    pub planes: Vec<Plane>,
}

impl DecodedPlanes {
    pub fn width(&self) -> u32 {
        self.planes.first().map_or(0, Plane::width)
    }

    pub fn height(&self) -> u32 {
        self.planes.first().map_or(0, Plane::height)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.planes.len() != self.pixel_format.plane_count() {
            return Err(Error::InvalidData("decoder returned the wrong number of planes"));
        }
        if !(1..=16).contains(&self.bit_depth) {
            return Err(Error::InvalidData("decoder returned an impossible bit depth"));
        }
        let (width, height) = (self.width(), self.height());
        if width == 0 || height == 0 {
            return Err(Error::InvalidData("decoder returned an empty frame"));
        }
        let bps = bytes_per_sample(self.bit_depth);
        for (p, plane) in self.planes.iter().enumerate() {
            if plane.bytes_per_sample() != bps {
                return Err(Error::InvalidData("sample size doesn't match the bit depth"));
            }
            if (plane.width(), plane.height()) != self.pixel_format.plane_size(p, width, height) {
                return Err(Error::InvalidData("plane size doesn't match the pixel format"));
            }
        }
        Ok(())
    }

    pub(crate) fn byte_size(&self) -> u64 {
        self.planes.iter().map(Plane::byte_size).sum()
    }
}

/// Mirror direction ('imir').
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorAxis {
    /// About the vertical axis: left and right swap
    Vertical,
    /// About the horizontal axis: top and bottom swap
    Horizontal,
}

/// A geometric operation applied to a decoded image, in the order applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Counter-clockwise
    Rotate { degrees: u16 },
    Mirror(MirrorAxis),
    /// Clean aperture window, in the coordinates of the image before cropping
    Crop { x: u32, y: u32, width: u32, height: u32 },
}

/// Colour description ('colr').
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColorInfo {
    /// Code points from ITU-T H.273
    Nclx {
        colour_primaries: u16,
        transfer_characteristics: u16,
        matrix_coefficients: u16,
        full_range: bool,
    },
    Icc(Vec<u8>),
}

/// What the host expects of output buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatTable {
    /// Each row starts at a multiple of this many bytes
    pub row_alignment: usize,
    /// Largest width or height the host can display
    pub max_dimension: Option<u32>,
}

impl FormatTable {
    /// Tightly packed rows, and the canvas size limit of common browsers.
    pub const fn browser() -> Self {
        Self { row_alignment: 1, max_dimension: Some(16384) }
    }

    /// Tightly packed rows, no size limit.
    pub const fn native() -> Self {
        Self { row_alignment: 1, max_dimension: None }
    }

    pub fn with_row_alignment(mut self, bytes: usize) -> Self {
        self.row_alignment = bytes.max(1);
        self
    }

    pub fn with_max_dimension(mut self, max: u32) -> Self {
        self.max_dimension = Some(max);
        self
    }
}

impl Default for FormatTable {
    fn default() -> Self {
        Self::native()
    }
}

/// A fully decoded, transformed image.
#[derive(Debug)]
pub struct DecodedImage {
    item_id: u32,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    bit_depth: u8,
    planes: Vec<Plane>,
    alpha: Option<Plane>,
    premultiplied: bool,
    color: Option<ColorInfo>,
    transforms: Vec<Transform>,
}

impl DecodedImage {
    pub(crate) fn new(
        item_id: u32,
        frame: DecodedPlanes,
        alpha: Option<Plane>,
        premultiplied: bool,
        color: Option<ColorInfo>,
        transforms: Vec<Transform>,
    ) -> Self {
        Self {
            item_id,
            width: frame.width(),
            height: frame.height(),
            pixel_format: frame.pixel_format,
            bit_depth: frame.bit_depth,
            planes: frame.planes,
            alpha,
            premultiplied,
            color,
            transforms,
        }
    }

    /// The item this image was decoded from.
    pub fn item_id(&self) -> u32 {
        self.item_id
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn bit_depth(&self) -> u8 {
        self.bit_depth
    }

    /// Y, Cb, Cr (or just Y), as the decoder produced them.
    pub fn planes(&self) -> &[Plane] {
        &self.planes
    }

    /// Alpha at full resolution, from the auxiliary alpha item.
    pub fn alpha(&self) -> Option<&Plane> {
        self.alpha.as_ref()
    }

    /// Colour samples are already multiplied by alpha.
    pub fn is_premultiplied(&self) -> bool {
        self.premultiplied
    }

    pub fn color(&self) -> Option<&ColorInfo> {
        self.color.as_ref()
    }

    /// Rotation, mirroring and cropping applied, in order.
    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn into_planes(self) -> (Vec<Plane>, Option<Plane>) {
        (self.planes, self.alpha)
    }
}

#[test]
fn chroma_planes_round_up() {
    assert_eq!(PixelFormat::Yuv420.plane_size(1, 5, 3), (3, 2));
    assert_eq!(PixelFormat::Yuv422.plane_size(2, 5, 3), (3, 3));
    assert_eq!(PixelFormat::Yuv444.plane_size(1, 5, 3), (5, 3));
    assert_eq!(PixelFormat::Yuv420.frame_bytes(4, 4, 2), 2 * (16 + 4 + 4));
    assert_eq!(PixelFormat::from_chroma_format_idc(0), Some(PixelFormat::Monochrome));
    assert_eq!(PixelFormat::from_chroma_format_idc(4), None);
}

#[test]
fn plane_checks_buffer_size() {
    assert!(Plane::new(4, 2, 1, vec![0; 7]).is_err());
    assert!(Plane::new(4, 2, 3, vec![0; 24]).is_err());
    // padding after the last row is optional
    let plane = Plane::with_stride(3, 2, 2, 8, vec![1, 0, 2, 0, 3, 0, 9, 9, 4, 0, 5, 0, 6, 1]).unwrap();
    assert_eq!(plane.row(1), Some(&[4, 0, 5, 0, 6, 1][..]));
    assert_eq!(plane.sample(2, 1), Some(0x0106));
    assert_eq!(plane.sample(3, 0), None);
    assert_eq!(plane.row(2), None);
}

#[test]
fn decoded_planes_must_match_their_format() {
    let planes = |sizes: &[(u32, u32)]| {
        sizes
            .iter()
            .map(|&(w, h)| Plane::zeroed(w, h, 1).unwrap())
            .collect::<Vec<_>>()
    };
    let good = DecodedPlanes { pixel_format: PixelFormat::Yuv420, bit_depth: 8, planes: planes(&[(5, 3), (3, 2), (3, 2)]) };
    good.validate().unwrap();
    let short = DecodedPlanes { pixel_format: PixelFormat::Yuv420, bit_depth: 8, planes: planes(&[(5, 3), (3, 2)]) };
    assert!(short.validate().is_err());
    let wrong_chroma = DecodedPlanes { pixel_format: PixelFormat::Yuv444, bit_depth: 8, planes: planes(&[(5, 3), (3, 2), (3, 2)]) };
    assert!(wrong_chroma.validate().is_err());
    let deep = DecodedPlanes { pixel_format: PixelFormat::Monochrome, bit_depth: 10, planes: planes(&[(5, 3)]) };
    assert!(deep.validate().is_err());
}
