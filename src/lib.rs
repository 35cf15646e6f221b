#![deny(unsafe_code)]
//! HEIC/HEIF still-image container parsing and decoding front-end.
//!
//! The container is parsed without copying its payload: item data is handed to
//! the caller's HEVC elementary-stream decoder straight from the input buffer
//! whenever it is stored contiguously. Grid tiles are decoded (in parallel with
//! the `threads` feature), stitched, and the item's rotation, mirroring and
//! clean aperture are applied before the planes are laid out for the host.
//!
//! ```no_run
//! use zenheic_decode::{DecodedPlanes, ElementaryStreamDecoder, FormatTable, HeicDecoder};
//! # fn my_hevc_decoder(_: &zenheic_decode::CodecConfig<'_>, _: &[u8])
//! #     -> Result<DecodedPlanes, zenheic_decode::DecodeFailure> { unimplemented!() }
//! let bytes = std::fs::read("image.heic")?;
//! let decoder = HeicDecoder::new(my_hevc_decoder, FormatTable::native());
//! let image = decoder.one(&bytes)?;
//! println!("{}x{}", image.width(), image.height());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::convert::TryInto as _;

mod bmff;
mod boxes;
mod codec;
mod compose;
mod cursor;
mod decoder;
mod grid;
mod image;
mod meta;
mod parser;

pub use crate::boxes::FourCC;
pub use crate::codec::{Codec, CodecConfig, ElementaryStreamDecoder, HevcConfig, annexb_stream};
pub use crate::decoder::{
    DecodedSet, HeicDecoder, ItemFailure, decode_all, decode_all_with_config, decode_one, decode_one_with_config,
};
pub use crate::grid::GridLayout;
pub use crate::image::{ColorInfo, DecodedImage, DecodedPlanes, FormatTable, MirrorAxis, PixelFormat, Plane, Transform};
pub use crate::meta::CleanAperture;
pub use crate::parser::{HeifParser, ItemInfo};

pub use enough::{Stop, StopReason, Unstoppable};

/// A trait to indicate a type can be infallibly converted to `u64`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
trait ToU64 {
    fn to_u64(self) -> u64;
}

/// Statically verify that the platform `usize` can fit within a `u64`.
/// If the size won't fit on the given platform, this will fail at compile time, but if a type
/// which can fail `TryInto<usize>` is used, it may panic.
impl ToU64 for usize {
    fn to_u64(self) -> u64 {
        const _: () = assert!(std::mem::size_of::<usize>() <= std::mem::size_of::<u64>());
        self.try_into().ok().unwrap_or(u64::MAX)
    }
}

/// A trait to indicate a type can be infallibly converted to `usize`.
/// This should only be implemented for infallible conversions, so only unsigned types are valid.
pub(crate) trait ToUsize {
    fn to_usize(self) -> usize;
}

macro_rules! impl_to_usize_from {
    ( $from_type:ty ) => {
        impl ToUsize for $from_type {
            fn to_usize(self) -> usize {
                const _: () = assert!(std::mem::size_of::<$from_type>() <= std::mem::size_of::<usize>());
                self.try_into().ok().unwrap_or(usize::MAX)
            }
        }
    };
}

impl_to_usize_from!(u8);
impl_to_usize_from!(u16);
impl_to_usize_from!(u32);

#[doc(hidden)]
pub type TryVec<T> = fallible_collections::TryVec<T>;

/// Error reported by an [`ElementaryStreamDecoder`].
pub type DecodeFailure = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Describes container and decode failures.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// The buffer ends before the data it declares.
    TruncatedInput,
    /// A box is inconsistent with its parent or has an impossible size.
    MalformedBox(&'static str),
    /// No top-level `meta` box.
    MissingMeta,
    /// No `pitm` box, so there is no primary image to decode.
    MissingPrimaryItem,
    /// A grid's rows × columns doesn't match its number of tiles.
    GridCardinality {
        item_id: u32,
        expected: u32,
        actual: u32,
    },
    /// The item is coded with something other than HEVC.
    UnsupportedCodec { item_id: u32, item_type: FourCC },
    /// The elementary-stream decoder rejected an item or tile.
    TileDecode { item_id: u32, cause: DecodeFailure },
    /// Parse error caused by corrupt or malformed data.
    InvalidData(&'static str),
    /// Parse error caused by limited support rather than invalid data.
    Unsupported(&'static str),
    /// Out of memory
    OutOfMemory,
    /// Resource limit exceeded during parsing or decoding
    ResourceLimitExceeded(&'static str),
    /// Operation was stopped/cancelled
    Stopped(enough::StopReason),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            Self::MalformedBox(s) | Self::InvalidData(s) | Self::Unsupported(s) | Self::ResourceLimitExceeded(s) => s,
            Self::TruncatedInput => "truncated input",
            Self::MissingMeta => "missing meta box",
            Self::MissingPrimaryItem => "missing primary item",
            Self::GridCardinality { item_id, expected, actual } => {
                return write!(f, "grid item {item_id} declares {expected} tiles but references {actual}");
            },
            Self::UnsupportedCodec { item_id, item_type } => {
                return write!(f, "item {item_id} has unsupported coding '{item_type}'");
            },
            Self::TileDecode { item_id, cause } => return write!(f, "decoding item {item_id} failed: {cause}"),
            Self::OutOfMemory => "OOM",
            Self::Stopped(reason) => return write!(f, "Stopped: {}", reason),
        };
        f.write_str(msg)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TileDecode { cause, .. } => Some(&**cause),
            _ => None,
        }
    }
}

impl From<bitreader::BitReaderError> for Error {
    #[cold]
    #[cfg_attr(debug_assertions, track_caller)]
    fn from(err: bitreader::BitReaderError) -> Self {
        log::warn!("bitreader: {err}");
        debug_assert!(!matches!(err, bitreader::BitReaderError::TooManyBitsForType { .. })); // bug
        Self::InvalidData("truncated bits")
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Self::InvalidData("invalid utf8")
    }
}

impl From<std::num::TryFromIntError> for Error {
    fn from(_: std::num::TryFromIntError) -> Self {
        Self::Unsupported("integer conversion failed")
    }
}

// also covers fallible_collections::TryReserveError, a re-export of this type
impl From<std::collections::TryReserveError> for Error {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

impl From<enough::StopReason> for Error {
    fn from(reason: enough::StopReason) -> Self {
        Self::Stopped(reason)
    }
}

/// Result shorthand using our Error enum.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Resource limits, parallelism and validation options for decoding.
///
/// Resource limits are checked **before** allocations occur, so a file that
/// claims unrealistic dimensions or tile counts is rejected up front.
///
/// # Examples
///
/// ```rust
/// use zenheic_decode::DecodeConfig;
///
/// // Default limits (suitable for most apps)
/// let config = DecodeConfig::default();
///
/// // Strict limits for untrusted input
/// let config = DecodeConfig::default()
///     .with_peak_memory_limit(100_000_000)  // 100MB
///     .with_total_megapixels_limit(64)       // 64MP max
///     .with_max_grid_tiles(256)
///     .with_max_threads(1);
///
/// // No limits
/// let config = DecodeConfig::unlimited();
/// ```
#[derive(Debug, Clone)]
pub struct DecodeConfig {
    /// Maximum peak heap memory used for pixel buffers, in bytes.
    /// Default: 1GB (1,000,000,000 bytes)
    pub peak_memory_limit: Option<u64>,

    /// Maximum megapixels of any single image, grids included.
    /// Default: 512 megapixels
    pub total_megapixels_limit: Option<u32>,

    /// Maximum number of grid tiles.
    /// Default: 1,000 tiles
    pub max_grid_tiles: Option<u32>,

    /// Maximum number of worker threads for tile decoding.
    /// Default: `None`, meaning the available parallelism
    pub max_threads: Option<usize>,

    /// Enable lenient parsing mode.
    ///
    /// Skips the brand and handler checks, tolerates trailing bytes in
    /// fixed-size properties and ignores essential properties this crate
    /// doesn't understand.
    /// Default: false (strict validation)
    pub lenient: bool,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            peak_memory_limit: Some(1_000_000_000),
            total_megapixels_limit: Some(512),
            max_grid_tiles: Some(1_000),
            max_threads: None,
            lenient: false,
        }
    }
}

impl DecodeConfig {
    /// Create a configuration with no resource limits.
    pub fn unlimited() -> Self {
        Self {
            peak_memory_limit: None,
            total_megapixels_limit: None,
            max_grid_tiles: None,
            max_threads: None,
            lenient: false,
        }
    }

    /// Set the peak memory limit in bytes
    pub fn with_peak_memory_limit(mut self, bytes: u64) -> Self {
        self.peak_memory_limit = Some(bytes);
        self
    }

    /// Set the megapixels limit for a single image
    pub fn with_total_megapixels_limit(mut self, megapixels: u32) -> Self {
        self.total_megapixels_limit = Some(megapixels);
        self
    }

    /// Set the maximum grid tile count
    pub fn with_max_grid_tiles(mut self, tiles: u32) -> Self {
        self.max_grid_tiles = Some(tiles);
        self
    }

    /// Limit tile decoding to `threads` workers (1 decodes on the calling thread)
    pub fn with_max_threads(mut self, threads: usize) -> Self {
        self.max_threads = Some(threads.max(1));
        self
    }

    /// Enable lenient parsing mode
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub(crate) fn worker_threads(&self) -> usize {
        self.max_threads
            .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
            .max(1)
    }
}

/// Bookkeeping for the limits in [`DecodeConfig`] over one decode call.
pub(crate) struct ResourceTracker<'a> {
    config: &'a DecodeConfig,
    current_memory: u64,
    peak_memory: u64,
}

impl<'a> ResourceTracker<'a> {
    pub(crate) fn new(config: &'a DecodeConfig) -> Self {
        Self {
            config,
            current_memory: 0,
            peak_memory: 0,
        }
    }

    /// Account for `bytes` about to be allocated. A refused reservation
    /// leaves the books unchanged.
    pub(crate) fn reserve(&mut self, bytes: u64) -> Result<()> {
        let wanted = self.current_memory.saturating_add(bytes);

        if let Some(limit) = self.config.peak_memory_limit {
            if wanted > limit {
                return Err(Error::ResourceLimitExceeded("peak memory limit exceeded"));
            }
        }

        self.current_memory = wanted;
        self.peak_memory = self.peak_memory.max(wanted);
        Ok(())
    }

    pub(crate) fn release(&mut self, bytes: u64) {
        self.current_memory = self.current_memory.saturating_sub(bytes);
    }

    /// Bytes accounted as live right now.
    pub(crate) fn current(&self) -> u64 {
        self.current_memory
    }

    /// Drop everything reserved since [`current`](Self::current) returned `held`.
    pub(crate) fn rewind(&mut self, held: u64) {
        self.release(self.current_memory.saturating_sub(held));
    }

    #[cfg(test)]
    pub(crate) fn peak(&self) -> u64 {
        self.peak_memory
    }

    pub(crate) fn validate_total_megapixels(&self, width: u32, height: u32) -> Result<()> {
        if let Some(limit) = self.config.total_megapixels_limit {
            let megapixels = u64::from(width)
                .checked_mul(u64::from(height))
                .ok_or(Error::InvalidData("dimension overflow"))?
                / 1_000_000;

            if megapixels > u64::from(limit) {
                return Err(Error::ResourceLimitExceeded("total megapixels limit exceeded"));
            }
        }

        Ok(())
    }

    pub(crate) fn validate_grid_tiles(&self, count: u32) -> Result<()> {
        if let Some(limit) = self.config.max_grid_tiles {
            if count > limit {
                return Err(Error::ResourceLimitExceeded("grid tile count limit exceeded"));
            }
        }

        Ok(())
    }
}

#[test]
fn tracker_enforces_limits() {
    let config = DecodeConfig::default()
        .with_peak_memory_limit(100)
        .with_total_megapixels_limit(1)
        .with_max_grid_tiles(4);
    let mut tracker = ResourceTracker::new(&config);
    tracker.reserve(60).unwrap();
    tracker.release(60);
    tracker.reserve(90).unwrap();
    assert!(matches!(tracker.reserve(20), Err(Error::ResourceLimitExceeded(_))));
    assert_eq!((tracker.current(), tracker.peak()), (90, 90));
    tracker.rewind(30);
    tracker.reserve(70).unwrap();
    assert_eq!(tracker.peak(), 100);

    tracker.validate_total_megapixels(1000, 1999).unwrap();
    assert!(matches!(tracker.validate_total_megapixels(2000, 1000), Err(Error::ResourceLimitExceeded(_))));
    assert!(matches!(tracker.validate_grid_tiles(5), Err(Error::ResourceLimitExceeded(_))));

    let unlimited = DecodeConfig::unlimited();
    let tracker = ResourceTracker::new(&unlimited);
    tracker.validate_total_megapixels(u32::MAX, u32::MAX).unwrap();
    tracker.validate_grid_tiles(u32::MAX).unwrap();
}

#[test]
fn allocation_failures_become_out_of_memory() {
    let overflow = Vec::<u8>::new().try_reserve(usize::MAX).unwrap_err();
    let from_try_vec: fallible_collections::TryReserveError = overflow.clone();
    assert!(matches!(Error::from(overflow), Error::OutOfMemory));
    assert!(matches!(Error::from(from_try_vec), Error::OutOfMemory));
}

#[test]
fn tile_decode_error_exposes_its_cause() {
    use std::error::Error as _;
    let cause: DecodeFailure = "bad slice header".into();
    let err = Error::TileDecode { item_id: 7, cause };
    assert_eq!(err.to_string(), "decoding item 7 failed: bad slice header");
    assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("bad slice header"));
    assert_eq!(
        Error::UnsupportedCodec { item_id: 2, item_type: FourCC::from(*b"av01") }.to_string(),
        "item 2 has unsupported coding 'av01'"
    );
}
