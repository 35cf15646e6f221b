// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The seam between the container and an external HEVC decoder.

use log::debug;
use std::borrow::Cow;

use crate::cursor::ByteCursor;
use crate::image::DecodedPlanes;
use crate::{DecodeFailure, Error, Result, ToUsize, TryVec};

const START_CODE: [u8; 4] = [0, 0, 0, 1];

/// Bitstream format of a coded item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Codec {
    /// H.265, item type `hvc1`
    Hevc,
}

/// HEVC decoder configuration record ('hvcC').
///
/// Keeps the raw record for decoders that want it verbatim, along with the
/// fields a front-end needs. See ISO/IEC 14496-15 § 8.3.3.1
#[derive(Debug)]
pub struct HevcConfig<'a> {
    raw: &'a [u8],
    general_profile_idc: u8,
    general_level_idc: u8,
    chroma_format_idc: u8,
    bit_depth_luma: u8,
    bit_depth_chroma: u8,
    nal_length_size: u8,
    /// (NAL unit type, NAL unit) for every VPS/SPS/PPS/SEI in the record
    parameter_sets: TryVec<(u8, &'a [u8])>,
}

impl<'a> HevcConfig<'a> {
    pub(crate) fn parse(raw: &'a [u8]) -> Result<Self> {
        let mut src = ByteCursor::new(raw);
        let version = src.read_u8()?;
        if version != 1 {
            debug!("hvcC configurationVersion {version}");
        }
        let general_profile_idc = src.read_u8()? & 0x1f;
        let _compatibility_flags = src.read_u32()?;
        let _constraint_flags = src.read_bytes(6)?;
        let general_level_idc = src.read_u8()?;
        let _min_spatial_segmentation = src.read_u16()?;
        let _parallelism_type = src.read_u8()?;
        let chroma_format_idc = src.read_u8()? & 0b11;
        let bit_depth_luma = (src.read_u8()? & 0b111) + 8;
        let bit_depth_chroma = (src.read_u8()? & 0b111) + 8;
        let _avg_frame_rate = src.read_u16()?;
        let nal_length_size = (src.read_u8()? & 0b11) + 1;
        if nal_length_size == 3 {
            return Err(Error::InvalidData("hvcC lengthSizeMinusOne must be 0, 1 or 3"));
        }

        let num_arrays = src.read_u8()?;
        let mut parameter_sets = TryVec::new();
        for _ in 0..num_arrays {
            let nal_unit_type = src.read_u8()? & 0x3f;
            let num_nalus = src.read_u16()?;
            for _ in 0..num_nalus {
                let len = src.read_u16()?.to_usize();
                parameter_sets.push((nal_unit_type, src.read_bytes(len)?))?;
            }
        }

        Ok(Self {
            raw,
            general_profile_idc,
            general_level_idc,
            chroma_format_idc,
            bit_depth_luma,
            bit_depth_chroma,
            nal_length_size,
            parameter_sets,
        })
    }

    /// The whole configuration record, as stored in the file.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn general_profile_idc(&self) -> u8 {
        self.general_profile_idc
    }

    pub fn general_level_idc(&self) -> u8 {
        self.general_level_idc
    }

    /// 0 = monochrome, 1 = 4:2:0, 2 = 4:2:2, 3 = 4:4:4
    pub fn chroma_format_idc(&self) -> u8 {
        self.chroma_format_idc
    }

    pub fn bit_depth_luma(&self) -> u8 {
        self.bit_depth_luma
    }

    pub fn bit_depth_chroma(&self) -> u8 {
        self.bit_depth_chroma
    }

    /// Size of the big-endian length prefix on each NAL unit in item data.
    pub fn nal_length_size(&self) -> u8 {
        self.nal_length_size
    }

    /// Parameter-set NAL units as `(nal_unit_type, bytes)`, in record order.
    pub fn parameter_sets(&self) -> impl Iterator<Item = (u8, &'a [u8])> + '_ {
        self.parameter_sets.iter().copied()
    }
}

/// Everything a decoder gets to know about one coded image.
#[derive(Debug, Clone, Copy)]
pub struct CodecConfig<'a> {
    /// Item (or grid tile) being decoded
    pub item_id: u32,
    pub codec: Codec,
    pub hevc: &'a HevcConfig<'a>,
    /// Declared output size from 'ispe'; the decoded frame may be larger
    pub extents: Option<(u32, u32)>,
}

/// An HEVC elementary-stream decoder.
///
/// Receives the item's length-prefixed NAL units (use [`annexb_stream`] for
/// decoders wanting start codes) and returns the decoded frame. It is treated
/// as a pure function and may be called from several threads at once.
pub trait ElementaryStreamDecoder: Sync {
    fn decode(&self, config: &CodecConfig<'_>, coded: &[u8]) -> Result<DecodedPlanes, DecodeFailure>;
}

impl<F> ElementaryStreamDecoder for F
where
    F: Fn(&CodecConfig<'_>, &[u8]) -> Result<DecodedPlanes, DecodeFailure> + Sync,
{
    fn decode(&self, config: &CodecConfig<'_>, coded: &[u8]) -> Result<DecodedPlanes, DecodeFailure> {
        self(config, coded)
    }
}

/// Convert an item's length-prefixed NAL units into an Annex-B byte stream,
/// with the configuration's parameter sets in front.
pub fn annexb_stream(config: &HevcConfig<'_>, coded: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let parameter_bytes: usize = config.parameter_sets().map(|(_, nal)| nal.len() + START_CODE.len()).sum();
    out.try_reserve_exact(parameter_bytes + coded.len())?;
    for (_, nal) in config.parameter_sets() {
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }

    let wide = config.nal_length_size();
    let mut src = ByteCursor::new(coded);
    while src.remaining() > 0 {
        let len = match wide {
            1 => src.read_u8().map(u32::from),
            2 => src.read_u16().map(u32::from),
            _ => src.read_u32(),
        }
        .map_err(|_| Error::InvalidData("partial NAL length prefix"))?;
        let nal = src
            .read_bytes(len.to_usize())
            .map_err(|_| Error::InvalidData("NAL unit length exceeds item data"))?;
        if nal.is_empty() {
            continue;
        }
        // prefixes may be narrower than start codes
        out.try_reserve(START_CODE.len())?;
        out.extend_from_slice(&START_CODE);
        out.extend_from_slice(nal);
    }
    Ok(out)
}

/// One image's worth of coded data ready for the decoder.
pub(crate) struct CodedUnit<'a> {
    pub(crate) config: CodecConfig<'a>,
    pub(crate) data: Cow<'a, [u8]>,
}

fn decode_unit(decoder: &dyn ElementaryStreamDecoder, unit: &CodedUnit<'_>) -> Result<DecodedPlanes> {
    let item_id = unit.config.item_id;
    let decoded = decoder
        .decode(&unit.config, &unit.data)
        .map_err(|cause| Error::TileDecode { item_id, cause })?;
    decoded.validate()?;
    Ok(decoded)
}

/// Decode every unit, in parallel where allowed, returning results in input
/// order. When several fail, the error of the earliest unit is returned.
pub(crate) fn decode_units(
    decoder: &dyn ElementaryStreamDecoder,
    units: &[CodedUnit<'_>],
    max_threads: usize,
) -> Result<Vec<DecodedPlanes>> {
    let mut decoded = Vec::new();
    decoded.try_reserve_exact(units.len())?;

    #[cfg(feature = "threads")]
    {
        if max_threads > 1 && units.len() > 1 {
            let chunk_len = units.len().div_ceil(max_threads);
            debug!("decoding {} units on {} threads", units.len(), units.len().div_ceil(chunk_len));
            let results: Vec<Vec<Result<DecodedPlanes>>> = std::thread::scope(|s| {
                let workers: Vec<_> = units
                    .chunks(chunk_len)
                    .map(|chunk| s.spawn(move || chunk.iter().map(|unit| decode_unit(decoder, unit)).collect::<Vec<_>>()))
                    .collect();
                workers
                    .into_iter()
                    .map(|w| w.join().unwrap_or_else(|panic| std::panic::resume_unwind(panic)))
                    .collect()
            });
            for result in results.into_iter().flatten() {
                decoded.push(result?);
            }
            return Ok(decoded);
        }
    }
    #[cfg(not(feature = "threads"))]
    let _ = max_threads;

    for unit in units {
        decoded.push(decode_unit(decoder, unit)?);
    }
    Ok(decoded)
}

#[cfg(test)]
fn sample_record() -> std::vec::Vec<u8> {
    let mut hvcc = vec![
        1, 0x01, 0x60, 0, 0, 0, 0x90, 0, 0, 0, 0, 0, 0x5a, 0xf0, 0, 0xfc, 0xfd, 0xf8, 0xf8, 0, 0, 0x0f,
    ];
    hvcc.push(2); // arrays
    hvcc.extend_from_slice(&[0x20, 0, 1, 0, 2, 0x40, 0x01]); // VPS
    hvcc.extend_from_slice(&[0x21, 0, 1, 0, 3, 0x42, 0x01, 0x01]); // SPS
    hvcc
}

#[test]
fn hvcc_summary() {
    let raw = sample_record();
    let config = HevcConfig::parse(&raw).unwrap();
    assert_eq!(config.general_profile_idc(), 1);
    assert_eq!(config.general_level_idc(), 0x5a);
    assert_eq!(config.chroma_format_idc(), 1);
    assert_eq!(config.bit_depth_luma(), 8);
    assert_eq!(config.nal_length_size(), 4);
    let sets: std::vec::Vec<_> = config.parameter_sets().collect();
    assert_eq!(sets, [(32, &[0x40, 0x01][..]), (33, &[0x42, 0x01, 0x01][..])]);
}

#[test]
fn annexb_replaces_length_prefixes() {
    let raw = sample_record();
    let config = HevcConfig::parse(&raw).unwrap();
    let coded = [0, 0, 0, 2, 0x26, 0x01, 0, 0, 0, 0, 0, 0, 0, 1, 0xaa];
    let stream = annexb_stream(&config, &coded).unwrap();
    assert_eq!(
        stream,
        [0, 0, 0, 1, 0x40, 0x01, 0, 0, 0, 1, 0x42, 0x01, 0x01, 0, 0, 0, 1, 0x26, 0x01, 0, 0, 0, 1, 0xaa]
    );
    assert!(matches!(annexb_stream(&config, &[0, 0, 0, 9, 1]), Err(Error::InvalidData(_))));
}
