// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decoding whole images: item selection, the decoder bridge, composition
//! and per-item error collection.

use log::debug;

use crate::boxes::{item_type, reference_type};
use crate::codec::{self, Codec, CodecConfig, CodedUnit, ElementaryStreamDecoder, HevcConfig};
use crate::compose;
use crate::grid;
use crate::image::{DecodedImage, DecodedPlanes, FormatTable, PixelFormat, Transform, bytes_per_sample};
use crate::parser::HeifParser;
use crate::{DecodeConfig, Error, ResourceTracker, Result, Stop, Unstoppable};

/// `iden` items may point at other derived items, but not endlessly.
const MAX_DERIVATION_DEPTH: usize = 8;

/// An item that `decode_all` could not decode.
#[derive(Debug)]
pub struct ItemFailure {
    pub item_id: u32,
    pub error: Error,
}

/// Result of [`decode_all`]: every image that decoded, and why the others
/// didn't.
#[derive(Debug, Default)]
pub struct DecodedSet {
    /// In the order of [`HeifParser::top_level_image_ids`]
    pub images: Vec<DecodedImage>,
    pub failures: Vec<ItemFailure>,
}

/// Decode the primary image with default limits.
pub fn decode_one(data: &[u8], decoder: &dyn ElementaryStreamDecoder, formats: &FormatTable) -> Result<DecodedImage> {
    decode_one_with_config(data, decoder, formats, &DecodeConfig::default(), &Unstoppable)
}

/// Decode the primary image.
///
/// Any failure, in the container or in the image, is returned as the error.
pub fn decode_one_with_config(
    data: &[u8],
    decoder: &dyn ElementaryStreamDecoder,
    formats: &FormatTable,
    config: &DecodeConfig,
    stop: &dyn Stop,
) -> Result<DecodedImage> {
    let parser = HeifParser::from_bytes_with_config(data, config, stop)?;
    let primary = parser.primary_item_id().ok_or(Error::MissingPrimaryItem)?;
    Pipeline::new(&parser, decoder, formats, stop).decode_item(primary)
}

/// Decode every top-level image with default limits.
pub fn decode_all(data: &[u8], decoder: &dyn ElementaryStreamDecoder, formats: &FormatTable) -> Result<DecodedSet> {
    decode_all_with_config(data, decoder, formats, &DecodeConfig::default(), &Unstoppable)
}

/// Decode every top-level image, collecting per-item failures.
///
/// Only problems with the container itself (including item data cut off by
/// truncation) or cancellation fail the call.
pub fn decode_all_with_config(
    data: &[u8],
    decoder: &dyn ElementaryStreamDecoder,
    formats: &FormatTable,
    config: &DecodeConfig,
    stop: &dyn Stop,
) -> Result<DecodedSet> {
    let parser = HeifParser::from_bytes_with_config(data, config, stop)?;
    let candidates = parser.meta().top_level_items()?;
    debug!("{} top-level images", candidates.len());

    let mut pipeline = Pipeline::new(&parser, decoder, formats, stop);
    let mut set = DecodedSet::default();
    for &item_id in candidates.iter() {
        let held = pipeline.tracker.current();
        match pipeline.decode_item(item_id) {
            Ok(image) => set.images.push(image),
            Err(e @ (Error::TruncatedInput | Error::Stopped(_))) => return Err(e),
            Err(error) => {
                debug!("item {item_id} failed: {error}");
                // nothing the failed item reserved is still alive
                pipeline.tracker.rewind(held);
                set.failures.push(ItemFailure { item_id, error });
            },
        }
    }
    Ok(set)
}

/// An [`ElementaryStreamDecoder`] paired with the host's [`FormatTable`].
///
/// ```no_run
/// # use zenheic_decode::{DecodedPlanes, HeicDecoder, FormatTable};
/// # fn hevc(_: &zenheic_decode::CodecConfig<'_>, _: &[u8])
/// #     -> Result<DecodedPlanes, zenheic_decode::DecodeFailure> { unimplemented!() }
/// let decoder = HeicDecoder::new(hevc, FormatTable::browser());
/// let bytes = std::fs::read("burst.heic")?;
/// for image in decoder.all(&bytes)?.images {
///     println!("{}: {}x{}", image.item_id(), image.width(), image.height());
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct HeicDecoder<D> {
    decoder: D,
    formats: FormatTable,
}

impl<D: ElementaryStreamDecoder> HeicDecoder<D> {
    pub fn new(decoder: D, formats: FormatTable) -> Self {
        Self { decoder, formats }
    }

    pub fn formats(&self) -> &FormatTable {
        &self.formats
    }

    /// See [`decode_one`]
    pub fn one(&self, data: &[u8]) -> Result<DecodedImage> {
        decode_one(data, &self.decoder, &self.formats)
    }

    /// See [`decode_all`]
    pub fn all(&self, data: &[u8]) -> Result<DecodedSet> {
        decode_all(data, &self.decoder, &self.formats)
    }

    pub fn one_with_config(&self, data: &[u8], config: &DecodeConfig, stop: &dyn Stop) -> Result<DecodedImage> {
        decode_one_with_config(data, &self.decoder, &self.formats, config, stop)
    }

    pub fn all_with_config(&self, data: &[u8], config: &DecodeConfig, stop: &dyn Stop) -> Result<DecodedSet> {
        decode_all_with_config(data, &self.decoder, &self.formats, config, stop)
    }
}

/// Upper bound on the buffers a decoder will return for a `width` × `height`
/// image with this configuration.
fn estimated_frame_bytes(hevc: &HevcConfig<'_>, width: u32, height: u32) -> u64 {
    let format = PixelFormat::from_chroma_format_idc(hevc.chroma_format_idc()).unwrap_or(PixelFormat::Yuv444);
    let depth = hevc.bit_depth_luma().max(hevc.bit_depth_chroma());
    format.frame_bytes(width, height, bytes_per_sample(depth))
}

/// State for decoding items of one file.
struct Pipeline<'p, 'data> {
    parser: &'p HeifParser<'data>,
    decoder: &'p dyn ElementaryStreamDecoder,
    formats: &'p FormatTable,
    stop: &'p dyn Stop,
    tracker: ResourceTracker<'p>,
}

impl<'p, 'data: 'p> Pipeline<'p, 'data> {
    fn new(parser: &'p HeifParser<'data>, decoder: &'p dyn ElementaryStreamDecoder, formats: &'p FormatTable, stop: &'p dyn Stop) -> Self {
        Self {
            parser,
            decoder,
            formats,
            stop,
            tracker: ResourceTracker::new(parser.config()),
        }
    }

    /// Decode one image with its alpha channel and colour information, laid
    /// out for the host.
    fn decode_item(&mut self, item_id: u32) -> Result<DecodedImage> {
        let (frame, transforms) = self.render(item_id, 0)?;

        let meta = self.parser.meta();
        let alpha_id = meta.alpha_item(item_id);
        let alpha = match alpha_id {
            Some(alpha_id) => {
                debug!("item {item_id}: alpha from item {alpha_id}");
                let (alpha_frame, _) = self.render(alpha_id, 0)?;
                if (alpha_frame.width(), alpha_frame.height()) != (frame.width(), frame.height()) {
                    return Err(Error::InvalidData("alpha image size differs from the colour image"));
                }
                let plane = alpha_frame
                    .planes
                    .into_iter()
                    .next()
                    .ok_or(Error::InvalidData("alpha image has no planes"))?;
                Some(compose::layout_plane(plane, self.formats)?)
            },
            None => None,
        };
        let premultiplied = alpha_id.is_some_and(|alpha_id| meta.is_premultiplied(item_id, alpha_id));

        // derived images usually leave 'colr' on their inputs
        let mut color = self.parser.color(item_id)?;
        if color.is_none() {
            if let Some(&first_input) = meta
                .single_reference(item_id, reference_type::DERIVED_IMAGE)?
                .and_then(|inputs| inputs.first())
            {
                color = self.parser.color(first_input)?;
            }
        }

        if let Some(depths) = meta.channel_depths(item_id) {
            if depths.iter().any(|&d| d != frame.bit_depth) {
                debug!("item {item_id}: pixi says {depths:?} bits, decoder produced {}", frame.bit_depth);
            }
        }

        let frame = compose::layout_frame(frame, self.formats)?;
        Ok(DecodedImage::new(item_id, frame, alpha, premultiplied, color, transforms))
    }

    /// Decode an item to planes, transforms applied.
    fn render(&mut self, item_id: u32, depth: usize) -> Result<(DecodedPlanes, Vec<Transform>)> {
        if depth > MAX_DERIVATION_DEPTH {
            return Err(Error::InvalidData("derived images nested too deeply"));
        }
        self.stop.check()?;
        let meta = self.parser.meta();
        meta.check_essential(item_id, &self.parser.options())?;
        if let Some(extents) = meta.ispe(item_id) {
            self.tracker.validate_total_megapixels(extents.width, extents.height)?;
        }

        let kind = meta
            .item_info(item_id)
            .ok_or(Error::InvalidData("item is not in iinf"))?
            .item_type;
        let mut transforms = Vec::new();
        let frame = if kind == item_type::HEVC {
            self.decode_coded(item_id)?
        } else if kind == item_type::GRID {
            self.decode_grid(item_id)?
        } else if kind == item_type::IDENTITY {
            let inputs = meta.single_reference(item_id, reference_type::DERIVED_IMAGE)?.unwrap_or(&[]);
            let [input] = inputs else {
                return Err(Error::InvalidData("iden item must have exactly one input"));
            };
            let (frame, inner) = self.render(*input, depth + 1)?;
            transforms = inner;
            frame
        } else if kind == item_type::OVERLAY {
            return Err(Error::Unsupported("overlay images (iovl) are not supported"));
        } else {
            return Err(Error::UnsupportedCodec { item_id, item_type: kind });
        };

        let frame = self.apply_transforms(item_id, frame, &mut transforms)?;
        Ok((frame, transforms))
    }

    /// The decoder's input for a coded item.
    fn coded_unit(&self, item_id: u32) -> Result<CodedUnit<'p>> {
        let meta = self.parser.meta();
        let hevc = meta
            .hevc_config(item_id)
            .ok_or(Error::InvalidData("hvc1 item without hvcC property"))?;
        let extents = meta.ispe(item_id).map(|e| (e.width, e.height));
        if extents.is_none() && !self.parser.config().lenient {
            return Err(Error::InvalidData("image item without ispe property"));
        }
        Ok(CodedUnit {
            config: CodecConfig {
                item_id,
                codec: Codec::Hevc,
                hevc,
                extents,
            },
            data: self.parser.item_data(item_id)?,
        })
    }

    fn decode_coded(&mut self, item_id: u32) -> Result<DecodedPlanes> {
        let unit = self.coded_unit(item_id)?;
        let extents = unit.config.extents;
        let estimate = extents.map_or(0, |(w, h)| estimated_frame_bytes(unit.config.hevc, w, h));
        self.tracker.reserve(estimate)?;

        let frame = codec::decode_units(self.decoder, std::slice::from_ref(&unit), 1)?
            .into_iter()
            .next()
            .ok_or(Error::InvalidData("decoder returned nothing"))?;
        self.settle(estimate, frame.byte_size())?;

        let Some((width, height)) = extents else {
            return Ok(frame);
        };
        if frame.width() < width || frame.height() < height {
            return Err(Error::InvalidData("decoded image smaller than its ispe"));
        }
        // decoders may pad to whole coding blocks
        self.cropped(frame, 0, 0, width, height)
    }

    fn decode_grid(&mut self, item_id: u32) -> Result<DecodedPlanes> {
        let meta = self.parser.meta();
        let layout = grid::read_grid(&self.parser.item_data(item_id)?)?;
        self.tracker.validate_total_megapixels(layout.output_width, layout.output_height)?;
        let tile_ids = grid::grid_tiles(meta, item_id, &layout, &self.tracker)?;

        let mut units = Vec::new();
        units.try_reserve_exact(tile_ids.len())?;
        let mut estimate = 0u64;
        for &tile_id in tile_ids.iter() {
            let kind = meta
                .item_info(tile_id)
                .ok_or(Error::InvalidData("grid tile is not in iinf"))?
                .item_type;
            if kind != item_type::HEVC {
                return Err(Error::UnsupportedCodec { item_id: tile_id, item_type: kind });
            }
            meta.check_essential(tile_id, &self.parser.options())?;
            let unit = self.coded_unit(tile_id)?;
            if let Some((w, h)) = unit.config.extents {
                estimate = estimate.saturating_add(estimated_frame_bytes(unit.config.hevc, w, h));
            }
            units.push(unit);
        }
        self.tracker.reserve(estimate)?;

        self.stop.check()?;
        let tiles = codec::decode_units(self.decoder, &units, self.parser.config().worker_threads())?;
        self.stop.check()?;
        let decoded_bytes = tiles.iter().map(DecodedPlanes::byte_size).sum();
        self.settle(estimate, decoded_bytes)?;

        let tile_size = match units.first().and_then(|u| u.config.extents) {
            Some(size) => size,
            None => tiles.first().map_or((0, 0), |t| (t.width(), t.height())),
        };
        let canvas_bytes = tiles.first().map_or(0, |t| {
            t.pixel_format
                .frame_bytes(layout.output_width, layout.output_height, bytes_per_sample(t.bit_depth))
        });
        self.tracker.reserve(canvas_bytes)?;
        let canvas = compose::stitch_grid(&layout, &tiles, tile_size)?;
        self.tracker.release(decoded_bytes);
        Ok(canvas)
    }

    /// Rotation, then mirroring, then the clean aperture.
    fn apply_transforms(&mut self, item_id: u32, mut frame: DecodedPlanes, applied: &mut Vec<Transform>) -> Result<DecodedPlanes> {
        let meta = self.parser.meta();
        if let Some(degrees) = meta.rotation(item_id).filter(|d| d % 360 != 0) {
            let (width, height) = match degrees {
                180 => (frame.width(), frame.height()),
                _ => (frame.height(), frame.width()),
            };
            frame = self.resized(frame, width, height, |f| compose::rotate(f, degrees))?;
            applied.push(Transform::Rotate { degrees });
        }
        if let Some(axis) = meta.mirror(item_id) {
            frame = compose::mirror(frame, axis);
            applied.push(Transform::Mirror(axis));
        }
        if let Some(clap) = meta.clean_aperture(item_id) {
            let (x, y, width, height) = compose::clean_aperture_rect(&clap, frame.width(), frame.height())?;
            frame = self.cropped(frame, x, y, width, height)?;
            applied.push(Transform::Crop { x, y, width, height });
        }
        Ok(frame)
    }

    /// Run an operation producing a `width` × `height` copy of `frame`,
    /// accounting for the new buffers before they are allocated.
    fn resized(
        &mut self,
        frame: DecodedPlanes,
        width: u32,
        height: u32,
        op: impl FnOnce(DecodedPlanes) -> Result<DecodedPlanes>,
    ) -> Result<DecodedPlanes> {
        let old = frame.byte_size();
        let new = frame.pixel_format.frame_bytes(width, height, bytes_per_sample(frame.bit_depth));
        self.tracker.reserve(new)?;
        let out = op(frame)?;
        self.tracker.release(old);
        Ok(out)
    }

    /// A window that covers the whole frame hands the frame back untouched
    /// and needs no new buffers.
    fn cropped(&mut self, frame: DecodedPlanes, x: u32, y: u32, width: u32, height: u32) -> Result<DecodedPlanes> {
        if (x, y, width, height) == (0, 0, frame.width(), frame.height()) {
            return Ok(frame);
        }
        self.resized(frame, width, height, |f| compose::crop(f, x, y, width, height))
    }

    /// Replace an up-front estimate with what the decoder actually returned.
    fn settle(&mut self, estimate: u64, actual: u64) -> Result<()> {
        if actual > estimate {
            self.tracker.reserve(actual - estimate)
        } else {
            self.tracker.release(estimate - actual);
            Ok(())
        }
    }
}
