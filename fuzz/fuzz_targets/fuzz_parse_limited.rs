#![no_main]

use enough::Unstoppable;
use libfuzzer_sys::fuzz_target;
use zenheic_decode::{CodecConfig, DecodeConfig, DecodeFailure, DecodedPlanes, FormatTable, PixelFormat, Plane};

/// Stands in for an HEVC decoder: a flat frame of the declared size.
fn flat_frame(config: &CodecConfig<'_>, _coded: &[u8]) -> Result<DecodedPlanes, DecodeFailure> {
    let (width, height) = config.extents.unwrap_or((1, 1));
    let size = width as usize * height as usize;
    Ok(DecodedPlanes {
        pixel_format: PixelFormat::Monochrome,
        bit_depth: 8,
        planes: vec![Plane::new(width, height, 1, vec![128; size])?],
    })
}

fuzz_target!(|data: &[u8]| {
    let config = DecodeConfig::default()
        .with_peak_memory_limit(16 * 1024 * 1024)
        .with_total_megapixels_limit(4)
        .with_max_grid_tiles(64)
        .with_max_threads(1);
    let formats = FormatTable::browser();
    let _ = zenheic_decode::decode_one_with_config(data, &flat_frame, &formats, &config, &Unstoppable);
    let _ = zenheic_decode::decode_all_with_config(data, &flat_frame, &formats, &config, &Unstoppable);
});
