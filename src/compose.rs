// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pixel assembly: grid stitching, cropping, rotation, mirroring and final
//! row layout. Samples are moved, never converted.

use log::debug;

use crate::grid::GridLayout;
use crate::image::{DecodedPlanes, FormatTable, MirrorAxis, PixelFormat, Plane, bytes_per_sample};
use crate::meta::CleanAperture;
use crate::{Error, Result, ToUsize};

/// Copy a `width` × `height` block of samples between planes.
fn copy_block(src: &Plane, (sx, sy): (u32, u32), dst: &mut Plane, (dx, dy): (u32, u32), width: u32, height: u32) {
    let bps = usize::from(src.bytes_per_sample());
    let len = width.to_usize() * bps;
    let src_at = sx.to_usize() * bps;
    let dst_at = dx.to_usize() * bps;
    for row in 0..height {
        if let Some(src_row) = src.row(sy + row) {
            dst.row_mut(dy + row)[dst_at..dst_at + len].copy_from_slice(&src_row[src_at..src_at + len]);
        }
    }
}

fn empty_frame(format: PixelFormat, bit_depth: u8, width: u32, height: u32) -> Result<DecodedPlanes> {
    let bps = bytes_per_sample(bit_depth);
    let mut planes = Vec::new();
    planes.try_reserve_exact(format.plane_count())?;
    for p in 0..format.plane_count() {
        let (w, h) = format.plane_size(p, width, height);
        planes.push(Plane::zeroed(w, h, bps)?);
    }
    Ok(DecodedPlanes { pixel_format: format, bit_depth, planes })
}

/// Place tiles on the grid canvas in raster order, clipping whatever falls
/// outside the output size.
///
/// `tile_size` is the nominal tile size (from the first tile's 'ispe');
/// decoded tiles may be larger.
pub(crate) fn stitch_grid(layout: &GridLayout, tiles: &[DecodedPlanes], tile_size: (u32, u32)) -> Result<DecodedPlanes> {
    let first = tiles.first().ok_or(Error::InvalidData("grid without tiles"))?;
    let (format, bit_depth) = (first.pixel_format, first.bit_depth);
    if tiles.iter().any(|t| t.pixel_format != format || t.bit_depth != bit_depth) {
        return Err(Error::InvalidData("grid tiles differ in pixel format or bit depth"));
    }

    let (tile_w, tile_h) = tile_size;
    let (out_w, out_h) = (layout.output_width, layout.output_height);
    if u64::from(tile_w) * u64::from(layout.columns) < u64::from(out_w)
        || u64::from(tile_h) * u64::from(layout.rows) < u64::from(out_h)
    {
        return Err(Error::InvalidData("grid tiles don't cover the output image"));
    }

    let mut canvas = empty_frame(format, bit_depth, out_w, out_h)?;
    let columns = usize::from(layout.columns);
    for (i, tile) in tiles.iter().enumerate() {
        let x0 = u64::from(tile_w) * (i % columns) as u64;
        let y0 = u64::from(tile_h) * (i / columns) as u64;
        if x0 >= u64::from(out_w) || y0 >= u64::from(out_h) {
            continue;
        }
        // both fit in u32 since they are below the output size
        let (x0, y0) = (x0 as u32, y0 as u32);
        let w = tile_w.min(out_w - x0);
        let h = tile_h.min(out_h - y0);
        if tile.width() < w || tile.height() < h {
            return Err(Error::InvalidData("grid tile smaller than the grid's tile size"));
        }

        for (p, (src, dst)) in tile.planes.iter().zip(canvas.planes.iter_mut()).enumerate() {
            let (sx, sy) = format.plane_shift(p);
            let (px, py) = (x0 >> sx, y0 >> sy);
            let copy_w = ((x0 + w).div_ceil(1 << sx) - px).min(src.width()).min(dst.width() - px);
            let copy_h = ((y0 + h).div_ceil(1 << sy) - py).min(src.height()).min(dst.height() - py);
            copy_block(src, (0, 0), dst, (px, py), copy_w, copy_h);
        }
    }
    Ok(canvas)
}

/// Cut out a window of the frame.
pub(crate) fn crop(frame: DecodedPlanes, x: u32, y: u32, width: u32, height: u32) -> Result<DecodedPlanes> {
    let fits = |start: u32, len: u32, size: u32| start.checked_add(len).is_some_and(|end| end <= size);
    if width == 0 || height == 0 || !fits(x, width, frame.width()) || !fits(y, height, frame.height()) {
        return Err(Error::InvalidData("crop window outside the image"));
    }
    if (x, y, width, height) == (0, 0, frame.width(), frame.height()) {
        return Ok(frame);
    }

    let format = frame.pixel_format;
    let mut out = empty_frame(format, frame.bit_depth, width, height)?;
    for (p, (src, dst)) in frame.planes.iter().zip(out.planes.iter_mut()).enumerate() {
        let (sx, sy) = format.plane_shift(p);
        let (px, py) = (x >> sx, y >> sy);
        let copy_w = dst.width().min(src.width() - px);
        let copy_h = dst.height().min(src.height() - py);
        copy_block(src, (px, py), dst, (0, 0), copy_w, copy_h);
    }
    Ok(out)
}

fn rotate_plane(src: &Plane, degrees: u16) -> Result<Plane> {
    let (w, h) = (src.width(), src.height());
    let (out_w, out_h) = if degrees == 180 { (w, h) } else { (h, w) };
    let bps = usize::from(src.bytes_per_sample());
    let mut dst = Plane::zeroed(out_w, out_h, src.bytes_per_sample())?;
    for y in 0..out_h {
        let out_row = dst.row_mut(y);
        for x in 0..out_w {
            let (from_x, from_y) = match degrees {
                90 => (w - 1 - y, x),
                180 => (w - 1 - x, h - 1 - y),
                _ => (y, h - 1 - x),
            };
            if let Some(row) = src.row(from_y) {
                let at = from_x.to_usize() * bps;
                let to = x.to_usize() * bps;
                out_row[to..to + bps].copy_from_slice(&row[at..at + bps]);
            }
        }
    }
    Ok(dst)
}

/// Rotate counter-clockwise by a multiple of 90 degrees.
pub(crate) fn rotate(frame: DecodedPlanes, degrees: u16) -> Result<DecodedPlanes> {
    match degrees % 360 {
        0 => return Ok(frame),
        90 | 270 if frame.pixel_format == PixelFormat::Yuv422 => {
            return Err(Error::Unsupported("quarter-turn rotation of 4:2:2 images"));
        },
        90 | 180 | 270 => (),
        _ => return Err(Error::InvalidData("rotation must be a multiple of 90 degrees")),
    }
    let mut planes = Vec::new();
    planes.try_reserve_exact(frame.planes.len())?;
    for plane in &frame.planes {
        planes.push(rotate_plane(plane, degrees % 360)?);
    }
    Ok(DecodedPlanes { planes, ..frame })
}

pub(crate) fn mirror(mut frame: DecodedPlanes, axis: MirrorAxis) -> DecodedPlanes {
    for plane in &mut frame.planes {
        let bps = usize::from(plane.bytes_per_sample());
        let height = plane.height();
        match axis {
            MirrorAxis::Vertical => {
                for y in 0..height {
                    let row = plane.row_mut(y);
                    let samples = row.len() / bps;
                    for i in 0..samples / 2 {
                        let j = samples - 1 - i;
                        for b in 0..bps {
                            row.swap(i * bps + b, j * bps + b);
                        }
                    }
                }
            },
            MirrorAxis::Horizontal => {
                for y in 0..height / 2 {
                    let top = plane.row_mut(y).to_vec();
                    let bottom_y = height - 1 - y;
                    let bottom = plane.row_mut(bottom_y).to_vec();
                    plane.row_mut(y).copy_from_slice(&bottom);
                    plane.row_mut(bottom_y).copy_from_slice(&top);
                }
            },
        }
    }
    frame
}

/// The clean aperture's window within a `width` × `height` image, as
/// (x, y, width, height).
pub(crate) fn clean_aperture_rect(clap: &CleanAperture, width: u32, height: u32) -> Result<(u32, u32, u32, u32)> {
    let clean_w = clap.width_n / clap.width_d;
    let clean_h = clap.height_n / clap.height_d;
    let origin = |off_n: i32, off_d: u32, size: u32, clean_n: u32, clean_d: u32| -> i128 {
        // off + (size - clean) / 2, floored, in a common denominator
        let (off_n, off_d) = (i128::from(off_n), i128::from(off_d));
        let (size, clean_n, clean_d) = (i128::from(size), i128::from(clean_n), i128::from(clean_d));
        (2 * off_n * clean_d + size * off_d * clean_d - clean_n * off_d).div_euclid(2 * off_d * clean_d)
    };
    let left = origin(clap.horiz_off_n, clap.horiz_off_d, width, clap.width_n, clap.width_d);
    let top = origin(clap.vert_off_n, clap.vert_off_d, height, clap.height_n, clap.height_d);

    let inside = |start: i128, len: u32, size: u32| start >= 0 && start + i128::from(len) <= i128::from(size);
    if clean_w == 0 || clean_h == 0 || !inside(left, clean_w, width) || !inside(top, clean_h, height) {
        return Err(Error::InvalidData("clean aperture outside the image"));
    }
    Ok((u32::try_from(left)?, u32::try_from(top)?, clean_w, clean_h))
}

fn check_dimensions(width: u32, height: u32, table: &FormatTable) -> Result<()> {
    match table.max_dimension {
        Some(max) if width > max || height > max => {
            debug!("{width}x{height} exceeds the platform limit of {max}");
            Err(Error::ResourceLimitExceeded("image larger than the platform's maximum dimension"))
        },
        _ => Ok(()),
    }
}

/// Re-pack rows to the table's alignment.
pub(crate) fn layout_plane(plane: Plane, table: &FormatTable) -> Result<Plane> {
    let align = table.row_alignment.max(1);
    let stride = plane.row_bytes().div_ceil(align) * align;
    if stride == plane.stride() {
        return Ok(plane);
    }
    let size = stride
        .checked_mul(plane.height().to_usize())
        .ok_or(Error::ResourceLimitExceeded("plane too large"))?;
    let mut data = Vec::new();
    data.try_reserve_exact(size)?;
    for y in 0..plane.height() {
        if let Some(row) = plane.row(y) {
            data.extend_from_slice(row);
            data.resize(data.len() + stride - row.len(), 0);
        }
    }
    Plane::with_stride(plane.width(), plane.height(), plane.bytes_per_sample(), stride, data)
}

/// Enforce the table's size limit and lay every plane out for the host.
pub(crate) fn layout_frame(frame: DecodedPlanes, table: &FormatTable) -> Result<DecodedPlanes> {
    check_dimensions(frame.width(), frame.height(), table)?;
    let mut planes = Vec::new();
    planes.try_reserve_exact(frame.planes.len())?;
    for plane in frame.planes {
        planes.push(layout_plane(plane, table)?);
    }
    Ok(DecodedPlanes { planes, ..frame })
}

#[cfg(test)]
fn mono(width: u32, height: u32, samples: &[u8]) -> DecodedPlanes {
    DecodedPlanes {
        pixel_format: PixelFormat::Monochrome,
        bit_depth: 8,
        planes: vec![Plane::new(width, height, 1, samples.to_vec()).unwrap()],
    }
}

#[cfg(test)]
fn luma(frame: &DecodedPlanes) -> Vec<u8> {
    (0..frame.height()).flat_map(|y| frame.planes[0].row(y).unwrap().to_vec()).collect()
}

#[test]
fn rotation_is_counter_clockwise() {
    // 1 2 3
    // 4 5 6
    let frame = mono(3, 2, &[1, 2, 3, 4, 5, 6]);
    let r90 = rotate(frame, 90).unwrap();
    assert_eq!((r90.width(), r90.height()), (2, 3));
    assert_eq!(luma(&r90), [3, 6, 2, 5, 1, 4]);
    let r180 = rotate(mono(3, 2, &[1, 2, 3, 4, 5, 6]), 180).unwrap();
    assert_eq!(luma(&r180), [6, 5, 4, 3, 2, 1]);
    let r270 = rotate(mono(3, 2, &[1, 2, 3, 4, 5, 6]), 270).unwrap();
    assert_eq!(luma(&r270), [4, 1, 5, 2, 6, 3]);
}

#[test]
fn mirror_axes() {
    let v = mirror(mono(3, 2, &[1, 2, 3, 4, 5, 6]), MirrorAxis::Vertical);
    assert_eq!(luma(&v), [3, 2, 1, 6, 5, 4]);
    let h = mirror(mono(3, 2, &[1, 2, 3, 4, 5, 6]), MirrorAxis::Horizontal);
    assert_eq!(luma(&h), [4, 5, 6, 1, 2, 3]);
}

#[test]
fn quarter_turns_of_422_are_rejected() {
    let frame = DecodedPlanes {
        pixel_format: PixelFormat::Yuv422,
        bit_depth: 8,
        planes: vec![
            Plane::zeroed(4, 2, 1).unwrap(),
            Plane::zeroed(2, 2, 1).unwrap(),
            Plane::zeroed(2, 2, 1).unwrap(),
        ],
    };
    assert!(matches!(rotate(frame, 90), Err(Error::Unsupported(_))));
}

#[test]
fn clean_aperture_is_centred_plus_offset() {
    let clap = CleanAperture {
        width_n: 4,
        width_d: 1,
        height_n: 2,
        height_d: 1,
        horiz_off_n: 0,
        horiz_off_d: 1,
        vert_off_n: -1,
        vert_off_d: 2,
    };
    assert_eq!(clean_aperture_rect(&clap, 8, 4).unwrap(), (2, 0, 4, 2));
    let shifted = CleanAperture { horiz_off_n: 3, ..clap };
    assert!(matches!(clean_aperture_rect(&shifted, 8, 4), Err(Error::InvalidData(_))));
}

#[test]
fn stitching_clips_to_the_output() {
    let layout = GridLayout { rows: 1, columns: 2, output_width: 3, output_height: 1 };
    let tiles = [mono(2, 2, &[1, 2, 5, 5]), mono(2, 2, &[3, 4, 5, 5])];
    let canvas = stitch_grid(&layout, &tiles, (2, 2)).unwrap();
    assert_eq!((canvas.width(), canvas.height()), (3, 1));
    assert_eq!(luma(&canvas), [1, 2, 3]);
    let too_small = GridLayout { output_width: 5, ..layout };
    assert!(stitch_grid(&too_small, &tiles, (2, 2)).is_err());
}

#[test]
fn rows_are_padded_to_the_alignment() {
    let table = FormatTable::native().with_row_alignment(4);
    let frame = layout_frame(mono(3, 2, &[1, 2, 3, 4, 5, 6]), &table).unwrap();
    assert_eq!(frame.planes[0].stride(), 4);
    assert_eq!(frame.planes[0].data(), &[1, 2, 3, 0, 4, 5, 6, 0]);
    let limited = FormatTable::native().with_max_dimension(2);
    assert!(matches!(layout_frame(mono(3, 2, &[0; 6]), &limited), Err(Error::ResourceLimitExceeded(_))));
}
