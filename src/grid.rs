// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use log::debug;

use crate::boxes::reference_type;
use crate::cursor::ByteCursor;
use crate::meta::HeifMeta;
use crate::{Error, ResourceTracker, Result, TryVec};

/// Layout of a `grid` derived image.
///
/// Tiles are placed left to right, top to bottom, and the result is cropped to
/// the output size. See ISO/IEC 23008-12:2017 § 6.6.2.3
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLayout {
    /// Number of tile rows (1-256)
    pub rows: u16,
    /// Number of tile columns (1-256)
    pub columns: u16,
    pub output_width: u32,
    pub output_height: u32,
}

impl GridLayout {
    pub fn tile_count(&self) -> u32 {
        u32::from(self.rows) * u32::from(self.columns)
    }
}

/// Parse the ImageGrid structure stored as a grid item's data.
pub(crate) fn read_grid(data: &[u8]) -> Result<GridLayout> {
    let mut src = ByteCursor::new(data);
    let layout = read_grid_fields(&mut src).map_err(|e| match e {
        Error::TruncatedInput => Error::InvalidData("grid descriptor is too short"),
        e => e,
    })?;
    if src.remaining() > 0 {
        debug!("{} bytes after grid descriptor (ignored)", src.remaining());
    }
    if layout.output_width == 0 || layout.output_height == 0 {
        return Err(Error::InvalidData("grid output size cannot be zero"));
    }
    Ok(layout)
}

fn read_grid_fields(src: &mut ByteCursor<'_>) -> Result<GridLayout> {
    let version = src.read_u8()?;
    if version > 0 {
        return Err(Error::Unsupported("grid version > 0"));
    }

    let flags = src.read_u8()?;
    let rows = u16::from(src.read_u8()?) + 1;
    let columns = u16::from(src.read_u8()?) + 1;

    // flags & 1 determines field size: 0 = 16-bit, 1 = 32-bit
    let wide = flags & 1 == 1;
    let output_width = src.read_u16_or_u32(wide)?;
    let output_height = src.read_u16_or_u32(wide)?;

    Ok(GridLayout {
        rows,
        columns,
        output_width,
        output_height,
    })
}

/// Tile item ids of a grid in raster order, checked against the layout and
/// the configured tile limit.
pub(crate) fn grid_tiles(
    meta: &HeifMeta<'_>,
    grid_item_id: u32,
    layout: &GridLayout,
    tracker: &ResourceTracker<'_>,
) -> Result<TryVec<u32>> {
    let tiles = meta
        .single_reference(grid_item_id, reference_type::DERIVED_IMAGE)?
        .unwrap_or(&[]);
    let actual = u32::try_from(tiles.len())?;
    let expected = layout.tile_count();
    if actual != expected {
        return Err(Error::GridCardinality {
            item_id: grid_item_id,
            expected,
            actual,
        });
    }
    tracker.validate_grid_tiles(actual)?;
    debug!(
        "grid {grid_item_id}: {}x{} tiles, {}x{} output",
        layout.columns, layout.rows, layout.output_width, layout.output_height
    );

    let mut ids = TryVec::with_capacity(tiles.len())?;
    ids.extend_from_slice(tiles)?;
    Ok(ids)
}

#[test]
fn grid_descriptor_field_sizes() {
    let narrow = read_grid(&[0, 0, 1, 2, 0x01, 0x00, 0x00, 0xc8]).unwrap();
    assert_eq!(narrow, GridLayout { rows: 2, columns: 3, output_width: 256, output_height: 200 });
    assert_eq!(narrow.tile_count(), 6);

    let wide = read_grid(&[0, 1, 255, 255, 0, 1, 0, 0, 0, 0, 0, 9]).unwrap();
    assert_eq!(wide, GridLayout { rows: 256, columns: 256, output_width: 65536, output_height: 9 });

    assert!(matches!(read_grid(&[0, 1, 0, 0, 0, 1]), Err(Error::InvalidData(_))));
    assert!(matches!(read_grid(&[1, 0, 0, 0, 0, 1, 0, 1]), Err(Error::Unsupported(_))));
    assert!(matches!(read_grid(&[0, 0, 0, 0, 0, 0, 0, 1]), Err(Error::InvalidData(_))));
}
