#![no_main]

use libfuzzer_sys::fuzz_target;
use zenheic_decode::HeifParser;

fuzz_target!(|data: &[u8]| {
    let Ok(parser) = HeifParser::from_bytes(data) else {
        return;
    };
    let _ = parser.describe_boxes();
    let _ = parser.top_level_image_ids();
    let ids: Vec<u32> = parser.items().map(|item| item.item_id).collect();
    for id in ids {
        let _ = parser.item_data(id);
        let _ = parser.grid_layout(id);
        let _ = parser.grid_tile_ids(id);
        let _ = parser.color(id);
        let _ = parser.clean_aperture(id);
    }
});
