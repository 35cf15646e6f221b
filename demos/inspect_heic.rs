//! Print the container structure of a HEIC file
use std::env;
use zenheic_decode::HeifParser;

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("Usage: {} <heic-file>", args[0]);
        std::process::exit(1);
    }

    let path = &args[1];
    let bytes = std::fs::read(path).expect("Failed to read file");

    let parser = match HeifParser::from_bytes(&bytes) {
        Ok(parser) => parser,
        Err(e) => {
            eprintln!("Parse error: {}", e);
            std::process::exit(1);
        }
    };

    println!("File: {}", path);
    println!("Major brand: {}", parser.major_brand());
    let brands: Vec<String> = parser.compatible_brands().iter().map(|b| b.to_string()).collect();
    println!("Compatible brands: {}", brands.join(", "));
    println!("Primary item: {:?}", parser.primary_item_id());

    println!("Items:");
    for item in parser.items() {
        let hidden = if item.hidden { " (hidden)" } else { "" };
        println!("  #{} {} {:?}{}", item.item_id, item.item_type, item.name, hidden);
        if let Some((width, height)) = parser.image_extents(item.item_id) {
            println!("    extents: {}x{}", width, height);
        }
        if let Some(rotation) = parser.rotation(item.item_id) {
            println!("    rotation: {} degrees", rotation);
        }
        if let Some(axis) = parser.mirror(item.item_id) {
            println!("    mirror: {:?}", axis);
        }
        if let Some(alpha) = parser.alpha_item_id(item.item_id) {
            println!("    alpha: #{}", alpha);
        }
        match parser.grid_layout(item.item_id) {
            Ok(Some(grid)) => {
                println!("    grid: {}x{} tiles, {}x{} output", grid.columns, grid.rows, grid.output_width, grid.output_height);
                if let Ok(tiles) = parser.grid_tile_ids(item.item_id) {
                    println!("    tiles: {:?}", tiles);
                }
            }
            Ok(None) => {}
            Err(e) => println!("    grid error: {}", e),
        }
    }

    match parser.top_level_image_ids() {
        Ok(ids) => println!("Top-level images: {:?}", ids),
        Err(e) => println!("Top-level images: error: {}", e),
    }

    println!();
    print!("{}", parser.describe_boxes());
}
