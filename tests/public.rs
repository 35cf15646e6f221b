// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::borrow::Cow;
use std::error::Error as _;
use std::sync::atomic::{AtomicUsize, Ordering};

use zenheic_decode::{
    CodecConfig, ColorInfo, DecodeConfig, DecodeFailure, DecodedPlanes, Error, FormatTable, FourCC, GridLayout, HeicDecoder,
    HeifParser, MirrorAxis, PixelFormat, Stop, StopReason, Transform, Unstoppable, decode_all, decode_all_with_config,
    decode_one, decode_one_with_config,
};

mod support;
use support::*;

static CORPUS: &str = "tests/corpus";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).filter_level(log::LevelFilter::max()).try_init();
}

fn one(file: &[u8]) -> Result<zenheic_decode::DecodedImage, Error> {
    decode_one(file, &fake_decoder, &FormatTable::native())
}

fn one_with(file: &[u8], config: &DecodeConfig) -> Result<zenheic_decode::DecodedImage, Error> {
    decode_one_with_config(file, &fake_decoder, &FormatTable::native(), config, &Unstoppable)
}

/// 4x3 luma ramp as item 1.
fn simple_file() -> Vec<u8> {
    let samples: Vec<u8> = (0..12).collect();
    HeifBuilder::new().primary(1).image(1, 4, 3, &samples).build()
}

/// 2x2 grid (item 1) of 2x2 flat tiles, cropped to 3x3.
fn grid_file(tiles: &[u32]) -> Vec<u8> {
    let mut heif = HeifBuilder::new();
    heif.primary(1).grid(1, 2, 2, (3, 3), tiles);
    for (id, value) in [(2, 10), (3, 20), (4, 30), (5, 40)] {
        heif.flat_image(id, 2, 2, value).hide(id);
    }
    heif.build()
}

struct ImmediatelyCancelled;

impl Stop for ImmediatelyCancelled {
    fn check(&self) -> std::result::Result<(), StopReason> {
        Err(StopReason::Cancelled)
    }
}

// ============================================================================
// Single images
// ============================================================================

#[test]
fn single_image_has_ispe_dimensions() {
    init_logging();
    let image = one(&simple_file()).expect("decode failed");
    assert_eq!(image.item_id(), 1);
    assert_eq!((image.width(), image.height()), (4, 3));
    assert_eq!(image.pixel_format(), PixelFormat::Monochrome);
    assert_eq!(image.bit_depth(), 8);
    assert_eq!(samples(&image.planes()[0]), (0..12).collect::<Vec<u8>>());
    assert!(image.transforms().is_empty());
    assert!(image.alpha().is_none());
}

#[test]
fn padded_frames_are_cropped_to_ispe() {
    let ramp: Vec<u8> = (0..24).collect();
    let file = HeifBuilder::new()
        .primary(1)
        .item(1, b"hvc1", &bitstream(6, 4, &ramp))
        .property(1, hvcc(), true)
        .property(1, ispe(4, 3), false)
        .build();
    let image = one(&file).unwrap();
    assert_eq!((image.width(), image.height()), (4, 3));
    assert_eq!(samples(&image.planes()[0]), [0, 1, 2, 3, 6, 7, 8, 9, 12, 13, 14, 15]);
}

#[test]
fn frames_smaller_than_ispe_are_invalid() {
    let file = HeifBuilder::new()
        .primary(1)
        .item(1, b"hvc1", &bitstream(2, 2, &[0; 4]))
        .property(1, hvcc(), true)
        .property(1, ispe(4, 4), false)
        .build();
    assert!(matches!(one(&file), Err(Error::InvalidData(_))));
}

#[test]
fn decoder_receives_configuration_and_extents() {
    fn checking(config: &CodecConfig<'_>, coded: &[u8]) -> Result<DecodedPlanes, DecodeFailure> {
        assert_eq!(config.item_id, 1);
        assert_eq!(config.extents, Some((4, 3)));
        assert_eq!(config.hevc.nal_length_size(), 4);
        assert_eq!(config.hevc.chroma_format_idc(), 0);
        assert_eq!(config.hevc.bit_depth_luma(), 8);
        fake_decoder(config, coded)
    }
    decode_one(&simple_file(), &checking, &FormatTable::native()).unwrap();
}

#[test]
fn decoder_errors_name_the_item() {
    let file = HeifBuilder::new()
        .primary(1)
        .item(1, b"hvc1", &[1, 2, 3])
        .property(1, hvcc(), true)
        .property(1, ispe(1, 1), false)
        .build();
    match one(&file) {
        Err(err @ Error::TileDecode { item_id: 1, .. }) => {
            assert_eq!(err.source().map(|s| s.to_string()).as_deref(), Some("bitstream too short"));
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn hvc1_without_hvcc_is_invalid() {
    let file = HeifBuilder::new()
        .primary(1)
        .item(1, b"hvc1", &bitstream(1, 1, &[0]))
        .property(1, ispe(1, 1), false)
        .build();
    assert!(matches!(one(&file), Err(Error::InvalidData(_))));
}

#[test]
fn missing_ispe_is_only_tolerated_when_lenient() {
    let file = HeifBuilder::new()
        .primary(1)
        .item(1, b"hvc1", &bitstream(2, 1, &[7, 8]))
        .property(1, hvcc(), true)
        .build();
    assert!(matches!(one(&file), Err(Error::InvalidData(_))));
    let image = one_with(&file, &DecodeConfig::default().lenient(true)).unwrap();
    assert_eq!((image.width(), image.height()), (2, 1));
}

#[test]
fn split_extents_are_concatenated() {
    let ramp: Vec<u8> = (0..12).collect();
    let coded = bitstream(4, 3, &ramp);
    let file = HeifBuilder::new()
        .primary(1)
        .split_item(1, b"hvc1", &coded)
        .property(1, hvcc(), true)
        .property(1, ispe(4, 3), false)
        .build();
    let parser = HeifParser::from_bytes(&file).unwrap();
    let data = parser.item_data(1).unwrap();
    assert!(matches!(data, Cow::Owned(_)));
    assert_eq!(&data[..], &coded[..]);
    assert_eq!(samples(&one(&file).unwrap().planes()[0]), ramp);

    let single = simple_file();
    let parser = HeifParser::from_bytes(&single).unwrap();
    assert!(matches!(parser.item_data(1).unwrap(), Cow::Borrowed(_)));
}

// ============================================================================
// Grids
// ============================================================================

#[test]
fn grid_tiles_are_placed_in_raster_order() {
    let image = one(&grid_file(&[2, 3, 4, 5])).unwrap();
    assert_eq!((image.width(), image.height()), (3, 3));
    assert_eq!(samples(&image.planes()[0]), [10, 10, 20, 10, 10, 20, 30, 30, 40]);
}

#[test]
fn permuting_dimg_permutes_tiles() {
    let image = one(&grid_file(&[5, 4, 3, 2])).unwrap();
    assert_eq!(samples(&image.planes()[0]), [40, 40, 30, 40, 40, 30, 20, 20, 10]);
}

#[test]
fn grid_tile_count_must_match_layout() {
    match one(&grid_file(&[2, 3, 4])) {
        Err(Error::GridCardinality { item_id, expected, actual }) => {
            assert_eq!((item_id, expected, actual), (1, 4, 3));
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn grid_tile_limit_is_checked_before_decoding() {
    let calls = AtomicUsize::new(0);
    let decoder = counting_decoder(&calls);
    let config = DecodeConfig::default().with_max_grid_tiles(3);
    let result = decode_one_with_config(&grid_file(&[2, 3, 4, 5]), &decoder, &FormatTable::native(), &config, &Unstoppable);
    assert!(matches!(result, Err(Error::ResourceLimitExceeded(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn threaded_and_serial_tile_decoding_agree() {
    let file = grid_file(&[2, 3, 4, 5]);
    let calls = AtomicUsize::new(0);
    let decoder = counting_decoder(&calls);
    let decode = |threads| {
        let config = DecodeConfig::default().with_max_threads(threads);
        decode_one_with_config(&file, &decoder, &FormatTable::native(), &config, &Unstoppable).unwrap()
    };
    let serial = decode(1);
    let threaded = decode(4);
    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert_eq!(serial.planes(), threaded.planes());
}

#[test]
fn grid_tile_failures_name_the_tile() {
    let mut heif = HeifBuilder::new();
    heif.primary(1).grid(1, 1, 2, (4, 2), &[2, 3]).flat_image(2, 2, 2, 0);
    heif.item(3, b"hvc1", &[0]).property(3, hvcc(), true).property(3, ispe(2, 2), false);
    assert!(matches!(one(&heif.build()), Err(Error::TileDecode { item_id: 3, .. })));

    let mut heif = HeifBuilder::new();
    heif.primary(1).grid(1, 1, 2, (4, 2), &[2, 3]).flat_image(2, 2, 2, 0);
    heif.item(3, b"av01", &[0]).property(3, ispe(2, 2), false);
    match one(&heif.build()) {
        Err(Error::UnsupportedCodec { item_id, item_type }) => {
            assert_eq!(item_id, 3);
            assert_eq!(item_type, *b"av01");
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn parser_exposes_grid_layout_and_tiles() {
    let file = grid_file(&[2, 3, 4, 5]);
    let parser = HeifParser::from_bytes(&file).unwrap();
    assert_eq!(
        parser.grid_layout(1).unwrap(),
        Some(GridLayout { rows: 2, columns: 2, output_width: 3, output_height: 3 })
    );
    assert_eq!(parser.grid_tile_ids(1).unwrap(), [2, 3, 4, 5]);
    assert_eq!(parser.grid_layout(2).unwrap(), None);
    assert_eq!(parser.image_extents(1), Some((3, 3)));
    assert_eq!(parser.top_level_image_ids().unwrap(), [1]);
}

// ============================================================================
// Transforms
// ============================================================================

#[test]
fn rotation_is_applied_before_mirroring() {
    // properties in the opposite order to make sure the order is fixed
    let file = HeifBuilder::new()
        .primary(1)
        .image(1, 3, 2, &[1, 2, 3, 4, 5, 6])
        .property(1, imir(0), true)
        .property(1, irot(1), true)
        .build();
    let image = one(&file).unwrap();
    assert_eq!((image.width(), image.height()), (2, 3));
    assert_eq!(samples(&image.planes()[0]), [6, 3, 5, 2, 4, 1]);
    assert_eq!(
        image.transforms(),
        [Transform::Rotate { degrees: 90 }, Transform::Mirror(MirrorAxis::Vertical)]
    );
}

#[test]
fn top_bottom_mirror() {
    let file = HeifBuilder::new()
        .primary(1)
        .image(1, 3, 2, &[1, 2, 3, 4, 5, 6])
        .property(1, imir(1), true)
        .build();
    assert_eq!(samples(&one(&file).unwrap().planes()[0]), [4, 5, 6, 1, 2, 3]);
}

#[test]
fn clean_aperture_crops_around_the_centre() {
    let ramp: Vec<u8> = (0..16).collect();
    let file = HeifBuilder::new()
        .primary(1)
        .image(1, 4, 4, &ramp)
        .property(1, clap((2, 1), (2, 1), (0, 1), (0, 1)), true)
        .build();
    let image = one(&file).unwrap();
    assert_eq!(samples(&image.planes()[0]), [5, 6, 9, 10]);
    assert_eq!(image.transforms(), [Transform::Crop { x: 1, y: 1, width: 2, height: 2 }]);

    let outside = HeifBuilder::new()
        .primary(1)
        .image(1, 4, 4, &ramp)
        .property(1, clap((4, 1), (4, 1), (1, 1), (0, 1)), true)
        .build();
    assert!(matches!(one(&outside), Err(Error::InvalidData(_))));
}

#[test]
fn identity_items_apply_their_own_transforms() {
    let file = HeifBuilder::new()
        .primary(1)
        .item(1, b"iden", &[])
        .property(1, irot(2), true)
        .reference(b"dimg", 1, &[2])
        .image(2, 2, 1, &[1, 2])
        .hide(2)
        .build();
    let image = one(&file).unwrap();
    assert_eq!(samples(&image.planes()[0]), [2, 1]);
    assert_eq!(image.transforms(), [Transform::Rotate { degrees: 180 }]);
}

#[test]
fn overlays_are_unsupported() {
    let file = HeifBuilder::new()
        .primary(1)
        .idat_item(1, b"iovl", &[0, 0, 0, 0, 0, 0, 0, 4, 0, 4])
        .reference(b"dimg", 1, &[2])
        .flat_image(2, 4, 4, 0)
        .build();
    assert!(matches!(one(&file), Err(Error::Unsupported(_))));
}

// ============================================================================
// Alpha and colour
// ============================================================================

#[test]
fn alpha_plane_is_attached() {
    let file = HeifBuilder::new()
        .primary(1)
        .flat_image(1, 2, 2, 50)
        .alpha(2, 1, 2, 2, &[0, 85, 170, 255])
        .reference(b"prem", 1, &[2])
        .build();
    let image = one(&file).unwrap();
    let alpha = image.alpha().expect("alpha");
    assert_eq!(samples(alpha), [0, 85, 170, 255]);
    assert!(image.is_premultiplied());

    let parser = HeifParser::from_bytes(&file).unwrap();
    assert_eq!(parser.alpha_item_id(1), Some(2));
    assert_eq!(parser.top_level_image_ids().unwrap(), [1]);
}

#[test]
fn alpha_must_match_the_colour_image() {
    let file = HeifBuilder::new()
        .primary(1)
        .flat_image(1, 2, 2, 50)
        .alpha(2, 1, 1, 1, &[255])
        .build();
    assert!(matches!(one(&file), Err(Error::InvalidData(_))));
    let set = decode_all(&file, &fake_decoder, &FormatTable::native()).unwrap();
    assert!(set.images.is_empty());
    assert_eq!(set.failures[0].item_id, 1);
}

#[test]
fn colour_information_is_reported() {
    let file = HeifBuilder::new()
        .primary(1)
        .flat_image(1, 1, 1, 0)
        .property(1, colr_nclx(1, 13, 6, true), false)
        .build();
    assert_eq!(
        one(&file).unwrap().color(),
        Some(&ColorInfo::Nclx {
            colour_primaries: 1,
            transfer_characteristics: 13,
            matrix_coefficients: 6,
            full_range: true,
        })
    );
}

#[test]
fn grids_borrow_colour_from_their_first_tile() {
    let mut heif = HeifBuilder::new();
    heif.primary(1).grid(1, 1, 2, (4, 2), &[2, 3]);
    heif.flat_image(2, 2, 2, 0).property(2, colr_icc(b"fake icc"), false);
    heif.flat_image(3, 2, 2, 0);
    let image = one(&heif.build()).unwrap();
    assert_eq!(image.color(), Some(&ColorInfo::Icc(b"fake icc".to_vec())));
}

// ============================================================================
// decode_all
// ============================================================================

#[test]
fn decode_all_reports_unsupported_items_alongside_images() {
    let file = HeifBuilder::new()
        .primary(1)
        .flat_image(1, 2, 2, 1)
        .item(2, b"av01", &[0x12, 0])
        .property(2, ispe(2, 2), false)
        .build();
    let set = decode_all(&file, &fake_decoder, &FormatTable::native()).unwrap();
    assert_eq!(set.images.len(), 1);
    assert_eq!(set.images[0].item_id(), 1);
    assert_eq!(set.failures.len(), 1);
    match &set.failures[0] {
        zenheic_decode::ItemFailure { item_id: 2, error: Error::UnsupportedCodec { item_id: 2, item_type } } => {
            assert_eq!(*item_type, *b"av01");
        },
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn decode_all_picks_top_level_images() {
    let mut heif = HeifBuilder::new();
    heif.flat_image(9, 1, 1, 9).primary(1).grid(1, 2, 2, (3, 3), &[2, 3, 4, 5]);
    for id in 2..=5 {
        heif.flat_image(id, 2, 2, 0);
    }
    heif.flat_image(6, 1, 1, 6).reference(b"thmb", 6, &[1]);
    heif.item(7, b"Exif", b"\0\0\0\0MM\0*");
    heif.flat_image(8, 1, 1, 8).hide(8);
    let file = heif.build();

    let parser = HeifParser::from_bytes(&file).unwrap();
    assert_eq!(parser.top_level_image_ids().unwrap(), [1, 9]);
    let items: Vec<_> = parser.items().map(|i| (i.item_id, i.hidden)).collect();
    assert_eq!(items.len(), 9);
    assert!(items.contains(&(8, true)));

    let set = decode_all(&file, &fake_decoder, &FormatTable::native()).unwrap();
    let ids: Vec<_> = set.images.iter().map(|i| i.item_id()).collect();
    assert_eq!(ids, [1, 9]);
    assert!(set.failures.is_empty());
}

#[test]
fn missing_primary_item_only_fails_single_decode() {
    let file = HeifBuilder::new().flat_image(1, 1, 1, 0).build();
    assert!(matches!(one(&file), Err(Error::MissingPrimaryItem)));
    let set = decode_all(&file, &fake_decoder, &FormatTable::native()).unwrap();
    assert_eq!(set.images.len(), 1);
}

#[test]
fn heic_decoder_bundles_decoder_and_formats() {
    let decoder = HeicDecoder::new(fake_decoder, FormatTable::browser());
    assert_eq!(decoder.formats(), &FormatTable::browser());
    let file = simple_file();
    assert_eq!(decoder.one(&file).unwrap().width(), 4);
    assert_eq!(decoder.all(&file).unwrap().images.len(), 1);
    let config = DecodeConfig::default();
    assert!(decoder.one_with_config(&file, &config, &Unstoppable).is_ok());
    assert!(matches!(
        decoder.all_with_config(&file, &config, &ImmediatelyCancelled),
        Err(Error::Stopped(StopReason::Cancelled))
    ));
}

// ============================================================================
// Container errors
// ============================================================================

#[test]
fn truncation_anywhere_is_reported_as_truncation() {
    init_logging();
    let file = simple_file();
    let boxes = top_level_boxes(&file);
    let names: Vec<_> = boxes.iter().map(|(name, _)| name).collect();
    assert_eq!(names, [b"ftyp", b"meta", b"mdat"]);
    let (ftyp, meta, mdat) = (boxes[0].1.clone(), boxes[1].1.clone(), boxes[2].1.clone());

    let cuts = [
        3,
        ftyp.end - 1,
        meta.start + 3,
        meta.start + 20,
        meta.end - 1,
        // at the meta/mdat boundary the item data is missing
        meta.end,
        mdat.start + 4,
        mdat.start + 9,
        mdat.end - 1,
    ];
    for cut in cuts {
        let truncated = &file[..cut];
        assert!(matches!(one(truncated), Err(Error::TruncatedInput)), "cut at {cut}");
        assert!(
            matches!(decode_all(truncated, &fake_decoder, &FormatTable::native()), Err(Error::TruncatedInput)),
            "cut at {cut}"
        );
    }
    assert!(matches!(one(&file[..ftyp.end]), Err(Error::MissingMeta)));
    assert!(matches!(one(&[]), Err(Error::TruncatedInput)));
}

#[test]
fn missing_meta() {
    let mut file = boxed(b"ftyp", b"heic\0\0\0\0mif1heic");
    file.extend(boxed(b"mdat", &[0; 16]));
    assert!(matches!(one(&file), Err(Error::MissingMeta)));
}

#[test]
fn child_boxes_overrunning_their_parent_are_malformed() {
    let mut file = simple_file();
    let meta = top_level_boxes(&file)[1].1.clone();
    // first child of meta (hdlr) claims more than meta holds
    let hdlr_size = meta.start + 12;
    file[hdlr_size..hdlr_size + 4].copy_from_slice(&0xffffu32.to_be_bytes());
    assert!(matches!(one(&file), Err(Error::MalformedBox(_))));
}

fn invalid_data_message(file: &[u8]) -> &'static str {
    match HeifParser::from_bytes(file).and_then(|_| one(file)) {
        Err(Error::InvalidData(msg)) => msg,
        other => panic!("expected invalid data, got {other:?}"),
    }
}

#[test]
fn duplicate_item_ids_are_invalid() {
    // second infe for item 1, without any data of its own
    let file = HeifBuilder::new().primary(1).flat_image(1, 2, 2, 0).item(1, b"Exif", &[]).build();
    assert_eq!(invalid_data_message(&file), "duplicate item_id in iinf");

    // two distinct infe, but both iloc entries claim item 1
    let mut file = HeifBuilder::new().primary(1).flat_image(1, 2, 2, 0).item(2, b"Exif", b"exif").build();
    let iloc = file.windows(4).position(|w| w == b"iloc").unwrap();
    // type, version/flags, size fields, count, then one 16-byte entry
    let second_id = iloc + 4 + 4 + 2 + 2 + 16;
    assert_eq!(file[second_id..second_id + 2], [0, 2]);
    file[second_id..second_id + 2].copy_from_slice(&[0, 1]);
    assert_eq!(invalid_data_message(&file), "duplicate item_id in iloc");
}

#[test]
fn second_meta_box_is_invalid() {
    let file = simple_file();
    let meta = top_level_boxes(&file)[1].clone();
    assert_eq!(&meta.0, b"meta");
    let mut doubled = file[..meta.1.end].to_vec();
    doubled.extend_from_slice(&file[meta.1.clone()]);
    doubled.extend_from_slice(&file[meta.1.end..]);
    assert!(matches!(HeifParser::from_bytes(&doubled), Err(Error::InvalidData(_))));
    assert!(matches!(one(&doubled), Err(Error::InvalidData(_))));
}

#[test]
fn primary_item_must_exist() {
    let file = HeifBuilder::new().primary(9).flat_image(1, 2, 2, 0).build();
    assert_eq!(invalid_data_message(&file), "primary_item_id not present in iinf box");
}

#[test]
fn grid_with_two_dimg_references_is_invalid() {
    let mut heif = HeifBuilder::new();
    heif.primary(1).grid(1, 2, 2, (3, 3), &[2, 3, 4, 5]).reference(b"dimg", 1, &[5, 4, 3, 2]);
    for id in 2..=5 {
        heif.flat_image(id, 2, 2, 0).hide(id);
    }
    let file = heif.build();
    match one(&file) {
        Err(Error::InvalidData(msg)) => assert_eq!(msg, "more than one reference of the same type from one item"),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn brand_and_handler_checks_are_relaxed_when_lenient() {
    let lenient = DecodeConfig::default().lenient(true);

    let ramp: Vec<u8> = (0..4).collect();
    let avif_branded = HeifBuilder::new().brands(b"avif", &[*b"avif"]).primary(1).image(1, 2, 2, &ramp).build();
    assert!(matches!(one(&avif_branded), Err(Error::InvalidData(_))));
    assert!(one_with(&avif_branded, &lenient).is_ok());

    let other_handler = HeifBuilder::new().handler(b"vide").primary(1).image(1, 2, 2, &ramp).build();
    assert!(matches!(one(&other_handler), Err(Error::InvalidData(_))));
    assert!(one_with(&other_handler, &lenient).is_ok());
}

#[test]
fn unknown_essential_properties_fail_the_item() {
    let file = HeifBuilder::new()
        .primary(1)
        .flat_image(1, 1, 1, 0)
        .property(1, boxed(b"zzzz", &[1, 2, 3]), true)
        .build();
    assert!(matches!(one(&file), Err(Error::Unsupported(_))));
    assert!(one_with(&file, &DecodeConfig::default().lenient(true)).is_ok());

    let optional = HeifBuilder::new()
        .primary(1)
        .flat_image(1, 1, 1, 0)
        .property(1, boxed(b"zzzz", &[1, 2, 3]), false)
        .build();
    assert!(one(&optional).is_ok());
}

// ============================================================================
// Limits, output layout and cancellation
// ============================================================================

#[test]
fn megapixel_limit_uses_declared_extents() {
    let file = HeifBuilder::new()
        .primary(1)
        .item(1, b"hvc1", &bitstream(1, 1, &[0]))
        .property(1, hvcc(), true)
        .property(1, ispe(2000, 1000), false)
        .build();
    let config = DecodeConfig::default().with_total_megapixels_limit(1);
    assert!(matches!(one_with(&file, &config), Err(Error::ResourceLimitExceeded(_))));
}

#[test]
fn peak_memory_limit() {
    let config = DecodeConfig::default().with_peak_memory_limit(8);
    assert!(matches!(one_with(&simple_file(), &config), Err(Error::ResourceLimitExceeded(_))));
    assert!(one_with(&simple_file(), &DecodeConfig::unlimited()).is_ok());
}

#[test]
fn failed_items_do_not_use_up_the_memory_budget() {
    // item 1 reserves its 2x2 frame, then the decoder rejects it
    let file = HeifBuilder::new()
        .primary(1)
        .item(1, b"hvc1", &[0])
        .property(1, hvcc(), true)
        .property(1, ispe(2, 2), false)
        .flat_image(2, 2, 2, 7)
        .build();
    let config = DecodeConfig::default().with_peak_memory_limit(4);
    let set = decode_all_with_config(&file, &fake_decoder, &FormatTable::native(), &config, &Unstoppable).unwrap();

    let ids: Vec<_> = set.images.iter().map(|i| i.item_id()).collect();
    assert_eq!(ids, [2]);
    assert_eq!(samples(&set.images[0].planes()[0]), [7; 4]);
    assert_eq!(set.failures.len(), 1);
    assert_eq!(set.failures[0].item_id, 1);
    assert!(matches!(set.failures[0].error, Error::TileDecode { item_id: 1, .. }));
}

#[test]
fn frames_already_at_their_final_size_are_not_reaccounted() {
    // exactly one 4x3 frame fits; cropping to ispe or a full-frame clap
    // must not ask for a second one
    let samples: Vec<u8> = (0..12).collect();
    let file = HeifBuilder::new()
        .primary(1)
        .image(1, 4, 3, &samples)
        .property(1, clap((4, 1), (3, 1), (0, 1), (0, 1)), true)
        .build();
    let config = DecodeConfig::default().with_peak_memory_limit(12);
    let image = one_with(&file, &config).unwrap();
    assert_eq!((image.width(), image.height()), (4, 3));
}

#[test]
fn format_table_controls_output_layout() {
    let file = simple_file();
    let aligned = decode_one(&file, &fake_decoder, &FormatTable::native().with_row_alignment(8)).unwrap();
    let plane = &aligned.planes()[0];
    assert_eq!(plane.stride(), 8);
    assert_eq!(plane.row(1), Some(&[4, 5, 6, 7][..]));
    assert_eq!(samples(plane), (0..12).collect::<Vec<u8>>());

    let small = FormatTable::native().with_max_dimension(3);
    assert!(matches!(decode_one(&file, &fake_decoder, &small), Err(Error::ResourceLimitExceeded(_))));
}

#[test]
fn cancellation_stops_parsing_and_decoding() {
    let file = simple_file();
    let config = DecodeConfig::default();
    match decode_one_with_config(&file, &fake_decoder, &FormatTable::native(), &config, &ImmediatelyCancelled) {
        Err(Error::Stopped(reason)) => assert_eq!(reason, StopReason::Cancelled),
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(
        HeifParser::from_bytes_with_config(&file, &config, &ImmediatelyCancelled),
        Err(Error::Stopped(_))
    ));
    assert!(matches!(
        decode_all_with_config(&file, &fake_decoder, &FormatTable::native(), &config, &ImmediatelyCancelled),
        Err(Error::Stopped(_))
    ));
}

// ============================================================================
// Container view
// ============================================================================

#[test]
fn parser_reports_brands_items_and_properties() {
    let file = HeifBuilder::new()
        .primary(1)
        .image(1, 4, 2, &[0; 8])
        .property(1, irot(3), true)
        .property(1, imir(1), true)
        .property(1, pixi(&[8]), false)
        .build();
    let parser = HeifParser::from_bytes(&file).unwrap();
    assert_eq!(parser.major_brand(), *b"heic");
    assert_eq!(parser.compatible_brands(), [FourCC::from(*b"mif1"), FourCC::from(*b"heic")]);
    assert_eq!(parser.primary_item_id(), Some(1));
    let item = parser.items().next().unwrap();
    assert_eq!((item.item_id, item.item_type, item.name, item.hidden), (1, FourCC::from(*b"hvc1"), "", false));
    assert_eq!(parser.image_extents(1), Some((4, 2)));
    assert_eq!(parser.rotation(1), Some(270));
    assert_eq!(parser.mirror(1), Some(MirrorAxis::Horizontal));
    assert_eq!(parser.channel_depths(1), Some(&[8][..]));
    assert_eq!(parser.clean_aperture(1), None);
    assert_eq!(parser.hevc_config(1).map(|c| c.general_level_idc()), Some(0x5a));
    assert!(!parser.is_premultiplied(1));

    let tree = parser.describe_boxes();
    assert!(tree.starts_with("ftyp @0"));
    assert!(tree.contains("\n  iloc @"));
    assert!(tree.contains("\n      ispe @"));
}

#[test]
fn corpus_files_parse() {
    init_logging();
    let mut errors = 0;
    for entry in walkdir::WalkDir::new(CORPUS) {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        let ext = path.extension().unwrap_or_default();
        if !path.is_file() || (ext != "heic" && ext != "heif") {
            continue;
        }
        log::debug!("parsing {:?}", path.display());
        let bytes = std::fs::read(path).expect("bad file");
        match HeifParser::from_bytes(&bytes) {
            Ok(parser) => {
                for id in parser.top_level_image_ids().unwrap() {
                    if parser.grid_layout(id).unwrap().is_none() {
                        let _ = parser.item_data(id).unwrap();
                    }
                }
            },
            Err(Error::Unsupported(why)) => log::warn!("{why}"),
            Err(err) => {
                log::error!("{:?}: {err}", path.display());
                errors += 1;
            },
        }
    }
    assert_eq!(0, errors);
}
