//! HeapMap images

use std::collections::HashSet;

use heapmap::config::DEFAULT_GROWTH_INCREMENT;
use heapmap::map::{ImageSummary, Options};
use heapmap::{Config, HeapError, HeapMap, Int32Keys, KeyOrder, ObjectKeys, StringCodec};
use tempfile::TempDir;

use crate::{filled_map, key, value, StringMap};

fn reload(map: &StringMap, copy: bool) -> heapmap::Result<StringMap> {
    HeapMap::load(map.serialize(), ObjectKeys::new(StringCodec), StringCodec, copy)
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_round_trip_in_memory() {
    let map = filled_map(1500, 6);

    for copy in [false, true] {
        let mut loaded = reload(&map, copy).unwrap();
        assert_eq!(loaded.len(), 1500);
        assert_eq!(loaded.segments().len(), 6);
        assert_eq!(loaded.table_size(), map.table_size());
        assert_eq!(loaded.options(), map.options());
        assert_eq!(loaded.verify().unwrap(), 1500);
        for i in (0..1500).step_by(11) {
            assert_eq!(loaded.get(&key(i)).unwrap(), Some(value(i)));
        }
    }
}

#[test]
fn test_save_and_load_from_path() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("maps").join("users.img");
    let map = filled_map(800, 3);

    map.save_on(&path).unwrap();
    let mut loaded = HeapMap::load_from(&path, ObjectKeys::new(StringCodec), StringCodec).unwrap();

    assert_eq!(loaded.len(), 800);
    assert_eq!(loaded.get(&key(799)).unwrap(), Some(value(799)));

    loaded.put(&key(800), &value(800)).unwrap();
    loaded.remove(&key(0)).unwrap();
    assert_eq!(loaded.verify().unwrap(), 800);
}

#[test]
fn test_timestamped_int32_round_trip() {
    let config = Config::builder()
        .segments(2)
        .table_size(53)
        .timestamps(true)
        .build()
        .unwrap();
    let mut map = HeapMap::int32(StringCodec, &config).unwrap();
    for k in 0..400 {
        map.put(&k, &k.to_string()).unwrap();
    }
    let stamp = map.last_touched(&17).unwrap();

    let mut loaded = HeapMap::load(map.serialize(), Int32Keys, StringCodec, false).unwrap();

    assert!(loaded.options().timestamps());
    assert_eq!(loaded.last_touched(&17).unwrap(), stamp);
    assert_eq!(loaded.get(&399).unwrap(), Some("399".to_string()));
}

/// Bytes the first segment grew by once new puts outran its free space
fn growth_after_load(map: &mut HeapMap<Int32Keys, StringCodec>) -> usize {
    let before = map.stats()[0].reserved;
    for k in 1000..100_000 {
        map.put(&k, &k.to_string()).unwrap();
        let after = map.stats()[0].reserved;
        if after != before {
            return after - before;
        }
    }
    panic!("storage never grew");
}

#[test]
fn test_growth_increment_after_load() {
    let config = Config::builder()
        .table_size(31)
        .growth_increment(4096)
        .build()
        .unwrap();
    let mut map = HeapMap::int32(StringCodec, &config).unwrap();
    for k in 0..100 {
        map.put(&k, &k.to_string()).unwrap();
    }
    let image = map.serialize();

    let mut custom = HeapMap::load(image.clone(), Int32Keys, StringCodec, true).unwrap();
    custom.set_growth_increment(4096);
    let grown = growth_after_load(&mut custom);
    assert_eq!(grown % 4096, 0);
    assert!(grown < DEFAULT_GROWTH_INCREMENT);

    let mut plain = HeapMap::load(image, Int32Keys, StringCodec, false).unwrap();
    assert_eq!(growth_after_load(&mut plain) % DEFAULT_GROWTH_INCREMENT, 0);
}

// =============================================================================
// Summary Tests
// =============================================================================

#[test]
fn test_image_summary() {
    let map = filled_map(600, 4);
    let image = map.serialize();

    let summary = ImageSummary::read(&image).unwrap();

    assert_eq!(summary.segments.len(), 4);
    assert_eq!(summary.table_size, 257);
    assert_eq!(summary.entries(), 600);
    assert_eq!(summary.options, map.options());
    assert_eq!(
        summary.segments.iter().map(|s| s.image_len).sum::<usize>() + 12,
        image.len()
    );

    let ids: HashSet<i64> = summary.segments.iter().map(|s| s.storage_id).collect();
    assert_eq!(ids.len(), 4);

    for (segment, stats) in summary.segments.iter().zip(map.stats()) {
        assert_eq!(segment.heap, stats);
    }
}

#[test]
fn test_summary_of_truncated_image() {
    let map = filled_map(100, 2);
    let mut image = map.serialize();
    image.truncate(image.len() - 1);

    assert!(ImageSummary::read(&image).unwrap_err().is_underflow());
}

// =============================================================================
// Option Flag Tests
// =============================================================================

#[test]
fn test_option_flags() {
    let flags = Options::new(true, KeyOrder::Bytes);
    assert_eq!(flags.bits(), Options::TIMESTAMPS | Options::BYTE_ORDER);
    assert_eq!(Options::from_bits(flags.bits()).unwrap(), flags);

    let plain = Options::from_bits(Options::HASH_THEN_BYTE_ORDER).unwrap();
    assert!(!plain.timestamps());
    assert_eq!(plain.key_order(), KeyOrder::HashThenBytes);
    assert_eq!(
        Options::from_bits(Options::NATURAL_ORDER).unwrap().key_order(),
        KeyOrder::Natural
    );

    for bad in [0, Options::TIMESTAMPS, 0x6, 0x10 | Options::BYTE_ORDER] {
        assert!(Options::from_bits(bad).is_err(), "flags {:#x} accepted", bad);
    }
}

// =============================================================================
// Malformed Image Tests
// =============================================================================

#[test]
fn test_truncated_map_is_underflow() {
    let map = filled_map(2000, 3);
    let mut image = map.serialize();
    let half = image.len() / 2;
    image.truncate(half);

    let err = HeapMap::load(image, ObjectKeys::new(StringCodec), StringCodec, false)
        .err()
        .unwrap();
    assert!(err.is_underflow(), "unexpected error: {}", err);
}

#[test]
fn test_trailing_bytes_are_underflow() {
    let map = filled_map(10, 2);
    let mut image = map.serialize();
    image.extend_from_slice(b"junk");

    let err = HeapMap::load(image, ObjectKeys::new(StringCodec), StringCodec, false)
        .err()
        .unwrap();
    assert!(err.is_underflow(), "unexpected error: {}", err);
}

#[test]
fn test_unknown_flags_are_rejected() {
    let map = filled_map(10, 1);
    let mut image = map.serialize();
    image[8..12].copy_from_slice(&0u32.to_le_bytes());

    let err = HeapMap::load(image, ObjectKeys::new(StringCodec), StringCodec, false)
        .err()
        .unwrap();
    assert!(matches!(err, HeapError::InvalidImage(_)));
}
