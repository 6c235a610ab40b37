//! Key orders and iteration

use heapmap::{Config, HeapError, I32Codec, KeyOrder, ObjectKeys, Segment, StringCodec};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::{int_segment, put, string_segment};

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_single_bucket_iterates_in_key_order() {
    let mut segment = int_segment(1);
    let mut keys: Vec<i32> = (-50..50).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(7));
    for key in &keys {
        put(&mut segment, *key, &key.to_string());
    }

    let iterated: Vec<i32> = segment.keys().map(Result::unwrap).collect();
    assert_eq!(iterated, (-50..50).collect::<Vec<_>>());
}

#[test]
fn test_iteration_is_bucket_then_key_order() {
    let mut segment = int_segment(10);
    for key in (0..100).rev() {
        put(&mut segment, key, "v");
    }

    let iterated: Vec<i32> = segment.keys().map(Result::unwrap).collect();
    let mut expected: Vec<i32> = (0..100).collect();
    expected.sort_by_key(|k| (k % 10, *k));
    assert_eq!(iterated, expected);
}

#[test]
fn test_iterators_restart_and_agree() {
    let mut segment = int_segment(13);
    for key in 0..200 {
        put(&mut segment, key, &format!("v{}", key));
    }

    let first: Vec<i32> = segment.keys().map(Result::unwrap).collect();
    let second: Vec<i32> = segment.keys().map(Result::unwrap).collect();
    assert_eq!(first, second);
    assert_eq!(first.len(), 200);

    let values: Vec<String> = segment.values().map(Result::unwrap).collect();
    let entries: Vec<(i32, String)> = segment.entries().map(Result::unwrap).collect();
    for ((key, value), (k, v)) in first.iter().zip(values.iter()).zip(entries.iter()) {
        assert_eq!(key, k);
        assert_eq!(value, v);
        assert_eq!(*v, format!("v{}", k));
    }
}

#[test]
fn test_empty_segment_iterates_nothing() {
    let segment = int_segment(64);
    assert_eq!(segment.keys().count(), 0);
    assert_eq!(segment.entries().count(), 0);
}

// =============================================================================
// Key Order Tests
// =============================================================================

#[test]
fn test_natural_order_sorts_strings() {
    let keys = ObjectKeys::sorted(StringCodec);
    let mut segment = Segment::new(keys, I32Codec, &Config::sorted()).unwrap();

    for word in ["pear", "apple", "fig", "banana", "cherry", "a", "zz"] {
        let key = word.to_string();
        let hash = segment.hash(&key).unwrap();
        segment.put(hash, &key, &(word.len() as i32), false, false).unwrap();
    }

    let iterated: Vec<String> = segment.keys().map(Result::unwrap).collect();
    assert_eq!(
        iterated,
        ["a", "apple", "banana", "cherry", "fig", "pear", "zz"]
    );
    assert_eq!(segment.verify().unwrap(), 7);
}

#[test]
fn test_natural_order_needs_sorted_keys() {
    let result = Segment::new(ObjectKeys::new(StringCodec), I32Codec, &Config::sorted());
    assert!(matches!(result, Err(HeapError::Config(_))));
}

#[test]
fn test_byte_order_on_big_endian_ints() {
    let config = Config::builder()
        .table_size(1)
        .key_order(KeyOrder::Bytes)
        .build()
        .unwrap();
    let mut segment = Segment::new(ObjectKeys::new(I32Codec), I32Codec, &config).unwrap();

    let mut keys: Vec<i32> = (0..300).map(|k| k * 997).collect();
    keys.shuffle(&mut StdRng::seed_from_u64(3));
    for key in &keys {
        let hash = segment.hash(key).unwrap();
        segment.put(hash, key, key, false, false).unwrap();
    }

    let iterated: Vec<i32> = segment.keys().map(Result::unwrap).collect();
    keys.sort();
    assert_eq!(iterated, keys);
}

#[test]
fn test_hash_order_sorts_by_hash_within_bucket() {
    let config = Config::builder().table_size(1).build().unwrap();
    let mut segment = string_segment(&config);
    for i in 0..100 {
        let key = format!("k{}", i);
        let hash = segment.hash(&key).unwrap();
        segment.put(hash, &key, &i, false, false).unwrap();
    }

    let hashes: Vec<i32> = segment
        .keys()
        .map(|k| segment.hash(&k.unwrap()).unwrap())
        .collect();
    assert!(hashes.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(segment.verify().unwrap(), 100);
}
