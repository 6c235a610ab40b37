//! Tests for HeapVec
//!
//! These tests verify:
//! - Push, indexed get/set and holes left by sparse writes
//! - Pop and poll from both ends
//! - Index table growth and value chunk reuse
//! - Array images and malformed images

use heapmap::{HeapError, HeapVec, StringCodec};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn element(i: usize) -> String {
    format!("{{\"age\":{},\"name\":\"John Armless#{}\"}}", i % 90, i)
}

fn filled(count: usize) -> HeapVec<StringCodec> {
    let mut vec = HeapVec::new(16, StringCodec, 32).unwrap();
    for i in 0..count {
        vec.push(&element(i)).unwrap();
    }
    vec
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_new_vec_is_empty() {
    let vec = HeapVec::new(100, StringCodec, 16).unwrap();
    assert!(vec.is_empty());
    assert!(vec.capacity() >= 128);
    assert_eq!(vec.get(0).unwrap(), None);
}

#[test]
fn test_push_and_get() {
    let vec = filled(1000);

    assert_eq!(vec.len(), 1000);
    for i in 0..1000 {
        assert_eq!(vec.get(i).unwrap(), Some(element(i)));
    }
    assert_eq!(vec.get(1000).unwrap(), None);
}

#[test]
fn test_sparse_set_leaves_holes() {
    let mut vec = HeapVec::new(8, StringCodec, 8).unwrap();
    vec.set(3, &"three".to_string()).unwrap();
    vec.set(10, &"ten".to_string()).unwrap();

    assert_eq!(vec.len(), 11);
    assert_eq!(vec.get(0).unwrap(), None);
    assert_eq!(vec.get(3).unwrap(), Some("three".to_string()));

    let present: Vec<usize> = vec
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.unwrap().map(|_| i))
        .collect();
    assert_eq!(present, vec![3, 10]);
}

#[test]
fn test_overwrite_reuses_or_replaces_chunk() {
    let mut vec = HeapVec::new(8, StringCodec, 8).unwrap();
    vec.set(0, &"aaaa".to_string()).unwrap();
    let occupied = vec.storage().stats().occupied;

    vec.set(0, &"bbbb".to_string()).unwrap();
    assert_eq!(vec.storage().stats().occupied, occupied);

    let long = "c".repeat(1000);
    vec.set(0, &long).unwrap();
    assert!(vec.storage().stats().occupied > occupied);
    assert_eq!(vec.get(0).unwrap(), Some(long));
    assert_eq!(vec.len(), 1);
}

// =============================================================================
// Pop / Poll Tests
// =============================================================================

#[test]
fn test_pop_from_back() {
    let mut vec = filled(10);

    assert_eq!(vec.pop().unwrap(), Some(element(9)));
    assert_eq!(vec.pop().unwrap(), Some(element(8)));
    assert_eq!(vec.len(), 8);
    assert_eq!(vec.get(8).unwrap(), None);
}

#[test]
fn test_poll_from_front() {
    let mut vec = filled(5);

    assert_eq!(vec.poll().unwrap(), Some(element(0)));
    assert_eq!(vec.len(), 4);
    for i in 0..4 {
        assert_eq!(vec.get(i).unwrap(), Some(element(i + 1)));
    }

    vec.push(&"tail".to_string()).unwrap();
    assert_eq!(vec.get(4).unwrap(), Some("tail".to_string()));
}

#[test]
fn test_drain_releases_storage() {
    let mut vec = filled(200);
    let empty_table = HeapVec::new(16, StringCodec, 32).unwrap();
    let table_only = empty_table.storage().stats().occupied;

    while vec.poll().unwrap().is_some() {}

    assert!(vec.is_empty());
    assert_eq!(vec.pop().unwrap(), None);
    assert_eq!(vec.poll().unwrap(), None);
    // only the index table is left, possibly larger after growth
    assert!(vec.storage().stats().occupied >= table_only);
    assert!(vec.storage().stats().occupied <= vec.capacity() * 4 + 16);
}

// =============================================================================
// Growth Tests
// =============================================================================

#[test]
fn test_index_table_grows() {
    let mut vec = HeapVec::new(1, StringCodec, 4).unwrap();
    let initial = vec.capacity();

    for i in 0..initial * 3 {
        vec.push(&element(i)).unwrap();
    }

    assert!(vec.capacity() >= initial * 3);
    for i in 0..initial * 3 {
        assert_eq!(vec.get(i).unwrap(), Some(element(i)));
    }
}

#[test]
fn test_set_far_past_capacity() {
    let mut vec = HeapVec::new(1, StringCodec, 4).unwrap();
    vec.set(5000, &"far".to_string()).unwrap();

    assert_eq!(vec.len(), 5001);
    assert!(vec.capacity() > 5000);
    assert_eq!(vec.get(5000).unwrap(), Some("far".to_string()));
    assert_eq!(vec.get(4999).unwrap(), None);
}

// =============================================================================
// Image Tests
// =============================================================================

#[test]
fn test_round_trip() {
    let vec = filled(700);

    for copy in [false, true] {
        let mut loaded = HeapVec::load(vec.serialize(), StringCodec, copy).unwrap();
        assert_eq!(loaded.len(), 700);
        assert_eq!(loaded.capacity(), vec.capacity());
        assert_eq!(loaded.get(699).unwrap(), Some(element(699)));

        loaded.push(&"after".to_string()).unwrap();
        assert_eq!(loaded.get(700).unwrap(), Some("after".to_string()));
    }
}

#[test]
fn test_save_and_load_from_path() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("arrays").join("a.img");
    let vec = filled(50);

    vec.save_on(&path).unwrap();
    let loaded = HeapVec::load_from(&path, StringCodec).unwrap();

    assert_eq!(loaded.len(), 50);
    assert_eq!(loaded.get(0).unwrap(), Some(element(0)));
}

#[test]
fn test_truncated_image_is_underflow() {
    let vec = filled(50);
    let mut image = vec.serialize();
    image.truncate(image.len() - 100);

    let err = HeapVec::load(image, StringCodec, false).err().unwrap();
    assert!(err.is_underflow(), "unexpected error: {}", err);
}

#[test]
fn test_wrong_table_length_is_rejected() {
    let vec = filled(50);
    let mut image = vec.serialize();
    image[8..12].copy_from_slice(&4u32.to_le_bytes());

    let err = HeapVec::load(image, StringCodec, false).err().unwrap();
    assert!(matches!(err, HeapError::InvalidImage(_)), "unexpected error: {}", err);
}

#[test]
fn test_bad_table_offset_is_rejected() {
    let vec = filled(50);

    for table in [0u32, 8, 20, 1 << 30] {
        let mut image = vec.serialize();
        image[4..8].copy_from_slice(&table.to_le_bytes());

        let err = HeapVec::load(image, StringCodec, false).err().unwrap();
        assert!(
            matches!(err, HeapError::InvalidImage(_)),
            "table {}: unexpected error: {}",
            table,
            err
        );
    }
}
