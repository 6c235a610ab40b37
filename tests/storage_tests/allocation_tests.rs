//! Allocation, free and growth behaviour of Storage

use std::collections::HashMap;

use heapmap::malloc::HEAP_BASE;
use heapmap::{HeapError, Offset, ReleaseOption, Storage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

// =============================================================================
// Helper Functions
// =============================================================================

/// Top chunk size of a heap with nothing allocated
fn empty_top(reserved: usize) -> i64 {
    reserved as i64 - (HEAP_BASE as i64 + 24)
}

fn assert_empty(storage: &Storage) {
    let stats = storage.stats();
    assert_eq!(stats.occupied, 0);
    assert_eq!(stats.designated_victim_size, 0);
    assert_eq!(stats.top_size, empty_top(stats.reserved));
}

fn fill_pattern(storage: &mut Storage, offset: Offset, len: usize, seed: u8) {
    let bytes: Vec<u8> = (0..len).map(|i| seed.wrapping_add(i as u8)).collect();
    storage.write(offset, 0, &bytes).unwrap();
}

fn check_pattern(storage: &Storage, offset: Offset, len: usize, seed: u8) {
    let bytes = storage.slice(offset, 0, Some(len)).unwrap();
    for (i, b) in bytes.iter().enumerate() {
        assert_eq!(*b, seed.wrapping_add(i as u8), "chunk {} byte {}", offset, i);
    }
}

// =============================================================================
// Typed Access Tests
// =============================================================================

#[test]
fn test_typed_access() {
    let mut storage = Storage::new(0).unwrap();
    let p = storage.allocate(32).unwrap();

    storage.put_byte(p, 4);
    assert_eq!(storage.get_byte(p), 4);

    storage.put_short(p + 1, 2910);
    assert_eq!(storage.get_byte(p), 4);
    assert_eq!(storage.get_short(p + 1), 2910);

    storage.put_long(p + 3, 12345678987654321);
    storage.put_long(p + 11, -999999999999);
    assert_eq!(storage.get_byte(p), 4);
    assert_eq!(storage.get_short(p + 1), 2910);
    assert_eq!(storage.get_long(p + 3), 12345678987654321);
    assert_eq!(storage.get_long(p + 11), -999999999999);

    storage.put_int(p + 19, -7);
    storage.put_ushort(p + 23, 65535);
    storage.put_uint(p + 25, u32::MAX);
    assert_eq!(storage.get_int(p + 19), -7);
    assert_eq!(storage.get_ushort(p + 23), 65535);
    assert_eq!(storage.get_uint(p + 25), u32::MAX);
}

#[test]
fn test_slice_bounds() {
    let mut storage = Storage::new(0).unwrap();
    let p = storage.allocate(32).unwrap();
    let usable = storage.size_of(p);

    assert!(usable >= 32);
    assert_eq!(storage.slice(p, 0, None).unwrap().len(), usable);
    assert_eq!(storage.slice(p, 8, None).unwrap().len(), usable - 8);
    assert_eq!(storage.slice(p, usable, None).unwrap().len(), 0);

    assert!(matches!(
        storage.slice(p, 0, Some(1000)),
        Err(HeapError::OutOfBounds { .. })
    ));
    assert!(matches!(
        storage.slice(p, usable + 1, None),
        Err(HeapError::OutOfBounds { .. })
    ));
    assert!(matches!(
        storage.write(p, 0, &[0u8; 64]),
        Err(HeapError::OutOfBounds { .. })
    ));
    assert!(matches!(
        storage.write(p, usable, &[1]),
        Err(HeapError::OutOfBounds { .. })
    ));
}

#[test]
fn test_malloc_returns_writable_chunk() {
    let mut storage = Storage::new(0).unwrap();
    let mem = storage.malloc(20).unwrap();
    let offset = mem.offset;
    assert!(mem.chunk.len() >= 20);
    mem.chunk[..5].copy_from_slice(b"hello");

    assert_eq!(storage.slice(offset, 0, Some(5)).unwrap(), b"hello");
}

// =============================================================================
// Allocation Tests
// =============================================================================

#[test]
fn test_allocation_too_large() {
    let mut storage = Storage::new(0).unwrap();
    let before = storage.reserved();

    let result = storage.allocate(2 * 1024 * 1024 * 1024);
    assert!(matches!(result, Err(HeapError::AllocationTooLarge { .. })));
    assert_eq!(storage.reserved(), before);
}

#[test]
fn test_payloads_are_aligned() {
    let mut storage = Storage::new(0).unwrap();
    for size in [0usize, 1, 7, 8, 9, 100, 255, 256, 257, 1000, 5000] {
        let p = storage.allocate(size).unwrap();
        assert_eq!(p % 8, 0, "payload for {} bytes at {}", size, p);
        assert!(p > HEAP_BASE);
        assert!(storage.size_of(p) >= size);
    }
}

#[test]
fn test_allocate_store_and_free_all() {
    let mut storage = Storage::new(0).unwrap();
    let mut offsets = Vec::new();

    for i in 0..1000 {
        let text = format!("{{\"age\":{},\"name\":\"John Armless#{}\"}}", i, i);
        let mut payload = (text.len() as u32).to_le_bytes().to_vec();
        payload.extend_from_slice(text.as_bytes());

        let offset = storage.allocate(payload.len()).unwrap();
        assert!(storage.size_of(offset) >= payload.len());
        storage.write(offset, 0, &payload).unwrap();
        offsets.push(offset);
    }

    for (i, offset) in offsets.iter().enumerate() {
        let len = storage.get_uint(*offset) as usize;
        let text = storage.slice(*offset, 4, Some(len)).unwrap();
        let expected = format!("{{\"age\":{},\"name\":\"John Armless#{}\"}}", i, i);
        assert_eq!(text, expected.as_bytes());
    }

    for offset in offsets {
        assert!(storage.free(offset));
    }
    assert_empty(&storage);
}

#[test]
fn test_free_nil_returns_false() {
    let mut storage = Storage::new(0).unwrap();
    assert!(!storage.free(heapmap::NIL));
}

#[test]
fn test_freed_small_chunk_is_reused() {
    let mut storage = Storage::new(0).unwrap();
    let a = storage.allocate(24).unwrap();
    let _guard = storage.allocate(24).unwrap();

    storage.free(a);
    let again = storage.allocate(24).unwrap();

    assert_eq!(again, a);
}

#[test]
fn test_freed_large_chunk_is_best_fit() {
    let mut storage = Storage::new(1 << 16).unwrap();
    let mut large = Vec::new();
    for size in [300usize, 600, 1000] {
        large.push(storage.allocate(size).unwrap());
        storage.allocate(16).unwrap();
    }
    for p in &large {
        storage.free(*p);
    }

    assert_eq!(storage.allocate(600).unwrap(), large[1]);
    assert_eq!(storage.allocate(1000).unwrap(), large[2]);
    assert_eq!(storage.allocate(300).unwrap(), large[0]);
}

#[test]
fn test_free_coalesces_neighbours() {
    let mut storage = Storage::new(1 << 12).unwrap();
    let a = storage.allocate(100).unwrap();
    let b = storage.allocate(100).unwrap();
    let c = storage.allocate(100).unwrap();
    let _guard = storage.allocate(8).unwrap();

    storage.free(a);
    storage.free(c);
    storage.free(b);

    // a, b and c now form one free chunk large enough for all three
    let merged = storage.allocate(300).unwrap();
    assert_eq!(merged, a);
}

#[test]
#[should_panic(expected = "heap corruption")]
fn test_double_free_is_fatal() {
    let mut storage = Storage::new(0).unwrap();
    let a = storage.allocate(64).unwrap();
    let _guard = storage.allocate(64).unwrap();

    storage.free(a);
    storage.free(a);
}

// =============================================================================
// Growth Tests
// =============================================================================

#[test]
fn test_growth_in_increments() {
    let mut storage = Storage::with_growth(0, 4096).unwrap();
    let before = storage.reserved();

    let p = storage.allocate(10_000).unwrap();
    let after = storage.reserved();

    assert!(after > before);
    assert_eq!((after - before) % 4096, 0);
    assert!(p as usize + storage.size_of(p) <= after);

    fill_pattern(&mut storage, p, 10_000, 3);
    check_pattern(&storage, p, 10_000, 3);
}

#[test]
fn test_offsets_survive_growth() {
    let mut storage = Storage::with_growth(0, 1024).unwrap();
    let mut live = Vec::new();

    for i in 0..200u8 {
        let p = storage.allocate(100).unwrap();
        fill_pattern(&mut storage, p, 100, i);
        live.push((p, i));
    }

    for (p, seed) in live {
        check_pattern(&storage, p, 100, seed);
    }
}

// =============================================================================
// Release Tests
// =============================================================================

#[test]
fn test_release_logical_keeps_buffer() {
    let mut storage = Storage::new(1 << 12).unwrap();
    for _ in 0..10 {
        storage.allocate(50).unwrap();
    }
    let reserved = storage.reserved();

    storage.release(ReleaseOption::Logical);

    assert_eq!(storage.reserved(), reserved);
    assert_empty(&storage);
    assert_eq!(storage.allocate(50).unwrap(), HEAP_BASE + 8);
}

#[test]
fn test_release_physical_drops_buffer() {
    let mut storage = Storage::new(1 << 12).unwrap();
    storage.allocate(50).unwrap();

    storage.release(ReleaseOption::Physical);
    assert_eq!(storage.reserved(), 0);

    let p = storage.allocate(50).unwrap();
    assert_eq!(p, HEAP_BASE + 8);
    assert!(storage.reserved() > 0);
}

// =============================================================================
// Randomized Tests
// =============================================================================

#[test]
fn test_random_interleaving_keeps_contents_and_leaks_nothing() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut storage = Storage::with_growth(0, 1 << 14).unwrap();
    let mut live: HashMap<Offset, (usize, u8)> = HashMap::new();

    for round in 0..5000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let len = rng.gen_range(1..2000);
            let p = storage.allocate(len).unwrap();
            assert!(!live.contains_key(&p), "offset {} handed out twice", p);
            let seed = round as u8;
            fill_pattern(&mut storage, p, len, seed);
            live.insert(p, (len, seed));
        } else {
            let keys: Vec<Offset> = live.keys().copied().collect();
            let p = *keys.choose(&mut rng).unwrap();
            let (len, seed) = live.remove(&p).unwrap();
            check_pattern(&storage, p, len, seed);
            assert!(storage.free(p));
        }
    }

    for (p, (len, seed)) in &live {
        check_pattern(&storage, *p, *len, *seed);
    }

    let mut rest: Vec<Offset> = live.keys().copied().collect();
    rest.shuffle(&mut rng);
    for p in rest {
        storage.free(p);
    }
    assert_empty(&storage);
}
