//! HeapMap operations

use std::cell::Cell;
use std::collections::HashSet;
use std::rc::Rc;

use bytes::BytesMut;
use heapmap::{
    BincodeCodec, Codec, Config, HeapError, HeapMap, I32Codec, KeyOrder, ObjectKeys, Source,
    StringCodec,
};
use serde::{Deserialize, Serialize};

use crate::{filled_map, key, string_map, value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Profile {
    age: u8,
    name: String,
    tags: Vec<String>,
}

/// String codec that counts how many values were decoded
#[derive(Clone, Default)]
struct CountingCodec {
    decodes: Rc<Cell<usize>>,
}

impl Codec for CountingCodec {
    type Item = String;

    fn encode(&self, item: &String, sink: &mut BytesMut) -> heapmap::Result<()> {
        StringCodec.encode(item, sink)
    }

    fn decode(&self, source: &mut Source<'_>) -> heapmap::Result<String> {
        self.decodes.set(self.decodes.get() + 1);
        StringCodec.decode(source)
    }
}

// =============================================================================
// Basic Operations Tests
// =============================================================================

#[test]
fn test_new_map_is_empty() {
    let map = string_map(4, 31);
    assert!(map.is_empty());
    assert_eq!(map.len(), 0);
    assert_eq!(map.segments().len(), 4);
    assert_eq!(map.table_size(), 31);
}

#[test]
fn test_put_get_across_segments() {
    let mut map = filled_map(3000, 8);

    assert_eq!(map.len(), 3000);
    assert!(map.segments().iter().all(|s| !s.is_empty()));
    for i in (0..3000).step_by(7) {
        assert_eq!(map.get(&key(i)).unwrap(), Some(value(i)));
    }
    assert_eq!(map.get(&"missing".to_string()).unwrap(), None);
    assert_eq!(map.verify().unwrap(), 3000);
}

#[test]
fn test_put_and_put_if_absent() {
    let mut map = string_map(2, 17);
    let k = "k".to_string();

    assert_eq!(map.put(&k, &"foo".to_string()).unwrap(), None);
    assert_eq!(map.put(&k, &"bar".to_string()).unwrap(), Some("foo".to_string()));
    assert_eq!(
        map.put_if_absent(&k, &"baz".to_string()).unwrap(),
        Some("bar".to_string())
    );
    assert_eq!(map.get(&k).unwrap(), Some("bar".to_string()));
}

#[test]
fn test_put_with_and_compute_if_absent() {
    let mut map = string_map(3, 17);
    let k = "lazy".to_string();

    map.put_with(&k, false, true, |k| format!("{}-1", k)).unwrap();
    map.put_with(&k, false, true, |_| panic!("already present")).unwrap();
    assert_eq!(map.get(&k).unwrap(), Some("lazy-1".to_string()));

    let v = map.compute_if_absent(&k, |_| "unused".to_string()).unwrap();
    assert_eq!(v, "lazy-1");
    let v = map.compute_if_absent(&"other".to_string(), |k| k.to_uppercase()).unwrap();
    assert_eq!(v, "OTHER");
    assert_eq!(map.len(), 2);
}

#[test]
fn test_remove_and_delete() {
    let mut map = filled_map(100, 4);

    assert_eq!(map.remove(&key(5)).unwrap(), Some(value(5)));
    assert_eq!(map.remove(&key(5)).unwrap(), None);
    assert!(map.delete(&key(6)).unwrap());
    assert!(!map.delete(&key(6)).unwrap());
    assert!(!map.contains_key(&key(6)).unwrap());
    assert!(map.contains_key(&key(7)).unwrap());
    assert_eq!(map.len(), 98);
}

#[test]
fn test_clear_all_segments() {
    let mut map = filled_map(500, 4);

    assert_eq!(map.clear(), 500);
    assert!(map.is_empty());
    assert!(map.stats().iter().all(|s| s.occupied == 0));

    map.put(&key(1), &value(1)).unwrap();
    assert_eq!(map.len(), 1);
}

#[test]
fn test_iteration_covers_every_entry_once() {
    let map = filled_map(1000, 5);

    let keys: Vec<String> = map.keys().map(Result::unwrap).collect();
    let unique: HashSet<&String> = keys.iter().collect();
    assert_eq!(keys.len(), 1000);
    assert_eq!(unique.len(), 1000);

    for entry in map.entries() {
        let (k, v) = entry.unwrap();
        let i: usize = k["user:".len()..].parse().unwrap();
        assert_eq!(v, value(i));
    }
    assert_eq!(map.values().count(), 1000);
}

#[test]
fn test_int32_map() {
    let config = Config::builder().segments(3).table_size(101).build().unwrap();
    let mut map = HeapMap::int32(StringCodec, &config).unwrap();

    for k in -500..500 {
        map.put(&k, &k.to_string()).unwrap();
    }
    assert_eq!(map.get(&-123).unwrap(), Some("-123".to_string()));
    assert_eq!(map.verify().unwrap(), 1000);
}

// =============================================================================
// Timestamp Tests
// =============================================================================

#[test]
fn test_get_touch_refreshes_timestamp() {
    let config = Config::builder().timestamps(true).table_size(11).build().unwrap();
    let mut map = HeapMap::new(StringCodec, I32Codec, &config).unwrap();
    let k = "t".to_string();

    map.put(&k, &1).unwrap();
    let first = map.last_touched(&k).unwrap().unwrap();
    assert_eq!(map.get_touch(&k).unwrap(), Some(1));
    assert!(map.last_touched(&k).unwrap().unwrap() >= first);
    assert_eq!(map.last_touched(&"absent".to_string()).unwrap(), None);
    assert!(map.options().timestamps());
}

// =============================================================================
// Key Format Tests
// =============================================================================

#[test]
fn test_sorted_map_iterates_in_order() {
    let mut map =
        HeapMap::with_format(ObjectKeys::sorted(StringCodec), I32Codec, &Config::sorted()).unwrap();
    for (i, word) in ["delta", "alpha", "echo", "charlie", "bravo"].iter().enumerate() {
        map.put(&word.to_string(), &(i as i32)).unwrap();
    }

    let keys: Vec<String> = map.keys().map(Result::unwrap).collect();
    assert_eq!(keys, ["alpha", "bravo", "charlie", "delta", "echo"]);
    assert_eq!(map.options().key_order(), KeyOrder::Natural);
}

#[test]
fn test_natural_order_needs_sorted_key_format() {
    let result = HeapMap::new(StringCodec, I32Codec, &Config::sorted());
    assert!(matches!(result, Err(HeapError::Config(_))));
}

#[test]
fn test_oversized_key_is_rejected() {
    let mut map = string_map(1, 7);
    let huge = "k".repeat(70_000);

    let err = map.put(&huge, &"v".to_string()).unwrap_err();
    assert!(matches!(err, HeapError::InvalidKey(_)), "unexpected error: {}", err);
    assert!(map.is_empty());
}

#[test]
fn test_serde_values() {
    let config = Config::builder().segments(2).table_size(31).build().unwrap();
    let mut map = HeapMap::new(StringCodec, BincodeCodec::<Profile>::new(), &config).unwrap();

    for i in 0..200u8 {
        let profile = Profile {
            age: i,
            name: format!("John Armless#{}", i),
            tags: (0..i % 4).map(|t| format!("tag{}", t)).collect(),
        };
        map.put(&format!("p{}", i), &profile).unwrap();
    }

    let p = map.get(&"p123".to_string()).unwrap().unwrap();
    assert_eq!(p.age, 123);
    assert_eq!(p.name, "John Armless#123");
    assert_eq!(p.tags, vec!["tag0".to_string(), "tag1".to_string(), "tag2".to_string()]);
}

#[test]
fn test_insert_and_delete_skip_value_decoding() {
    let codec = CountingCodec::default();
    let decodes = Rc::clone(&codec.decodes);
    let config = Config::builder().segments(2).table_size(31).build().unwrap();
    let mut map = HeapMap::new(StringCodec, codec, &config).unwrap();
    let k = "session".to_string();

    assert_eq!(map.put(&k, &"first".to_string()).unwrap(), None);
    assert_eq!(decodes.get(), 0);
    assert_eq!(map.put(&k, &"second".to_string()).unwrap(), Some("first".to_string()));
    assert_eq!(decodes.get(), 1);

    map.insert(&k, &"third".to_string()).unwrap();
    map.insert(&"other".to_string(), &"x".to_string()).unwrap();
    assert!(map.delete(&k).unwrap());
    assert_eq!(decodes.get(), 1);
    assert_eq!(map.len(), 1);

    map.insert(&k, &"fourth".to_string()).unwrap();
    assert_eq!(map.get(&k).unwrap(), Some("fourth".to_string()));
    assert_eq!(decodes.get(), 2);
}
