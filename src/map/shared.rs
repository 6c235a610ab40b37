//! Shared Map
//!
//! A `HeapMap` whose segments sit behind their own locks, so threads that
//! touch different shards never wait on each other.
//!
//! ## Concurrency
//! - One `parking_lot::Mutex` per segment; an operation locks exactly the
//!   segment its key routes to
//! - Aggregates (`len`, `verify`, `serialize`) lock segments one at a time,
//!   so they observe each segment consistently but not the whole map at a
//!   single instant

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;

use crate::codec::Codec;
use crate::config::Config;
use crate::error::Result;

use super::facade::HeapMap;
use super::format::KeyFormat;
use super::segment::Segment;
use super::{slot_of, Options};

/// Thread-safe map with one lock per segment
pub struct SharedMap<F: KeyFormat, VC: Codec> {
    keys: F,
    shards: Vec<Mutex<Segment<F, VC>>>,
    table_size: usize,
    options: Options,
}

impl<F: KeyFormat, VC: Codec + Clone> SharedMap<F, VC> {
    pub fn with_format(keys: F, values: VC, config: &Config) -> Result<Self> {
        Ok(Self::from_map(HeapMap::with_format(keys, values, config)?))
    }

    /// Wrap an existing map (for example one just loaded from an image)
    pub fn from_map(map: HeapMap<F, VC>) -> Self {
        let (keys, segments, table_size, options) = map.into_parts();
        Self {
            keys,
            shards: segments.into_iter().map(Mutex::new).collect(),
            table_size,
            options,
        }
    }

    /// Unwrap into a single-owner map
    pub fn into_map(self) -> HeapMap<F, VC> {
        let segments = self.shards.into_iter().map(|s| s.into_inner()).collect();
        HeapMap::from_parts(self.keys, segments, self.table_size, self.options)
    }

    fn shard(&self, key: &F::Key) -> Result<(&Mutex<Segment<F, VC>>, i32)> {
        let hash = self.keys.hash(key)?;
        Ok((&self.shards[slot_of(hash, self.shards.len())], hash))
    }

    pub fn put(&self, key: &F::Key, value: &VC::Item) -> Result<Option<VC::Item>> {
        let (shard, hash) = self.shard(key)?;
        shard.lock().put(hash, key, value, true, false)
    }

    pub fn put_if_absent(&self, key: &F::Key, value: &VC::Item) -> Result<Option<VC::Item>> {
        let (shard, hash) = self.shard(key)?;
        shard.lock().put(hash, key, value, true, true)
    }

    /// Runs `f` under the shard lock; `f` must not touch this map
    pub fn compute_if_absent(
        &self,
        key: &F::Key,
        f: impl FnOnce(&F::Key) -> VC::Item,
    ) -> Result<VC::Item> {
        let (shard, hash) = self.shard(key)?;
        shard.lock().compute_if_absent(hash, key, f)
    }

    pub fn get(&self, key: &F::Key) -> Result<Option<VC::Item>> {
        let (shard, hash) = self.shard(key)?;
        shard.lock().get(hash, key, false)
    }

    pub fn contains_key(&self, key: &F::Key) -> Result<bool> {
        let (shard, hash) = self.shard(key)?;
        shard.lock().contains_key(hash, key)
    }

    pub fn remove(&self, key: &F::Key) -> Result<Option<VC::Item>> {
        let (shard, hash) = self.shard(key)?;
        shard.lock().remove(hash, key, true)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.lock().is_empty())
    }

    pub fn clear(&self) -> usize {
        self.shards.iter().map(|s| s.lock().clear()).sum()
    }

    pub fn verify(&self) -> Result<usize> {
        self.shards.iter().map(|s| s.lock().verify()).sum()
    }

    /// Map image, identical in format to [`HeapMap::serialize`]
    pub fn serialize(&self) -> BytesMut {
        let mut out = BytesMut::new();
        out.put_u32_le(self.shards.len() as u32);
        out.put_u32_le(self.table_size as u32);
        out.put_u32_le(self.options.bits());
        for shard in &self.shards {
            shard.lock().store_on(&mut out);
        }
        out
    }
}
