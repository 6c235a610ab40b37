//! Map Facade
//!
//! Routes keys across segments and aggregates what the segments report.
//!
//! ## Image Format
//! ```text
//! ┌──────────────┬────────────────┬────────────┬───────────┬───────────┬─────
//! │ segments (4) │ table size (4) │ flags (4)  │ segment 0 │ segment 1 │ ...
//! └──────────────┴────────────────┴────────────┴───────────┴───────────┴─────
//! ```

use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::Codec;
use crate::config::Config;
use crate::error::{check_underflow, HeapError, Result};
use crate::malloc::{DlAllocator, HeapStats, METADATA_LEN};

use super::format::{Int32Keys, KeyFormat, ObjectKeys};
use super::segment::{read_header, Segment, SEGMENT_HEADER_LEN};
use super::{slot_of, Options};

const MAP_HEADER_LEN: usize = 12;

/// Length of the id stamp in front of a storage image
const STORAGE_ID_LEN: usize = 8;

/// A sharded hash map (or sorted tree map) held in offset-addressed heaps
pub struct HeapMap<F: KeyFormat, VC: Codec> {
    keys: F,
    segments: Vec<Segment<F, VC>>,
    table_size: usize,
    options: Options,
}

impl<KC: Codec + Clone, VC: Codec + Clone> HeapMap<ObjectKeys<KC>, VC> {
    /// Map over codec-encoded keys
    ///
    /// For `KeyOrder::Natural` build the key format with
    /// [`ObjectKeys::sorted`] and use [`HeapMap::with_format`].
    pub fn new(key_codec: KC, value_codec: VC, config: &Config) -> Result<Self> {
        Self::with_format(ObjectKeys::new(key_codec), value_codec, config)
    }
}

impl<VC: Codec + Clone> HeapMap<Int32Keys, VC> {
    /// Map over `i32` keys with the compact node layout
    pub fn int32(value_codec: VC, config: &Config) -> Result<Self> {
        Self::with_format(Int32Keys, value_codec, config)
    }
}

impl<F: KeyFormat, VC: Codec + Clone> HeapMap<F, VC> {
    pub fn with_format(keys: F, values: VC, config: &Config) -> Result<Self> {
        config.validate()?;
        let segments = (0..config.segments)
            .map(|_| Segment::new(keys.clone(), values.clone(), config))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            keys,
            segments,
            table_size: config.table_size,
            options: Options::from_config(config),
        })
    }

    pub(crate) fn into_parts(self) -> (F, Vec<Segment<F, VC>>, usize, Options) {
        (self.keys, self.segments, self.table_size, self.options)
    }

    pub(crate) fn from_parts(
        keys: F,
        segments: Vec<Segment<F, VC>>,
        table_size: usize,
        options: Options,
    ) -> Self {
        Self {
            keys,
            segments,
            table_size,
            options,
        }
    }

    fn route(&self, key: &F::Key) -> Result<(usize, i32)> {
        let hash = self.keys.hash(key)?;
        Ok((slot_of(hash, self.segments.len()), hash))
    }

    // =========================================================================
    // Map Operations
    // =========================================================================

    /// Insert or overwrite; returns the previous value
    ///
    /// The old value is decoded on every overwrite. Use [`HeapMap::insert`]
    /// when it is not needed.
    pub fn put(&mut self, key: &F::Key, value: &VC::Item) -> Result<Option<VC::Item>> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].put(hash, key, value, true, false)
    }

    /// Insert or overwrite without reading the previous value
    pub fn insert(&mut self, key: &F::Key, value: &VC::Item) -> Result<()> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].put(hash, key, value, false, false)?;
        Ok(())
    }

    /// Insert only when absent; returns the existing value otherwise
    pub fn put_if_absent(&mut self, key: &F::Key, value: &VC::Item) -> Result<Option<VC::Item>> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].put(hash, key, value, true, true)
    }

    /// Insert or overwrite with a lazily produced value
    pub fn put_with(
        &mut self,
        key: &F::Key,
        return_old: bool,
        only_if_absent: bool,
        f: impl FnOnce(&F::Key) -> VC::Item,
    ) -> Result<Option<VC::Item>> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].put_with(hash, key, return_old, only_if_absent, f)
    }

    pub fn compute_if_absent(
        &mut self,
        key: &F::Key,
        f: impl FnOnce(&F::Key) -> VC::Item,
    ) -> Result<VC::Item> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].compute_if_absent(hash, key, f)
    }

    pub fn get(&mut self, key: &F::Key) -> Result<Option<VC::Item>> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].get(hash, key, false)
    }

    /// `get` that also refreshes the entry's timestamp
    pub fn get_touch(&mut self, key: &F::Key) -> Result<Option<VC::Item>> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].get(hash, key, true)
    }

    pub fn last_touched(&mut self, key: &F::Key) -> Result<Option<u32>> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].last_touched(hash, key)
    }

    pub fn contains_key(&mut self, key: &F::Key) -> Result<bool> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].contains_key(hash, key)
    }

    /// Remove `key`, returning its value; [`HeapMap::delete`] skips the decode
    pub fn remove(&mut self, key: &F::Key) -> Result<Option<VC::Item>> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].remove(hash, key, true)
    }

    /// Remove `key` without decoding its value
    pub fn delete(&mut self, key: &F::Key) -> Result<bool> {
        let (seg, hash) = self.route(key)?;
        self.segments[seg].delete(hash, key)
    }

    /// Empty every segment; returns how many entries were dropped
    pub fn clear(&mut self) -> usize {
        self.segments.iter_mut().map(Segment::clear).sum()
    }

    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(Segment::is_empty)
    }

    pub fn segments(&self) -> &[Segment<F, VC>] {
        &self.segments
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }

    /// Set every segment's storage growth increment (rounded up to 8)
    ///
    /// Images do not record the increment, so call this after `load` to
    /// keep a custom one.
    pub fn set_growth_increment(&mut self, bytes: usize) {
        for segment in &mut self.segments {
            segment.set_growth_increment(bytes);
        }
    }

    /// Heap accounting per segment
    pub fn stats(&self) -> Vec<HeapStats> {
        self.segments.iter().map(Segment::stats).collect()
    }

    // =========================================================================
    // Iteration (segment order, then bucket order)
    // =========================================================================

    pub fn keys(&self) -> impl Iterator<Item = Result<F::Key>> + '_ {
        self.segments.iter().flat_map(Segment::keys)
    }

    pub fn values(&self) -> impl Iterator<Item = Result<VC::Item>> + '_ {
        self.segments.iter().flat_map(Segment::values)
    }

    pub fn entries(&self) -> impl Iterator<Item = Result<(F::Key, VC::Item)>> + '_ {
        self.segments.iter().flat_map(Segment::entries)
    }

    /// Check every segment's trees; returns the total entry count
    pub fn verify(&self) -> Result<usize> {
        self.segments.iter().map(Segment::verify).sum()
    }

    // =========================================================================
    // Image
    // =========================================================================

    pub fn image_size(&self) -> usize {
        MAP_HEADER_LEN + self.segments.iter().map(Segment::image_size).sum::<usize>()
    }

    pub fn store_on(&self, dst: &mut BytesMut) {
        dst.reserve(self.image_size());
        dst.put_u32_le(self.segments.len() as u32);
        dst.put_u32_le(self.table_size as u32);
        dst.put_u32_le(self.options.bits());
        for segment in &self.segments {
            segment.store_on(dst);
        }
    }

    pub fn serialize(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.image_size());
        self.store_on(&mut out);
        out
    }

    /// Write the image to `path`, creating parent directories
    pub fn save_on(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let image = self.serialize();
        fs::write(path, &image[..])?;
        tracing::debug!("Saved {} entries ({} bytes) to {}", self.len(), image.len(), path.display());
        Ok(())
    }

    /// Rebuild a map from its image
    ///
    /// The key format and value codec must match the ones the image was
    /// written with; the image itself does not record them. Segments grow
    /// by the default increment until [`HeapMap::set_growth_increment`].
    pub fn load(image: BytesMut, keys: F, values: VC, copy: bool) -> Result<Self> {
        let total = image.len();
        if total < MAP_HEADER_LEN {
            return Err(HeapError::BufferUnderflow {
                expected: MAP_HEADER_LEN as u64,
                got: total as u64,
            });
        }

        let mut image = image;
        let count = image.get_u32_le() as usize;
        let table_size = image.get_u32_le() as usize;
        let options = Options::from_bits(image.get_u32_le())?;
        if count == 0 || table_size == 0 {
            return Err(HeapError::InvalidImage(format!(
                "{} segments of {} buckets",
                count, table_size
            )));
        }

        let mut segments = Vec::with_capacity(count);
        for index in 0..count {
            let part = Segment::<F, VC>::split_image(&mut image)?;
            let segment = Segment::load(part, keys.clone(), values.clone(), options, copy)?;
            if segment.table_size() != table_size {
                return Err(HeapError::InvalidImage(format!(
                    "segment {} has {} buckets, the map header says {}",
                    index,
                    segment.table_size(),
                    table_size
                )));
            }
            segments.push(segment);
        }
        check_underflow(total - image.len(), total)?;

        tracing::debug!("Loaded map: {} segments, {} bytes", count, total);
        Ok(Self {
            keys,
            segments,
            table_size,
            options,
        })
    }

    pub fn load_from(path: &Path, keys: F, values: VC) -> Result<Self> {
        let data = fs::read(path)?;
        Self::load(BytesMut::from(&data[..]), keys, values, false)
    }
}

// =============================================================================
// Image Summary
// =============================================================================

/// Header-level view of a map image, read without any codec
#[derive(Debug, Clone)]
pub struct ImageSummary {
    pub table_size: usize,
    pub options: Options,
    pub segments: Vec<SegmentSummary>,
}

/// One segment as recorded in an image
#[derive(Debug, Clone)]
pub struct SegmentSummary {
    pub entries: usize,
    pub storage_id: i64,
    pub image_len: usize,
    pub heap: HeapStats,
}

impl ImageSummary {
    /// Parse and validate the headers of a whole map image
    pub fn read(image: &[u8]) -> Result<Self> {
        if image.len() < MAP_HEADER_LEN {
            return Err(HeapError::BufferUnderflow {
                expected: MAP_HEADER_LEN as u64,
                got: image.len() as u64,
            });
        }
        let mut header = &image[..MAP_HEADER_LEN];
        let count = header.get_u32_le() as usize;
        let table_size = header.get_u32_le() as usize;
        let options = Options::from_bits(header.get_u32_le())?;

        let mut rest = &image[MAP_HEADER_LEN..];
        let mut segments = Vec::with_capacity(count);
        for _ in 0..count {
            let (entries, table_len, storage_len) = read_header(rest)?;
            let image_len = SEGMENT_HEADER_LEN + table_len + storage_len;
            if rest.len() < image_len {
                return Err(HeapError::BufferUnderflow {
                    expected: image_len as u64,
                    got: rest.len() as u64,
                });
            }

            let storage = &rest[SEGMENT_HEADER_LEN + table_len..image_len];
            let meta_end = STORAGE_ID_LEN + METADATA_LEN;
            if storage.len() < meta_end {
                return Err(HeapError::BufferUnderflow {
                    expected: meta_end as u64,
                    got: storage.len() as u64,
                });
            }
            let mut id = &storage[..STORAGE_ID_LEN];
            let heap_len = storage.len() - meta_end;
            let dl = DlAllocator::load(&storage[STORAGE_ID_LEN..meta_end], heap_len)?;

            segments.push(SegmentSummary {
                entries,
                storage_id: id.get_i64_le(),
                image_len,
                heap: dl.stats(heap_len),
            });
            rest = &rest[image_len..];
        }
        check_underflow(image.len() - rest.len(), image.len())?;

        Ok(Self {
            table_size,
            options,
            segments,
        })
    }

    pub fn entries(&self) -> usize {
        self.segments.iter().map(|s| s.entries).sum()
    }
}
