//! Segment
//!
//! One shard of a map: a fixed table of red-black tree roots plus the
//! private heap every entry lives in.
//!
//! ## Image Format
//! ```text
//! ┌──────────┬──────────────┬──────────────┬─────────────────┬───────────────┐
//! │ size (4) │ table len (4)│ storage len 4│ roots (4 each)  │ storage image │
//! └──────────┴──────────────┴──────────────┴─────────────────┴───────────────┘
//! ```
//! All integers little-endian.

use std::cmp::Ordering;
use std::fs;
use std::mem;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::Codec;
use crate::config::Config;
use crate::error::{check_underflow, HeapError, Result};
use crate::malloc::{HeapStats, Offset, ReleaseOption, Storage, NIL};

use super::format::{KeyFormat, Probe, BLACK, RED};
use super::iter::{Cursor, Entries, Keys, Values};
use super::tree::{first_under, root_of, successor, Tree};
use super::{slot_of, Options};

/// Fixed header in front of the table in a segment image
pub(crate) const SEGMENT_HEADER_LEN: usize = 12;

fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// Where a descent stopped
struct Found {
    /// Matching node, or `NIL`
    node: Offset,

    /// Last node visited before falling off the tree
    parent: Offset,

    /// Whether the missing key belongs on `parent`'s left
    went_left: bool,
}

/// A hash table of red-black trees stored in a private heap
///
/// Every operation takes the caller's hash for the key. Use
/// [`Segment::hash`] (or the same [`KeyFormat`]) so that lookups, inserts
/// and removals agree.
pub struct Segment<F: KeyFormat, VC: Codec> {
    keys: F,
    values: VC,
    options: Options,

    /// Start of the node body for this segment's layout
    body: u32,

    /// Bucket roots, 4 bytes LE each
    table: BytesMut,
    storage: Storage,
    size: usize,

    // Scratch encodings, taken for the length of one operation
    key_buf: BytesMut,
    val_buf: BytesMut,
}

impl<F: KeyFormat, VC: Codec> Segment<F, VC> {
    pub fn new(keys: F, values: VC, config: &Config) -> Result<Self> {
        config.validate()?;
        let options = Options::from_config(config);
        let storage = Storage::with_growth(config.initial_storage, config.growth_increment)?;
        let mut table = BytesMut::new();
        table.resize(config.table_size * 4, 0);
        Self::assemble(keys, values, options, table, storage, 0)
    }

    fn assemble(
        keys: F,
        values: VC,
        options: Options,
        table: BytesMut,
        storage: Storage,
        size: usize,
    ) -> Result<Self> {
        if options.key_order() == crate::config::KeyOrder::Natural && !keys.supports_natural_order() {
            return Err(HeapError::Config(
                "natural key order needs keys built with ObjectKeys::sorted".to_string(),
            ));
        }
        Ok(Self {
            body: F::LAYOUT.body(options.timestamps()),
            keys,
            values,
            options,
            table,
            storage,
            size,
            key_buf: BytesMut::new(),
            val_buf: BytesMut::new(),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Routing hash for `key`
    pub fn hash(&self, key: &F::Key) -> Result<i32> {
        self.keys.hash(key)
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of buckets
    pub fn table_size(&self) -> usize {
        self.table.len() / 4
    }

    pub fn options(&self) -> Options {
        self.options
    }

    pub fn key_format(&self) -> &F {
        &self.keys
    }

    pub fn value_codec(&self) -> &VC {
        &self.values
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn stats(&self) -> HeapStats {
        self.storage.stats()
    }

    /// Set the storage growth increment used from now on (rounded up to 8)
    ///
    /// The increment is not part of the image; a loaded segment grows by
    /// `DEFAULT_GROWTH_INCREMENT` until this is called.
    pub fn set_growth_increment(&mut self, bytes: usize) {
        self.storage.set_growth_increment(bytes)
    }

    fn bucket_of(&self, hash: i32) -> usize {
        slot_of(hash, self.table_size())
    }

    fn tree(&mut self, bucket: usize) -> Tree<'_> {
        Tree {
            storage: &mut self.storage,
            table: &mut self.table[..],
            layout: F::LAYOUT,
            bucket,
        }
    }

    // =========================================================================
    // Scratch Buffers
    // =========================================================================

    fn with_key<T>(
        &mut self,
        key: &F::Key,
        f: impl FnOnce(&mut Self, &[u8]) -> Result<T>,
    ) -> Result<T> {
        let mut buf = mem::take(&mut self.key_buf);
        buf.clear();
        let result = match self.keys.encode(key, &mut buf) {
            Ok(()) => f(self, &buf),
            Err(e) => Err(e),
        };
        self.key_buf = buf;
        result
    }

    fn with_value<T, E>(&mut self, encode: E, f: impl FnOnce(&mut Self, &[u8]) -> Result<T>) -> Result<T>
    where
        E: FnOnce(&VC, &mut BytesMut) -> Result<()>,
    {
        let mut buf = mem::take(&mut self.val_buf);
        buf.clear();
        let result = match encode(&self.values, &mut buf) {
            Ok(()) => f(self, &buf),
            Err(e) => Err(e),
        };
        self.val_buf = buf;
        result
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    fn descend(&self, bucket: usize, probe: &Probe<'_, F::Key>) -> Result<Found> {
        let layout = F::LAYOUT;
        let order = self.options.key_order();
        let mut node = root_of(&self.table, bucket);
        let mut parent = NIL;
        let mut went_left = false;

        while node != NIL {
            match self.keys.compare(order, probe, &self.storage, node, self.body)? {
                Ordering::Less => {
                    parent = node;
                    went_left = true;
                    node = layout.left(&self.storage, node);
                }
                Ordering::Greater => {
                    parent = node;
                    went_left = false;
                    node = layout.right(&self.storage, node);
                }
                Ordering::Equal => {
                    return Ok(Found {
                        node,
                        parent,
                        went_left,
                    })
                }
            }
        }

        Ok(Found {
            node: NIL,
            parent,
            went_left,
        })
    }

    fn find(&mut self, hash: i32, key: &F::Key) -> Result<Offset> {
        self.with_key(key, |seg, encoded| {
            let probe = Probe { key, encoded, hash };
            Ok(seg.descend(seg.bucket_of(hash), &probe)?.node)
        })
    }

    /// Offset of the node holding `key`
    pub fn locate(&mut self, hash: i32, key: &F::Key) -> Result<Option<Offset>> {
        let node = self.find(hash, key)?;
        Ok((node != NIL).then_some(node))
    }

    /// Value stored for `key`; with `touch` the node's timestamp is refreshed
    pub fn get(&mut self, hash: i32, key: &F::Key, touch: bool) -> Result<Option<VC::Item>> {
        let node = self.find(hash, key)?;
        if node == NIL {
            return Ok(None);
        }
        if touch && self.options.timestamps() {
            F::LAYOUT.set_stamp(&mut self.storage, node, now_secs());
        }
        self.value_at(node).map(Some)
    }

    /// Whether `key` is present; the value is not decoded
    pub fn contains_key(&mut self, hash: i32, key: &F::Key) -> Result<bool> {
        Ok(self.find(hash, key)? != NIL)
    }

    /// Seconds-since-epoch stamp of `key`, when timestamps are enabled
    pub fn last_touched(&mut self, hash: i32, key: &F::Key) -> Result<Option<u32>> {
        if !self.options.timestamps() {
            return Ok(None);
        }
        let node = self.find(hash, key)?;
        if node == NIL {
            return Ok(None);
        }
        Ok(Some(F::LAYOUT.stamp(&self.storage, node)))
    }

    // =========================================================================
    // Insert / Update
    // =========================================================================

    /// Store `value` under `key`
    ///
    /// Returns the previous value when `return_old` is set and the key was
    /// present. With `only_if_absent` an existing entry is left untouched.
    pub fn put(
        &mut self,
        hash: i32,
        key: &F::Key,
        value: &VC::Item,
        return_old: bool,
        only_if_absent: bool,
    ) -> Result<Option<VC::Item>> {
        self.upsert(hash, key, return_old, only_if_absent, |codec, sink| {
            codec.encode(value, sink)
        })
    }

    /// Like [`Segment::put`], but the value is produced by `f` only when it
    /// is about to be written
    pub fn put_with(
        &mut self,
        hash: i32,
        key: &F::Key,
        return_old: bool,
        only_if_absent: bool,
        f: impl FnOnce(&F::Key) -> VC::Item,
    ) -> Result<Option<VC::Item>> {
        self.upsert(hash, key, return_old, only_if_absent, |codec, sink| {
            codec.encode(&f(key), sink)
        })
    }

    /// The value under `key`, inserting `f(key)` first if absent
    pub fn compute_if_absent(
        &mut self,
        hash: i32,
        key: &F::Key,
        f: impl FnOnce(&F::Key) -> VC::Item,
    ) -> Result<VC::Item> {
        let mut computed = None;
        let existing = self.upsert(hash, key, true, true, |codec, sink| {
            let value = f(key);
            codec.encode(&value, sink)?;
            computed = Some(value);
            Ok(())
        })?;
        existing
            .or(computed)
            .ok_or_else(|| HeapError::Corrupted("entry neither found nor inserted".to_string()))
    }

    fn upsert<E>(
        &mut self,
        hash: i32,
        key: &F::Key,
        return_old: bool,
        only_if_absent: bool,
        encode: E,
    ) -> Result<Option<VC::Item>>
    where
        E: FnOnce(&VC, &mut BytesMut) -> Result<()>,
    {
        self.with_key(key, |seg, encoded| {
            let bucket = seg.bucket_of(hash);
            let probe = Probe { key, encoded, hash };
            let found = seg.descend(bucket, &probe)?;

            if found.node != NIL {
                let old = if return_old {
                    Some(seg.value_at(found.node)?)
                } else {
                    None
                };
                if !only_if_absent {
                    seg.with_value(encode, |seg, value| seg.write_value(bucket, found.node, value))?;
                }
                return Ok(old);
            }

            seg.with_value(encode, |seg, value| seg.insert(bucket, &probe, &found, value))?;
            seg.size += 1;
            Ok(None)
        })
    }

    fn insert(
        &mut self,
        bucket: usize,
        probe: &Probe<'_, F::Key>,
        found: &Found,
        value: &[u8],
    ) -> Result<Offset> {
        let value_offset = self.body as usize + probe.encoded.len();
        let node = self.storage.allocate(value_offset + value.len())?;
        self.keys.store_key(&mut self.storage, node, probe, self.body)?;
        self.storage.write(node, value_offset, value)?;
        if self.options.timestamps() {
            F::LAYOUT.set_stamp(&mut self.storage, node, now_secs());
        }

        let mut tree = self.tree(bucket);
        if found.parent == NIL {
            tree.attach_root(node);
        } else {
            tree.attach(node, found.parent, found.went_left);
        }
        Ok(node)
    }

    /// Overwrite the value of `node`, relocating it when the chunk is too small
    fn write_value(&mut self, bucket: usize, node: Offset, value: &[u8]) -> Result<Offset> {
        let value_offset = self.keys.value_offset(&self.storage, node, self.body) as usize;
        let capacity = self.storage.size_of(node) - value_offset;

        let target = if value.len() <= capacity {
            self.storage.write(node, value_offset, value)?;
            node
        } else {
            let moved = self.storage.allocate(value_offset + value.len())?;
            self.storage.copy(node, moved, value_offset);
            self.storage.write(moved, value_offset, value)?;
            self.tree(bucket).splice(node, moved);
            self.storage.free(node);
            tracing::trace!("Entry moved from {} to {} for a {} byte value", node, moved, value.len());
            moved
        };

        if self.options.timestamps() {
            F::LAYOUT.set_stamp(&mut self.storage, target, now_secs());
        }
        Ok(target)
    }

    // =========================================================================
    // Removal
    // =========================================================================

    /// Remove `key`; the old value is returned only when `return_old` is set
    pub fn remove(&mut self, hash: i32, key: &F::Key, return_old: bool) -> Result<Option<VC::Item>> {
        Ok(self.remove_entry(hash, key, return_old)?.flatten())
    }

    /// Remove `key`, reporting whether it was present
    pub fn delete(&mut self, hash: i32, key: &F::Key) -> Result<bool> {
        Ok(self.remove_entry(hash, key, false)?.is_some())
    }

    fn remove_entry(
        &mut self,
        hash: i32,
        key: &F::Key,
        return_old: bool,
    ) -> Result<Option<Option<VC::Item>>> {
        self.with_key(key, |seg, encoded| {
            let bucket = seg.bucket_of(hash);
            let probe = Probe { key, encoded, hash };
            let node = seg.descend(bucket, &probe)?.node;
            if node == NIL {
                return Ok(None);
            }

            let old = if return_old {
                Some(seg.value_at(node)?)
            } else {
                None
            };
            seg.tree(bucket).delete(node)?;
            seg.size -= 1;
            Ok(Some(old))
        })
    }

    /// Drop every entry, keeping the heap buffer for reuse; returns the old size
    pub fn clear(&mut self) -> usize {
        let removed = self.size;
        self.table.fill(0);
        self.storage.release(ReleaseOption::Logical);
        self.size = 0;
        removed
    }

    // =========================================================================
    // Iteration
    // =========================================================================

    /// Keys in bucket order, ascending within each bucket
    pub fn keys(&self) -> Keys<'_, F, VC> {
        Keys::new(self)
    }

    pub fn values(&self) -> Values<'_, F, VC> {
        Values::new(self)
    }

    pub fn entries(&self) -> Entries<'_, F, VC> {
        Entries::new(self)
    }

    /// Advance `cursor` to the next node in iteration order
    pub(crate) fn next_node(&self, cursor: &mut Cursor) -> Option<Offset> {
        let layout = F::LAYOUT;
        while cursor.next == NIL {
            if cursor.bucket >= self.table_size() {
                return None;
            }
            cursor.next = first_under(&layout, &self.storage, root_of(&self.table, cursor.bucket));
            cursor.bucket += 1;
        }
        let node = cursor.next;
        cursor.next = successor(&layout, &self.storage, node);
        Some(node)
    }

    pub(crate) fn key_at(&self, node: Offset) -> Result<F::Key> {
        self.keys.decode(&self.storage, node, self.body)
    }

    pub(crate) fn value_at(&self, node: Offset) -> Result<VC::Item> {
        let offset = self.keys.value_offset(&self.storage, node, self.body) as usize;
        self.values.decode_slice(self.storage.slice(node, offset, None)?)
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check every bucket's tree; returns the number of entries
    ///
    /// Verifies black roots, no red node with a red child, equal black
    /// height on every path, parent links, bucket placement and strictly
    /// ascending in-order keys.
    pub fn verify(&self) -> Result<usize> {
        let layout = F::LAYOUT;
        let mut count = 0;

        for bucket in 0..self.table_size() {
            let root = root_of(&self.table, bucket);
            if root == NIL {
                continue;
            }
            if layout.color(&self.storage, root) != BLACK {
                return Err(corrupted(bucket, root, "root is not black"));
            }
            if layout.parent(&self.storage, root) != NIL {
                return Err(corrupted(bucket, root, "root has a parent"));
            }
            count += self.check_subtree(bucket, root)?.1;
            self.check_order(bucket, root)?;
        }

        if count != self.size {
            return Err(HeapError::Corrupted(format!(
                "segment records {} entries but its trees hold {}",
                self.size, count
            )));
        }
        Ok(count)
    }

    /// Black height and node count of the subtree at `node`
    fn check_subtree(&self, bucket: usize, node: Offset) -> Result<(usize, usize)> {
        if node == NIL {
            return Ok((1, 0));
        }
        let layout = F::LAYOUT;
        let storage = &self.storage;

        if self.bucket_of(layout.hash_of(storage, node)) != bucket {
            return Err(corrupted(bucket, node, "hash belongs to another bucket"));
        }
        let color = layout.color(storage, node);
        if color != RED && color != BLACK {
            return Err(corrupted(bucket, node, "invalid color"));
        }

        let left = layout.left(storage, node);
        let right = layout.right(storage, node);
        for child in [left, right] {
            if child == NIL {
                continue;
            }
            if layout.parent(storage, child) != node {
                return Err(corrupted(bucket, child, "parent link does not match"));
            }
            if color == RED && layout.color(storage, child) == RED {
                return Err(corrupted(bucket, child, "red node has a red parent"));
            }
        }

        let (left_height, left_count) = self.check_subtree(bucket, left)?;
        let (right_height, right_count) = self.check_subtree(bucket, right)?;
        if left_height != right_height {
            return Err(corrupted(bucket, node, "unequal black height"));
        }

        let own = if color == BLACK { 1 } else { 0 };
        Ok((left_height + own, left_count + right_count + 1))
    }

    fn check_order(&self, bucket: usize, root: Offset) -> Result<()> {
        let layout = F::LAYOUT;
        let order = self.options.key_order();
        let mut prev = first_under(&layout, &self.storage, root);
        let mut node = successor(&layout, &self.storage, prev);

        while node != NIL {
            let cmp = self
                .keys
                .compare_nodes(order, &self.storage, prev, node, self.body)?;
            if cmp != Ordering::Less {
                return Err(corrupted(bucket, node, "keys out of order"));
            }
            prev = node;
            node = successor(&layout, &self.storage, node);
        }
        Ok(())
    }

    // =========================================================================
    // Image
    // =========================================================================

    pub fn image_size(&self) -> usize {
        SEGMENT_HEADER_LEN + self.table.len() + self.storage.image_size()
    }

    pub fn store_on(&self, dst: &mut BytesMut) {
        dst.reserve(self.image_size());
        dst.put_u32_le(self.size as u32);
        dst.put_u32_le(self.table.len() as u32);
        dst.put_u32_le(self.storage.image_size() as u32);
        dst.extend_from_slice(&self.table);
        self.storage.store_on(dst);
    }

    pub fn serialize(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(self.image_size());
        self.store_on(&mut out);
        out
    }

    pub fn save_on(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &self.serialize()[..])?;
        Ok(())
    }

    /// Rebuild a segment from exactly one segment image
    ///
    /// The storage comes back with the default growth increment; see
    /// [`Segment::set_growth_increment`].
    pub fn load(image: BytesMut, keys: F, values: VC, options: Options, copy: bool) -> Result<Self> {
        let (size, table_len, storage_len) = read_header(&image)?;
        check_underflow(SEGMENT_HEADER_LEN + table_len + storage_len, image.len())?;
        if table_len == 0 || table_len % 4 != 0 {
            return Err(HeapError::InvalidImage(format!(
                "bucket table of {} bytes is not a whole number of roots",
                table_len
            )));
        }

        let mut image = image;
        image.advance(SEGMENT_HEADER_LEN);
        let table = image.split_to(table_len);
        let table = if copy { BytesMut::from(&table[..]) } else { table };
        let storage = Storage::load(image, copy)?;

        let reserved = storage.reserved();
        let stray = (0..table_len / 4)
            .map(|bucket| root_of(&table, bucket))
            .find(|&root| root != NIL && root as usize >= reserved);
        if let Some(root) = stray {
            return Err(HeapError::InvalidImage(format!(
                "bucket root {} lies outside the {} byte heap",
                root, reserved
            )));
        }

        Self::assemble(keys, values, options, table, storage, size)
    }

    pub fn load_from(path: &Path, keys: F, values: VC, options: Options) -> Result<Self> {
        let data = fs::read(path)?;
        Self::load(BytesMut::from(&data[..]), keys, values, options, false)
    }

    /// Split the next whole segment image off the front of `buf`
    pub(crate) fn split_image(buf: &mut BytesMut) -> Result<BytesMut> {
        let (_, table_len, storage_len) = read_header(buf)?;
        let total = SEGMENT_HEADER_LEN + table_len + storage_len;
        if buf.len() < total {
            return Err(HeapError::BufferUnderflow {
                expected: total as u64,
                got: buf.len() as u64,
            });
        }
        Ok(buf.split_to(total))
    }
}

/// `(size, table byte length, storage image length)` of a segment image
pub(crate) fn read_header(image: &[u8]) -> Result<(usize, usize, usize)> {
    if image.len() < SEGMENT_HEADER_LEN {
        return Err(HeapError::BufferUnderflow {
            expected: SEGMENT_HEADER_LEN as u64,
            got: image.len() as u64,
        });
    }
    let mut header = &image[..SEGMENT_HEADER_LEN];
    let size = header.get_u32_le() as usize;
    let table_len = header.get_u32_le() as usize;
    let storage_len = header.get_u32_le() as usize;
    Ok((size, table_len, storage_len))
}

fn corrupted(bucket: usize, node: Offset, what: &str) -> HeapError {
    HeapError::Corrupted(format!("bucket {} node {}: {}", bucket, node, what))
}
