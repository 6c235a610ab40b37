//! Growable Array
//!
//! A vector of codec-encoded elements kept in a private `Storage`.
//!
//! ## Layout
//! ```text
//! index table chunk:  [ off 0 | off 1 | off 2 | ... ]   (u32 LE, NIL = hole)
//!                         │       │
//!                         ▼       ▼
//!                     element  element                  (one chunk each)
//! ```
//!
//! ## Image Format
//! `[4 count][4 table offset][4 table byte length][storage image]`

use std::fs;
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::Codec;
use crate::error::{HeapError, Result};
use crate::malloc::{Offset, Storage, HEAP_BASE, NIL};

const HEADER_LEN: usize = 12;

/// Capacities are rounded up to this many slots
const CAPACITY_QUANTUM: usize = 128;

fn align_up(n: usize, to: usize) -> usize {
    n.div_ceil(to) * to
}

/// Growable array over an offset-addressed heap
pub struct HeapVec<C: Codec> {
    codec: C,
    storage: Storage,
    table: Offset,
    len: usize,
    scratch: BytesMut,
}

impl<C: Codec> HeapVec<C> {
    /// Array sized for `capacity` elements of roughly `avg_size` encoded bytes
    pub fn new(capacity: usize, codec: C, avg_size: usize) -> Result<Self> {
        let capacity = align_up(capacity.max(1), CAPACITY_QUANTUM);
        let mut storage = Storage::new(capacity * (4 + avg_size))?;
        let table = storage.malloc(capacity * 4)?;
        table.chunk.fill(0);
        let table = table.offset;

        Ok(Self {
            codec,
            storage,
            table,
            len: 0,
            scratch: BytesMut::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Slots available before the index table must grow
    pub fn capacity(&self) -> usize {
        self.storage.size_of(self.table) / 4
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn slot(&self, index: usize) -> Offset {
        self.storage.get_uint(self.table + (index * 4) as u32)
    }

    fn set_slot(&mut self, index: usize, offset: Offset) {
        self.storage.put_uint(self.table + (index * 4) as u32, offset)
    }

    /// Element at `index`; `None` past the end or for a never-written slot
    pub fn get(&self, index: usize) -> Result<Option<C::Item>> {
        if index >= self.len {
            return Ok(None);
        }
        let at = self.slot(index);
        if at == NIL {
            return Ok(None);
        }
        self.codec
            .decode_slice(self.storage.slice(at, 0, None)?)
            .map(Some)
    }

    /// Store `value` at `index`, extending the array past its end if needed
    pub fn set(&mut self, index: usize, value: &C::Item) -> Result<()> {
        if index >= self.capacity() {
            self.grow(index + 1)?;
        }

        let mut buf = std::mem::take(&mut self.scratch);
        buf.clear();
        let result = self
            .codec
            .encode(value, &mut buf)
            .and_then(|_| self.store(index, &buf));
        self.scratch = buf;
        result?;

        if index >= self.len {
            self.len = index + 1;
        }
        Ok(())
    }

    fn store(&mut self, index: usize, encoded: &[u8]) -> Result<()> {
        let mut at = self.slot(index);
        if at != NIL && self.storage.size_of(at) < encoded.len() {
            self.storage.free(at);
            at = NIL;
        }
        if at == NIL {
            at = self.storage.allocate(encoded.len())?;
        }
        self.storage.write(at, 0, encoded)?;
        self.set_slot(index, at);
        Ok(())
    }

    /// Move the index table into a chunk with at least `required` slots
    fn grow(&mut self, required: usize) -> Result<()> {
        let capacity = self.capacity();
        let next_len = align_up(required, 16).max(capacity + (capacity >> 1));

        let next = self.storage.allocate(next_len * 4)?;
        let old_bytes = capacity * 4;
        self.storage.copy(self.table, next, old_bytes);
        let new_bytes = self.storage.size_of(next);
        self.storage.slice_mut(next, old_bytes, None)?.fill(0);
        self.storage.free(self.table);
        self.table = next;

        tracing::debug!("Array index grown from {} to {} slots", capacity, new_bytes / 4);
        Ok(())
    }

    pub fn push(&mut self, value: &C::Item) -> Result<()> {
        self.set(self.len, value)
    }

    /// Remove and return the last element
    pub fn pop(&mut self) -> Result<Option<C::Item>> {
        if self.len == 0 {
            return Ok(None);
        }
        let last = self.len - 1;
        let value = self.get(last)?;
        let at = self.slot(last);
        self.storage.free(at);
        self.set_slot(last, NIL);
        self.len = last;
        Ok(value)
    }

    /// Remove and return the first element, shifting the rest down
    pub fn poll(&mut self) -> Result<Option<C::Item>> {
        if self.len == 0 {
            return Ok(None);
        }
        let value = self.get(0)?;
        let at = self.slot(0);
        self.storage.free(at);
        let remaining = self.len - 1;
        self.storage.copy(self.table + 4, self.table, remaining * 4);
        self.set_slot(remaining, NIL);
        self.len = remaining;
        Ok(value)
    }

    /// Elements in index order; holes decode as `None`
    pub fn iter(&self) -> impl Iterator<Item = Result<Option<C::Item>>> + '_ {
        (0..self.len).map(move |i| self.get(i))
    }

    // =========================================================================
    // Image
    // =========================================================================

    pub fn image_size(&self) -> usize {
        HEADER_LEN + self.storage.image_size()
    }

    pub fn store_on(&self, dst: &mut BytesMut) {
        dst.reserve(self.image_size());
        dst.put_u32_le(self.len as u32);
        dst.put_u32_le(self.table);
        dst.put_u32_le(self.storage.size_of(self.table) as u32);
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

    pub fn load(image: BytesMut, codec: C, copy: bool) -> Result<Self> {
        if image.len() < HEADER_LEN {
            return Err(HeapError::BufferUnderflow {
                expected: HEADER_LEN as u64,
                got: image.len() as u64,
            });
        }
        let mut image = image;
        let len = image.get_u32_le() as usize;
        let table = image.get_u32_le();
        let table_len = image.get_u32_le() as usize;
        let storage = Storage::load(image, copy)?;

        // The chunk header sits in the 8 bytes below the payload
        let in_heap = table >= HEAP_BASE + 8
            && table % 8 == 0
            && table as usize + table_len <= storage.reserved();
        if !in_heap || storage.size_of(table) != table_len || len * 4 > table_len {
            return Err(HeapError::InvalidImage(format!(
                "index table at {} ({} bytes) cannot hold {} elements",
                table, table_len, len
            )));
        }

        Ok(Self {
            codec,
            storage,
            table,
            len,
            scratch: BytesMut::new(),
        })
    }

    pub fn load_from(path: &Path, codec: C) -> Result<Self> {
        let data = fs::read(path)?;
        Self::load(BytesMut::from(&data[..]), codec, false)
    }
}
