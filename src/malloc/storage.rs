//! Storage
//!
//! Owns one growable heap buffer and the allocator that manages it.
//!
//! ## Image Format
//! ```text
//! ┌──────────────┬──────────────────────────┬──────────────────────┐
//! │ id (8, LE)   │ allocator metadata (284) │ heap bytes (N)       │
//! └──────────────┴──────────────────────────┴──────────────────────┘
//! ```
//! N is the reserved buffer length at save time. The heap is written
//! verbatim, so a loaded storage resumes with every offset intact.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

use super::allocator::{DlAllocator, Freed, MAX_REQUEST};
use super::{HeapStats, Offset, ReleaseOption, MAX_SIGNED_32, METADATA_LEN, NIL};
use crate::config::DEFAULT_GROWTH_INCREMENT;
use crate::error::{HeapError, Result};

/// Bytes in front of the heap in a storage image
const HEADER_LEN: usize = 8 + METADATA_LEN;

static LAST_ID: AtomicI64 = AtomicI64::new(0);

/// Process-wide strictly increasing id, seeded from the wall clock
fn next_id() -> i64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0);
    let mut last = LAST_ID.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_ID.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// A freshly allocated chunk: its offset and its writable payload
pub struct Mem<'a> {
    pub offset: Offset,
    pub chunk: &'a mut [u8],
}

/// A growable, serializable heap addressed by offset
///
/// ## Growth
/// When the allocator cannot satisfy a request, the buffer is extended by a
/// multiple of the growth increment large enough for the request plus chunk
/// overhead, and the allocation is retried once. The retry cannot fail.
#[derive(Debug)]
pub struct Storage {
    id: i64,
    mem: BytesMut,
    dl: DlAllocator,
    growth_increment: usize,
}

impl Storage {
    /// Create a storage able to hold at least `initial` bytes without growing
    pub fn new(initial: usize) -> Result<Self> {
        Self::with_growth(initial, DEFAULT_GROWTH_INCREMENT)
    }

    /// Create a storage with a custom growth increment (rounded up to 8)
    pub fn with_growth(initial: usize, growth_increment: usize) -> Result<Self> {
        let mut storage = Self {
            id: next_id(),
            mem: BytesMut::new(),
            dl: DlAllocator::new(),
            growth_increment: align8(growth_increment.max(8)),
        };
        storage.extend_by(align8(DlAllocator::growth_for(initial)))?;
        Ok(storage)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate `bytes` of payload, growing the heap if needed
    pub fn allocate(&mut self, bytes: usize) -> Result<Offset> {
        if bytes > MAX_REQUEST as usize {
            return Err(HeapError::AllocationTooLarge {
                requested: bytes as u64,
            });
        }
        if let Some(offset) = self.dl.allocate(&mut self.mem, bytes) {
            return Ok(offset);
        }

        self.grow(bytes)?;
        match self.dl.allocate(&mut self.mem, bytes) {
            Some(offset) => Ok(offset),
            None => heap_corrupt!(
                "Allocation of {} bytes failed right after growing to {} bytes",
                bytes,
                self.mem.len()
            ),
        }
    }

    /// Allocate and hand back the payload for immediate writing
    pub fn malloc(&mut self, bytes: usize) -> Result<Mem<'_>> {
        let offset = self.allocate(bytes)?;
        let chunk = self.slice_mut(offset, 0, None)?;
        Ok(Mem { offset, chunk })
    }

    /// Free a chunk; returns false for `NIL`
    ///
    /// # Panics
    /// If `offset` is not a live allocation of this storage.
    pub fn free(&mut self, offset: Offset) -> bool {
        if offset == NIL {
            return false;
        }
        if let Freed::Top { released } = self.dl.free(&mut self.mem, offset) {
            self.on_released(released);
        }
        true
    }

    /// Usable payload bytes of the chunk at `offset`
    pub fn size_of(&self, offset: Offset) -> usize {
        self.dl.size_of(&self.mem, offset) as usize
    }

    fn on_released(&self, from: Offset) {
        tracing::trace!(
            "Heap above offset {} is unused ({} bytes reserved)",
            from,
            self.mem.len()
        );
    }

    fn grow(&mut self, request: usize) -> Result<()> {
        let needed = align8(DlAllocator::growth_for(request));
        let increment = self.growth_increment;
        let rounded = needed.div_ceil(increment) * increment;
        let reserved = self.mem.len();

        // Fall back to the exact need when a full increment would pass the limit
        let grow_by = if reserved + rounded <= MAX_SIGNED_32 as usize {
            rounded
        } else {
            needed
        };
        self.extend_by(grow_by)?;

        tracing::debug!(
            "Storage grown by {} bytes for a {} byte request, {} bytes reserved",
            grow_by,
            request,
            self.mem.len()
        );
        Ok(())
    }

    fn extend_by(&mut self, grow_by: usize) -> Result<()> {
        let reserved = self.mem.len();
        if reserved + grow_by > MAX_SIGNED_32 as usize {
            return Err(HeapError::CapacityExceeded {
                requested: grow_by as u64,
                reserved: reserved as u64,
            });
        }
        self.mem.resize(reserved + grow_by, 0);
        self.dl.expand(&mut self.mem, grow_by)
    }

    // =========================================================================
    // Chunk Access
    // =========================================================================

    fn chunk_range(
        &self,
        offset: Offset,
        start: usize,
        len: Option<usize>,
    ) -> Result<std::ops::Range<usize>> {
        let limit = self.size_of(offset);
        let len = match len {
            Some(len) => len,
            None => limit.saturating_sub(start),
        };
        if start > limit || len > limit - start {
            return Err(HeapError::OutOfBounds {
                offset,
                start,
                len,
                limit,
            });
        }
        let from = offset as usize + start;
        Ok(from..from + len)
    }

    /// View `len` bytes (default: the rest of the chunk) from `start` inside the chunk at `offset`
    pub fn slice(&self, offset: Offset, start: usize, len: Option<usize>) -> Result<&[u8]> {
        let range = self.chunk_range(offset, start, len)?;
        Ok(&self.mem[range])
    }

    /// Mutable counterpart of [`Storage::slice`]
    pub fn slice_mut(
        &mut self,
        offset: Offset,
        start: usize,
        len: Option<usize>,
    ) -> Result<&mut [u8]> {
        let range = self.chunk_range(offset, start, len)?;
        Ok(&mut self.mem[range])
    }

    /// Copy `bytes` into the chunk at `offset`, starting `start` bytes in
    pub fn write(&mut self, offset: Offset, start: usize, bytes: &[u8]) -> Result<()> {
        self.slice_mut(offset, start, Some(bytes.len()))?
            .copy_from_slice(bytes);
        Ok(())
    }

    /// Copy `len` bytes between absolute heap offsets (ranges may overlap)
    pub fn copy(&mut self, src: Offset, dst: Offset, len: usize) {
        let (src, dst) = (src as usize, dst as usize);
        let end = src.max(dst) + len;
        if end > self.mem.len() {
            heap_corrupt!(
                "Copy of {} bytes from {} to {} overruns the {} byte heap",
                len,
                src,
                dst,
                self.mem.len()
            );
        }
        self.mem.copy_within(src..src + len, dst);
    }

    /// The whole heap
    pub fn bytes(&self) -> &[u8] {
        &self.mem
    }

    // =========================================================================
    // Typed Access (absolute offsets, little-endian)
    // =========================================================================

    fn read_array<const N: usize>(&self, at: Offset) -> [u8; N] {
        let from = at as usize;
        match self.mem.get(from..from + N) {
            Some(b) => {
                let mut out = [0u8; N];
                out.copy_from_slice(b);
                out
            }
            None => heap_corrupt!("Read of {} bytes at {} is outside the heap", N, at),
        }
    }

    fn write_array<const N: usize>(&mut self, at: Offset, bytes: [u8; N]) {
        let from = at as usize;
        let len = self.mem.len();
        match self.mem.get_mut(from..from + N) {
            Some(b) => b.copy_from_slice(&bytes),
            None => heap_corrupt!("Write of {} bytes at {} is outside the {} byte heap", N, at, len),
        }
    }

    pub fn get_byte(&self, at: Offset) -> i8 {
        i8::from_le_bytes(self.read_array(at))
    }

    pub fn put_byte(&mut self, at: Offset, value: i8) {
        self.write_array(at, value.to_le_bytes())
    }

    pub fn get_short(&self, at: Offset) -> i16 {
        i16::from_le_bytes(self.read_array(at))
    }

    pub fn put_short(&mut self, at: Offset, value: i16) {
        self.write_array(at, value.to_le_bytes())
    }

    pub fn get_ushort(&self, at: Offset) -> u16 {
        u16::from_le_bytes(self.read_array(at))
    }

    pub fn put_ushort(&mut self, at: Offset, value: u16) {
        self.write_array(at, value.to_le_bytes())
    }

    pub fn get_int(&self, at: Offset) -> i32 {
        i32::from_le_bytes(self.read_array(at))
    }

    pub fn put_int(&mut self, at: Offset, value: i32) {
        self.write_array(at, value.to_le_bytes())
    }

    pub fn get_uint(&self, at: Offset) -> u32 {
        u32::from_le_bytes(self.read_array(at))
    }

    pub fn put_uint(&mut self, at: Offset, value: u32) {
        self.write_array(at, value.to_le_bytes())
    }

    pub fn get_long(&self, at: Offset) -> i64 {
        i64::from_le_bytes(self.read_array(at))
    }

    pub fn put_long(&mut self, at: Offset, value: i64) {
        self.write_array(at, value.to_le_bytes())
    }

    // =========================================================================
    // Image
    // =========================================================================

    /// Bytes `store_on` will write
    pub fn image_size(&self) -> usize {
        HEADER_LEN + self.mem.len()
    }

    /// Append the image to `dst`
    pub fn store_on(&self, dst: &mut BytesMut) {
        dst.reserve(self.image_size());
        dst.put_i64_le(self.id);
        self.dl.store_on(dst);
        dst.extend_from_slice(&self.mem);
    }

    /// The image as a new buffer
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
        fs::write(path, &self.serialize()[..])?;
        Ok(())
    }

    /// Rebuild a storage from a complete image
    ///
    /// With `copy == false` the heap keeps using `image`'s allocation;
    /// otherwise the heap bytes are duplicated. The growth increment is not
    /// stored in the image and starts at `DEFAULT_GROWTH_INCREMENT`.
    pub fn load(mut image: BytesMut, copy: bool) -> Result<Self> {
        if image.len() < HEADER_LEN {
            return Err(HeapError::BufferUnderflow {
                expected: HEADER_LEN as u64,
                got: image.len() as u64,
            });
        }

        let mut id = [0u8; 8];
        id.copy_from_slice(&image[..8]);
        let heap_len = image.len() - HEADER_LEN;
        let dl = DlAllocator::load(&image[8..HEADER_LEN], heap_len)?;

        let mem = if copy {
            BytesMut::from(&image[HEADER_LEN..])
        } else {
            image.split_off(HEADER_LEN)
        };

        tracing::debug!("Storage loaded: {} bytes reserved (copy: {})", mem.len(), copy);
        Ok(Self {
            id: i64::from_le_bytes(id),
            mem,
            dl,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
        })
    }

    /// Load an image file
    pub fn load_from(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        Self::load(BytesMut::from(&data[..]), false)
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Forget every allocation
    ///
    /// `Logical` keeps the buffer and makes all of it top chunk; `Physical`
    /// drops the buffer, so the next allocation grows from zero.
    pub fn release(&mut self, option: ReleaseOption) {
        let reserved = self.mem.len();
        self.dl.clear();
        match option {
            ReleaseOption::Logical => {
                // A buffer that already fit under the limit always fits again
                if let Err(e) = self.dl.expand(&mut self.mem, reserved) {
                    heap_corrupt!("Could not reclaim {} bytes: {}", reserved, e);
                }
            }
            ReleaseOption::Physical => {
                self.mem = BytesMut::new();
            }
        }
        tracing::debug!("Storage released ({:?}), {} bytes reserved", option, reserved);
    }

    /// Set the growth increment used from now on (rounded up to 8)
    pub fn set_growth_increment(&mut self, bytes: usize) {
        self.growth_increment = align8(bytes.max(8));
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    /// Bytes in the backing buffer
    pub fn reserved(&self) -> usize {
        self.mem.len()
    }

    pub fn stats(&self) -> HeapStats {
        self.dl.stats(self.mem.len())
    }
}

fn align8(n: usize) -> usize {
    (n + 7) & !7
}
