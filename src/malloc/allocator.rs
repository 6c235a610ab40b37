//! dlmalloc-style allocator over offsets
//!
//! Doug Lea's segregated-fit design reduced to a single contiguous heap and
//! 32-bit size fields. The allocator owns only bookkeeping (bitmaps, bin
//! heads, top chunk, designated victim); every chunk header lives in the
//! caller's byte buffer, which is passed in on each call.
//!
//! ## Allocation order
//! 1. Small request with an exact (or next-size) small bin: pop it
//! 2. Small request larger than the designated victim: split a bigger
//!    small chunk, or the smallest tree chunk, and make the remainder the
//!    new victim
//! 3. Large request: best fit from the tree bins
//! 4. Split the designated victim
//! 5. Split the top chunk
//! 6. Otherwise fail softly so `Storage` can grow the buffer

use bytes::BufMut;

use super::{HeapStats, Offset, HEAP_BASE, MAX_SIGNED_32, METADATA_LEN, NIL};
use crate::error::{HeapError, Result};

// =============================================================================
// Layout Constants
// =============================================================================

const SIZE_T_BITSIZE: u32 = 32;
const SIZE_T_SIZE: u32 = SIZE_T_BITSIZE / 8;
const MALLOC_ALIGNMENT: u32 = 2 * SIZE_T_SIZE;
const CHUNK_ALIGN_MASK: u32 = MALLOC_ALIGNMENT - 1;
const CHUNK_OVERHEAD: u32 = 2 * SIZE_T_SIZE;
const MIN_CHUNK_SIZE: u32 = 4 * SIZE_T_SIZE;
const MIN_REQUEST: u32 = MIN_CHUNK_SIZE - CHUNK_OVERHEAD - 1;

/// Largest request the allocator will try to satisfy
pub const MAX_REQUEST: u32 = (MIN_CHUNK_SIZE << 2).wrapping_neg() & MAX_SIGNED_32;

const PINUSE_BIT: u32 = 1;
const CINUSE_BIT: u32 = 2;
const FLAG4_BIT: u32 = 4;
const INUSE_BITS: u32 = PINUSE_BIT | CINUSE_BIT;
const FLAG_BITS: u32 = PINUSE_BIT | CINUSE_BIT | FLAG4_BIT;

const NSMALLBINS: usize = 32;
const NTREEBINS: usize = 32;
const SMALLBIN_SHIFT: u32 = 3;
const TREEBIN_SHIFT: u32 = 8;
const MIN_LARGE_SIZE: u32 = 1 << TREEBIN_SHIFT;
const MAX_SMALL_SIZE: u32 = MIN_LARGE_SIZE - 1;
const MAX_SMALL_REQUEST: u32 = MAX_SMALL_SIZE - CHUNK_ALIGN_MASK - CHUNK_OVERHEAD;

/// Bytes kept past the top chunk so its header can always be written
pub(crate) const TOP_FOOT_SIZE: u32 = 24;

// Free chunk fields, relative to the chunk start
const FD: u32 = 8;
const BK: u32 = 12;
const CHILD: u32 = 16;
const PARENT: u32 = 24;
const INDEX: u32 = 28;

// =============================================================================
// Size Helpers
// =============================================================================

fn pad_request(req: u32) -> u32 {
    (req + CHUNK_OVERHEAD + CHUNK_ALIGN_MASK) & !CHUNK_ALIGN_MASK
}

fn chunk_to_mem(p: Offset) -> Offset {
    p + CHUNK_OVERHEAD
}

fn mem_to_chunk(mem: Offset) -> Offset {
    mem - CHUNK_OVERHEAD
}

fn is_aligned(a: u32) -> bool {
    a & CHUNK_ALIGN_MASK == 0
}

fn small_index(size: u32) -> usize {
    (size >> SMALLBIN_SHIFT) as usize
}

fn small_index_to_size(index: usize) -> u32 {
    (index as u32) << SMALLBIN_SHIFT
}

fn is_small(size: u32) -> bool {
    small_index(size) < NSMALLBINS
}

fn tree_bin_index(size: u32) -> usize {
    let x = size >> TREEBIN_SHIFT;
    if x == 0 {
        0
    } else if x > 0xFFFF {
        NTREEBINS - 1
    } else {
        let k = 31 - x.leading_zeros();
        ((k << 1) + ((size >> (k + TREEBIN_SHIFT - 1)) & 1)) as usize
    }
}

fn leftshift_for_tree_index(index: usize) -> u32 {
    if index == NTREEBINS - 1 {
        0
    } else {
        SIZE_T_BITSIZE - 1 - ((index as u32 >> 1) + TREEBIN_SHIFT - 2)
    }
}

/// Mask of all bits strictly above the lowest bit of `x`
fn left_bits(x: u32) -> u32 {
    (x << 1) | (x << 1).wrapping_neg()
}

fn read_word(heap: &[u8], p: Offset) -> u32 {
    let at = p as usize;
    match heap.get(at..at + 4) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        None => heap_corrupt!("Memory address {} is invalid (heap is {} bytes)", p, heap.len()),
    }
}

// =============================================================================
// Allocator State
// =============================================================================

/// Outcome of a successful free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freed {
    /// The coalesced chunk went into a small or tree bin
    Binned,

    /// The chunk was absorbed by the designated victim
    Victim,

    /// The chunk merged into the top chunk; memory from `released` upward is unused
    Top { released: Offset },
}

/// Bin index and wilderness bookkeeping for one heap
///
/// Holds no heap bytes itself. Pair it with the buffer it was built for on
/// every call; mixing buffers corrupts both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlAllocator {
    small_map: u32,
    dv_size: u32,
    tree_map: u32,
    top_size: i32,
    top: Offset,
    occupied: u32,
    dv: Offset,
    tree_bins: [Offset; NTREEBINS],
    small_bins: [Offset; NSMALLBINS],
}

impl Default for DlAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DlAllocator {
    /// Allocator for an empty heap
    pub fn new() -> Self {
        let mut dl = Self {
            small_map: 0,
            dv_size: 0,
            tree_map: 0,
            top_size: 0,
            top: NIL,
            occupied: 0,
            dv: NIL,
            tree_bins: [NIL; NTREEBINS],
            small_bins: [NIL; NSMALLBINS],
        };
        dl.clear();
        dl
    }

    /// Forget every chunk; the heap is treated as zero bytes long
    pub fn clear(&mut self) {
        self.top = HEAP_BASE;
        self.top_size = -((TOP_FOOT_SIZE + HEAP_BASE) as i32);
        self.dv = NIL;
        self.dv_size = 0;
        self.tree_bins = [NIL; NTREEBINS];
        self.small_bins = [NIL; NSMALLBINS];
        self.tree_map = 0;
        self.small_map = 0;
        self.occupied = 0;
    }

    /// Largest request `allocate` accepts
    pub fn max_request() -> usize {
        MAX_REQUEST as usize
    }

    /// Buffer growth that guarantees a retry of `bytes` succeeds from top
    pub fn growth_for(bytes: usize) -> usize {
        bytes + (CHUNK_OVERHEAD + CHUNK_ALIGN_MASK + MIN_CHUNK_SIZE + TOP_FOOT_SIZE + HEAP_BASE) as usize
    }

    /// Allocate `bytes` of payload; `None` when the heap is too small
    pub fn allocate(&mut self, heap: &mut [u8], bytes: usize) -> Option<Offset> {
        if bytes > MAX_REQUEST as usize {
            return None;
        }
        Chunks { dl: self, heap }.malloc(bytes as u32)
    }

    /// Free the payload at `mem`
    ///
    /// # Panics
    /// If `mem` is not a live allocation or the surrounding chunks are
    /// inconsistent.
    pub fn free(&mut self, heap: &mut [u8], mem: Offset) -> Freed {
        Chunks { dl: self, heap }.free(mem)
    }

    /// Account for `increase` more bytes appended to the heap
    pub fn expand(&mut self, heap: &mut [u8], increase: usize) -> Result<()> {
        let next = self.top_size as i64 + increase as i64;
        if next > MAX_SIGNED_32 as i64 {
            return Err(HeapError::CapacityExceeded {
                requested: increase as u64,
                reserved: heap.len() as u64,
            });
        }
        self.top_size = next as i32;
        if self.top_size >= 0 {
            let mut chunks = Chunks { dl: self, heap };
            let (top, size) = (chunks.dl.top, chunks.dl.top_size as u32);
            chunks.set_head(top, size | PINUSE_BIT);
        }
        Ok(())
    }

    /// Usable payload bytes of the live chunk at `mem`
    pub fn size_of(&self, heap: &[u8], mem: Offset) -> u32 {
        heap_assert!(
            mem >= HEAP_BASE + CHUNK_OVERHEAD && is_aligned(mem),
            "Memory address {} is invalid",
            mem
        );
        let head = read_word(heap, mem_to_chunk(mem) + 4);
        (head & !FLAG_BITS).saturating_sub(CHUNK_OVERHEAD)
    }

    /// Heap accounting for a buffer of `reserved` bytes
    pub fn stats(&self, reserved: usize) -> HeapStats {
        HeapStats {
            reserved,
            occupied: self.occupied as usize,
            top_size: self.top_size as i64,
            designated_victim_size: self.dv_size as usize,
        }
    }

    // =========================================================================
    // Image
    // =========================================================================

    /// Write the fixed-size metadata block (`METADATA_LEN` bytes)
    pub fn store_on<B: BufMut>(&self, dst: &mut B) {
        dst.put_u32_le(self.small_map);
        dst.put_u32_le(self.dv_size);
        dst.put_u32_le(self.tree_map);
        dst.put_i32_le(self.top_size);
        dst.put_u32_le(self.top);
        dst.put_u32_le(self.occupied);
        dst.put_u32_le(self.dv);
        for bin in &self.tree_bins {
            dst.put_u32_le(*bin);
        }
        for bin in &self.small_bins {
            dst.put_u32_le(*bin);
        }
    }

    /// Rebuild an allocator from its metadata block
    ///
    /// `heap_len` is the length of the buffer that will be paired with it;
    /// the wilderness and every bin head must fall inside it.
    pub fn load(meta: &[u8], heap_len: usize) -> Result<Self> {
        if meta.len() < METADATA_LEN {
            return Err(HeapError::BufferUnderflow {
                expected: METADATA_LEN as u64,
                got: meta.len() as u64,
            });
        }

        let mut words = meta[..METADATA_LEN]
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        let mut next = || words.next().unwrap_or(0);

        let mut dl = Self {
            small_map: next(),
            dv_size: next(),
            tree_map: next(),
            top_size: next() as i32,
            top: next(),
            occupied: next(),
            dv: next(),
            tree_bins: [NIL; NTREEBINS],
            small_bins: [NIL; NSMALLBINS],
        };
        for bin in dl.tree_bins.iter_mut() {
            *bin = next();
        }
        for bin in dl.small_bins.iter_mut() {
            *bin = next();
        }

        dl.validate(heap_len)?;
        Ok(dl)
    }

    fn validate(&self, heap_len: usize) -> Result<()> {
        let expected = self.top as i64 + self.top_size as i64 + TOP_FOOT_SIZE as i64;
        if expected < 0 || self.top < HEAP_BASE {
            return Err(HeapError::InvalidImage(format!(
                "top chunk at {} with size {} is not a valid wilderness",
                self.top, self.top_size
            )));
        }
        if (expected as usize) > heap_len {
            return Err(HeapError::BufferUnderflow {
                expected: expected as u64,
                got: heap_len as u64,
            });
        }
        if expected as usize != heap_len {
            return Err(HeapError::InvalidImage(format!(
                "heap is {} bytes but the top chunk ends at {}",
                heap_len, expected
            )));
        }

        let in_heap = |p: Offset| p == NIL || (p as usize) < heap_len;
        let bins_ok = self.tree_bins.iter().chain(self.small_bins.iter()).all(|&p| in_heap(p));
        if !bins_ok || !in_heap(self.dv) {
            return Err(HeapError::InvalidImage(
                "bin head outside of the heap".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Chunk Operations
// =============================================================================

/// The allocator paired with its heap for the duration of one call
struct Chunks<'a> {
    dl: &'a mut DlAllocator,
    heap: &'a mut [u8],
}

impl Chunks<'_> {
    // -------------------------------------------------------------------------
    // Raw fields
    // -------------------------------------------------------------------------

    fn word(&self, p: Offset) -> u32 {
        read_word(self.heap, p)
    }

    fn set_word(&mut self, p: Offset, value: u32) {
        let at = p as usize;
        let len = self.heap.len();
        match self.heap.get_mut(at..at + 4) {
            Some(b) => b.copy_from_slice(&value.to_le_bytes()),
            None => heap_corrupt!("Memory address {} is invalid (heap is {} bytes)", p, len),
        }
    }

    fn prev_foot(&self, p: Offset) -> u32 {
        self.word(p)
    }

    fn set_prev_foot(&mut self, p: Offset, value: u32) {
        self.set_word(p, value)
    }

    fn head(&self, p: Offset) -> u32 {
        self.word(p + 4)
    }

    fn set_head(&mut self, p: Offset, value: u32) {
        self.set_word(p + 4, value)
    }

    fn chunk_size(&self, p: Offset) -> u32 {
        self.head(p) & !FLAG_BITS
    }

    fn forward(&self, p: Offset) -> Offset {
        self.word(p + FD)
    }

    fn set_forward(&mut self, p: Offset, value: Offset) {
        self.set_word(p + FD, value)
    }

    fn backward(&self, p: Offset) -> Offset {
        self.word(p + BK)
    }

    fn set_backward(&mut self, p: Offset, value: Offset) {
        self.set_word(p + BK, value)
    }

    fn child(&self, p: Offset, index: usize) -> Offset {
        self.word(p + CHILD + 4 * index as u32)
    }

    fn set_child(&mut self, p: Offset, index: usize, value: Offset) {
        self.set_word(p + CHILD + 4 * index as u32, value)
    }

    fn leftmost_child(&self, p: Offset) -> Offset {
        let left = self.child(p, 0);
        if left != NIL {
            left
        } else {
            self.child(p, 1)
        }
    }

    fn parent(&self, p: Offset) -> Offset {
        self.word(p + PARENT)
    }

    fn set_parent(&mut self, p: Offset, value: Offset) {
        self.set_word(p + PARENT, value)
    }

    fn tree_index(&self, p: Offset) -> usize {
        self.word(p + INDEX) as usize
    }

    fn set_tree_index(&mut self, p: Offset, index: usize) {
        self.set_word(p + INDEX, index as u32)
    }

    // -------------------------------------------------------------------------
    // Flags
    // -------------------------------------------------------------------------

    fn previous_in_use(&self, p: Offset) -> bool {
        self.head(p) & PINUSE_BIT != 0
    }

    fn chunk_in_use(&self, p: Offset) -> bool {
        self.head(p) & CINUSE_BIT != 0
    }

    fn is_in_use(&self, p: Offset) -> bool {
        self.head(p) & INUSE_BITS != PINUSE_BIT
    }

    fn next_chunk(&self, p: Offset) -> Offset {
        p + self.chunk_size(p)
    }

    fn prev_chunk(&self, p: Offset) -> Offset {
        p - self.prev_foot(p)
    }

    fn set_foot(&mut self, p: Offset, size: u32) {
        self.set_prev_foot(p + size, size)
    }

    fn clear_previous_in_use(&mut self, p: Offset) {
        let head = self.head(p);
        self.set_head(p, head & !PINUSE_BIT)
    }

    fn set_size_and_pinuse_of_free(&mut self, p: Offset, size: u32) {
        self.set_head(p, size | PINUSE_BIT);
        self.set_foot(p, size);
    }

    fn set_free_with_pinuse(&mut self, p: Offset, size: u32, next: Offset) {
        self.clear_previous_in_use(next);
        self.set_size_and_pinuse_of_free(p, size);
    }

    fn set_size_and_pinuse_of_inuse(&mut self, p: Offset, size: u32) {
        self.set_head(p, size | PINUSE_BIT | CINUSE_BIT);
        self.set_foot(p, size);
        self.dl.occupied += size;
    }

    fn set_inuse_and_pinuse(&mut self, p: Offset, size: u32) {
        self.set_size_and_pinuse_of_inuse(p, size);
        let next_head = self.head(p + size);
        self.set_head(p + size, next_head | PINUSE_BIT);
    }

    fn check_inuse_chunk(&self, p: Offset) {
        heap_assert!(
            is_aligned(chunk_to_mem(p)),
            "Chunk address [mem: {} => chunk: {}] is incorrectly aligned",
            chunk_to_mem(p),
            p
        );
        heap_assert!(self.is_in_use(p), "Chunk at {} is not in use", p);
        heap_assert!(
            self.previous_in_use(self.next_chunk(p)),
            "Chunk after {} does not see this chunk as in use",
            p
        );
        heap_assert!(
            self.previous_in_use(p) || self.next_chunk(self.prev_chunk(p)) == p,
            "Previous chunk to {} is marked free but has an incorrect next pointer",
            p
        );
    }

    // -------------------------------------------------------------------------
    // Bitmaps
    // -------------------------------------------------------------------------

    fn mark_small_map(&mut self, index: usize) {
        self.dl.small_map |= 1 << index;
    }

    fn clear_small_map(&mut self, index: usize) {
        self.dl.small_map &= !(1 << index);
    }

    fn small_map_is_marked(&self, index: usize) -> bool {
        self.dl.small_map & (1 << index) != 0
    }

    fn mark_tree_map(&mut self, index: usize) {
        self.dl.tree_map |= 1 << index;
    }

    fn clear_tree_map(&mut self, index: usize) {
        self.dl.tree_map &= !(1 << index);
    }

    fn tree_map_is_marked(&self, index: usize) -> bool {
        self.dl.tree_map & (1 << index) != 0
    }

    // =========================================================================
    // malloc
    // =========================================================================

    fn malloc(&mut self, bytes: u32) -> Option<Offset> {
        let nb = if bytes < MIN_REQUEST {
            MIN_CHUNK_SIZE
        } else {
            pad_request(bytes)
        };

        if bytes <= MAX_SMALL_REQUEST {
            let mut index = small_index(nb);
            let small_bits = self.dl.small_map >> index;

            if small_bits & 0x3 != 0 {
                // Exact fit, or the next bin up (remainder would be too small to split)
                index += (!small_bits & 1) as usize;
                return Some(self.allocate_from_small_bin(index));
            } else if nb > self.dl.dv_size {
                if small_bits != 0 {
                    let index = (small_bits << index).trailing_zeros() as usize;
                    return Some(self.split_from_small_bin(index, nb));
                } else if self.dl.tree_map != 0 {
                    return Some(self.split_small_from_tree(nb));
                }
            }
        } else if self.dl.tree_map != 0 {
            if let Some(mem) = self.split_from_tree(nb) {
                return Some(mem);
            }
        }

        if nb <= self.dl.dv_size {
            Some(self.split_from_victim(nb))
        } else if (nb as i64) < self.dl.top_size as i64 {
            Some(self.split_from_top(nb))
        } else {
            None
        }
    }

    fn unlink_first_small_chunk(&mut self, index: usize) -> Offset {
        let h = self.dl.small_bins[index];
        heap_assert!(
            self.chunk_size(h) == small_index_to_size(index),
            "Small bin {} holds chunk {} of size {}",
            index,
            h,
            self.chunk_size(h)
        );

        let f = self.forward(h);
        let b = self.backward(h);
        if f == h {
            heap_assert!(b == h, "Small bin {} has a broken chain at {}", index, h);
            self.clear_small_map(index);
            self.dl.small_bins[index] = NIL;
        } else {
            self.dl.small_bins[index] = f;
            self.set_backward(f, b);
            self.set_forward(b, f);
        }
        h
    }

    fn allocate_from_small_bin(&mut self, index: usize) -> Offset {
        let h = self.unlink_first_small_chunk(index);
        self.set_inuse_and_pinuse(h, small_index_to_size(index));
        chunk_to_mem(h)
    }

    fn split_from_small_bin(&mut self, index: usize, nb: u32) -> Offset {
        let h = self.unlink_first_small_chunk(index);
        let size = small_index_to_size(index);
        let rsize = size - nb;

        if rsize < MIN_CHUNK_SIZE {
            self.set_inuse_and_pinuse(h, size);
        } else {
            self.set_size_and_pinuse_of_inuse(h, nb);
            let r = h + nb;
            self.set_size_and_pinuse_of_free(r, rsize);
            self.replace_victim(r, rsize);
        }
        chunk_to_mem(h)
    }

    fn split_small_from_tree(&mut self, nb: u32) -> Offset {
        let index = self.dl.tree_map.trailing_zeros() as usize;
        let mut t = self.dl.tree_bins[index];
        let mut v = t;
        let mut rsize = self.chunk_size(t) - nb;

        loop {
            t = self.leftmost_child(t);
            if t == NIL {
                break;
            }
            let trem = self.chunk_size(t) - nb;
            if trem < rsize {
                rsize = trem;
                v = t;
            }
        }

        heap_assert!(v != NIL, "Tree bin {} is marked but empty", index);
        let r = v + nb;
        self.unlink_large_chunk(v);
        if rsize < MIN_CHUNK_SIZE {
            self.set_inuse_and_pinuse(v, rsize + nb);
        } else {
            self.set_size_and_pinuse_of_inuse(v, nb);
            self.set_size_and_pinuse_of_free(r, rsize);
            self.replace_victim(r, rsize);
        }
        chunk_to_mem(v)
    }

    fn split_from_tree(&mut self, nb: u32) -> Option<Offset> {
        let mut v = NIL;
        let mut rsize = nb.wrapping_neg() & MAX_SIGNED_32;
        let index = tree_bin_index(nb);
        let mut t = self.dl.tree_bins[index];

        if t != NIL {
            // Walk the trie along nb's bits, remembering the deepest untaken right subtree
            let mut size_bits = nb << leftshift_for_tree_index(index);
            let mut rst = NIL;
            loop {
                if let Some(trem) = self.chunk_size(t).checked_sub(nb) {
                    if trem < rsize {
                        v = t;
                        rsize = trem;
                        if rsize == 0 {
                            break;
                        }
                    }
                }
                let rt = self.child(t, 1);
                t = self.child(t, (size_bits >> (SIZE_T_BITSIZE - 1)) as usize);
                if rt != NIL && rt != t {
                    rst = rt;
                }
                if t == NIL {
                    t = rst;
                    break;
                }
                size_bits <<= 1;
            }
        }

        if t == NIL && v == NIL {
            let lb = left_bits(1 << index) & self.dl.tree_map;
            if lb != 0 {
                t = self.dl.tree_bins[lb.trailing_zeros() as usize];
            }
        }

        while t != NIL {
            if let Some(trem) = self.chunk_size(t).checked_sub(nb) {
                if trem < rsize {
                    rsize = trem;
                    v = t;
                }
            }
            t = self.leftmost_child(t);
        }

        let victim_fit = self.dl.dv_size as i64 - nb as i64;
        if v == NIL || (victim_fit >= 0 && rsize as i64 >= victim_fit) {
            return None;
        }

        heap_assert!(
            self.chunk_size(v) == rsize + nb,
            "Tree chunk {} changed size during split",
            v
        );
        let r = v + nb;
        self.unlink_large_chunk(v);
        if rsize < MIN_CHUNK_SIZE {
            self.set_inuse_and_pinuse(v, rsize + nb);
        } else {
            self.set_size_and_pinuse_of_inuse(v, nb);
            self.set_size_and_pinuse_of_free(r, rsize);
            self.insert_chunk(r, rsize);
        }
        Some(chunk_to_mem(v))
    }

    fn split_from_victim(&mut self, nb: u32) -> Offset {
        let p = self.dl.dv;
        let rsize = self.dl.dv_size - nb;

        if rsize >= MIN_CHUNK_SIZE {
            let r = p + nb;
            self.dl.dv = r;
            self.dl.dv_size = rsize;
            self.set_size_and_pinuse_of_free(r, rsize);
            self.set_size_and_pinuse_of_inuse(p, nb);
        } else {
            let size = self.dl.dv_size;
            self.dl.dv = NIL;
            self.dl.dv_size = 0;
            self.set_inuse_and_pinuse(p, size);
        }
        chunk_to_mem(p)
    }

    fn split_from_top(&mut self, nb: u32) -> Offset {
        self.dl.top_size -= nb as i32;
        let rsize = self.dl.top_size as u32;
        let p = self.dl.top;
        let r = p + nb;
        self.dl.top = r;
        self.set_head(r, rsize | PINUSE_BIT);
        self.set_size_and_pinuse_of_inuse(p, nb);
        chunk_to_mem(p)
    }

    fn replace_victim(&mut self, p: Offset, size: u32) {
        let dv_size = self.dl.dv_size;
        if dv_size != 0 {
            let dv = self.dl.dv;
            self.insert_chunk(dv, dv_size);
        }
        self.dl.dv_size = size;
        self.dl.dv = p;
    }

    // =========================================================================
    // Bins
    // =========================================================================

    fn insert_chunk(&mut self, p: Offset, size: u32) {
        if is_small(size) {
            self.insert_small_chunk(p, size);
        } else {
            self.insert_large_chunk(p, size);
        }
    }

    fn unlink_chunk(&mut self, p: Offset, size: u32) {
        if is_small(size) {
            self.unlink_small_chunk(p, size);
        } else {
            self.unlink_large_chunk(p);
        }
    }

    fn insert_small_chunk(&mut self, p: Offset, size: u32) {
        let index = small_index(size);
        let h = self.dl.small_bins[index];

        if !self.small_map_is_marked(index) {
            self.mark_small_map(index);
            self.dl.small_bins[index] = p;
            self.set_forward(p, p);
            self.set_backward(p, p);
        } else {
            heap_assert!(h != NIL, "Small bin {} is marked but empty", index);
            let b = self.backward(h);
            self.set_forward(b, p);
            self.set_forward(p, h);
            self.set_backward(h, p);
            self.set_backward(p, b);
        }
    }

    fn unlink_small_chunk(&mut self, p: Offset, size: u32) {
        let f = self.forward(p);
        let b = self.backward(p);
        let index = small_index(size);
        heap_assert!(
            self.chunk_size(p) == small_index_to_size(index),
            "Chunk {} of size {} found in small bin {}",
            p,
            self.chunk_size(p),
            index
        );

        if f == p {
            heap_assert!(b == p, "Small bin {} has a broken chain at {}", index, p);
            self.clear_small_map(index);
            self.dl.small_bins[index] = NIL;
        } else {
            heap_assert!(self.dl.small_bins[index] != NIL, "Small bin {} is empty", index);
            if self.dl.small_bins[index] == p {
                self.dl.small_bins[index] = f;
            }
            self.set_forward(b, f);
            self.set_backward(f, b);
        }
    }

    fn insert_large_chunk(&mut self, x: Offset, size: u32) {
        let index = tree_bin_index(size);
        self.set_tree_index(x, index);
        self.set_child(x, 0, NIL);
        self.set_child(x, 1, NIL);

        if !self.tree_map_is_marked(index) {
            self.mark_tree_map(index);
            self.dl.tree_bins[index] = x;
            self.set_parent(x, NIL);
            self.set_forward(x, x);
            self.set_backward(x, x);
            return;
        }

        let mut t = self.dl.tree_bins[index];
        let mut k = size << leftshift_for_tree_index(index);
        loop {
            if self.chunk_size(t) != size {
                let dir = ((k >> (SIZE_T_BITSIZE - 1)) & 1) as usize;
                let child = self.child(t, dir);
                k <<= 1;
                if child != NIL {
                    t = child;
                } else {
                    self.set_child(t, dir, x);
                    self.set_parent(x, t);
                    self.set_forward(x, x);
                    self.set_backward(x, x);
                    break;
                }
            } else {
                // Same size: chain x after t, off the trie
                let f = self.forward(t);
                heap_assert!(f != NIL, "Tree chunk {} has no forward link", t);
                self.set_backward(f, x);
                self.set_forward(t, x);
                self.set_forward(x, f);
                self.set_backward(x, t);
                self.set_parent(x, NIL);
                break;
            }
        }
    }

    fn unlink_large_chunk(&mut self, x: Offset) {
        let xp = self.parent(x);
        let mut r;

        if self.backward(x) != x {
            let f = self.forward(x);
            r = self.backward(x);
            heap_assert!(f != NIL, "Tree chunk {} has no forward link", x);
            self.set_backward(f, r);
            self.set_forward(r, f);
        } else {
            let mut rp_index = 1;
            r = self.child(x, 1);
            if r == NIL {
                rp_index = 0;
                r = self.child(x, 0);
            }
            if r != NIL {
                // Detach the deepest descendant to take x's place
                let mut rp = x;
                loop {
                    if self.child(r, 1) != NIL {
                        rp = r;
                        rp_index = 1;
                        r = self.child(r, 1);
                    } else if self.child(r, 0) != NIL {
                        rp = r;
                        rp_index = 0;
                        r = self.child(r, 0);
                    } else {
                        break;
                    }
                }
                self.set_child(rp, rp_index, NIL);
            }
        }

        let index = self.tree_index(x);
        heap_assert!(index < NTREEBINS, "Tree chunk {} has bin index {}", x, index);
        if xp == NIL && self.dl.tree_bins[index] != x {
            // x was a chained duplicate; the trie is untouched
            return;
        }

        if self.dl.tree_bins[index] == x {
            self.dl.tree_bins[index] = r;
            if r == NIL {
                self.clear_tree_map(index);
            } else {
                self.set_parent(r, NIL);
            }
        } else if self.child(xp, 0) == x {
            self.set_child(xp, 0, r);
        } else {
            self.set_child(xp, 1, r);
        }

        if r != NIL {
            self.set_parent(r, xp);
            let c0 = self.child(x, 0);
            if c0 != NIL {
                self.set_child(r, 0, c0);
                self.set_parent(c0, r);
            }
            let c1 = self.child(x, 1);
            if c1 != NIL {
                self.set_child(r, 1, c1);
                self.set_parent(c1, r);
            }
        }
    }

    // =========================================================================
    // free
    // =========================================================================

    fn free(&mut self, mem: Offset) -> Freed {
        heap_assert!(
            mem >= HEAP_BASE + CHUNK_OVERHEAD && mem < self.dl.top,
            "Address {} has not been allocated",
            mem
        );
        let mut p = mem_to_chunk(mem);
        heap_assert!(self.is_in_use(p), "Address {} has not been allocated", mem);
        self.check_inuse_chunk(p);

        let mut psize = self.chunk_size(p);
        self.dl.occupied -= psize;
        let next = p + psize;

        if !self.previous_in_use(p) {
            let prev_size = self.prev_foot(p);
            heap_assert!(
                prev_size <= p - HEAP_BASE,
                "Chunk {} points to a previous chunk before the heap",
                p
            );
            let previous = p - prev_size;
            psize += prev_size;
            p = previous;
            if p != self.dl.dv {
                self.unlink_chunk(p, prev_size);
            } else if self.head(next) & INUSE_BITS == INUSE_BITS {
                self.dl.dv_size = psize;
                self.set_free_with_pinuse(p, psize, next);
                return Freed::Victim;
            }
        }

        heap_assert!(
            p < next && self.previous_in_use(next),
            "Problem with next chunk [{}][{}: previous-inuse={}]",
            psize,
            next,
            self.previous_in_use(next)
        );

        if !self.chunk_in_use(next) {
            if next == self.dl.top {
                self.dl.top_size += psize as i32;
                self.dl.top = p;
                let top_size = self.dl.top_size as u32;
                self.set_head(p, top_size | PINUSE_BIT);
                if p == self.dl.dv {
                    self.dl.dv = NIL;
                    self.dl.dv_size = 0;
                }
                return Freed::Top {
                    released: p + TOP_FOOT_SIZE,
                };
            } else if next == self.dl.dv {
                self.dl.dv_size += psize;
                self.dl.dv = p;
                let dv_size = self.dl.dv_size;
                self.set_size_and_pinuse_of_free(p, dv_size);
                return Freed::Victim;
            } else {
                let nsize = self.chunk_size(next);
                psize += nsize;
                self.unlink_chunk(next, nsize);
                self.set_size_and_pinuse_of_free(p, psize);
                if p == self.dl.dv {
                    self.dl.dv_size = psize;
                    return Freed::Victim;
                }
            }
        } else {
            self.set_free_with_pinuse(p, psize, next);
        }

        self.insert_chunk(p, psize);
        Freed::Binned
    }
}
