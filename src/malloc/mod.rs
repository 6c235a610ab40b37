//! Malloc Module
//!
//! An offset-addressed heap: a dlmalloc-style allocator over one growable
//! byte buffer, plus the `Storage` that owns that buffer.
//!
//! ## Responsibilities
//! - Hand out and reclaim chunks by integer offset (never native pointers)
//! - Grow the buffer on demand and retry
//! - Snapshot and restore the whole heap byte-for-byte
//!
//! ## Chunk Layout (32-bit profile)
//! ```text
//!  chunk ─► ┌──────────────┬──────────────┐
//!           │ prev_foot(4) │ head(4)      │   head = size | CINUSE | PINUSE
//!  mem   ─► ├──────────────┴──────────────┤
//!           │ payload (in use)            │
//!           │   or, when free:            │
//!           │ fd(4) bk(4)                 │   small bins
//!           │ child0(4) child1(4)         │
//!           │ parent(4) index(4)          │   tree bins (size >= 256)
//!           └─────────────────────────────┘
//! ```
//!
//! Offset 0 is never a chunk or a payload: the heap starts at `HEAP_BASE`,
//! so `NIL = 0` serves as the null link for bins, buckets and tree nodes.

/// Logs and panics on a violated heap invariant
macro_rules! heap_assert {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            heap_corrupt!($($arg)+);
        }
    };
}

/// Logs and panics: the heap is corrupted
macro_rules! heap_corrupt {
    ($($arg:tt)+) => {{
        let msg = format!($($arg)+);
        tracing::error!(target: "heapmap::malloc", "{}", msg);
        panic!("heap corruption: {}", msg)
    }};
}

mod allocator;
mod storage;

pub use allocator::{DlAllocator, Freed, MAX_REQUEST};
pub use storage::{Mem, Storage};

/// Offset of a chunk payload inside a heap buffer
pub type Offset = u32;

/// The null offset
pub const NIL: Offset = 0;

/// Largest signed 32-bit value; heaps never grow past it
pub const MAX_SIGNED_32: u32 = 0x7FFF_FFFF;

/// Bytes reserved in front of the first chunk
pub const HEAP_BASE: u32 = 8;

/// Size of the serialized allocator state: 7 scalars + 32 tree bins + 32 small bins
pub const METADATA_LEN: usize = (7 + 32 + 32) * 4;

/// What `Storage::release` does with the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOption {
    /// Keep the buffer but mark all of it free
    Logical,

    /// Drop the buffer entirely
    Physical,
}

/// Point-in-time heap accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes in the backing buffer
    pub reserved: usize,

    /// Bytes held by in-use chunks (headers included)
    pub occupied: usize,

    /// Bytes still available in the top chunk
    pub top_size: i64,

    /// Bytes held by the designated victim
    pub designated_victim_size: usize,
}
