//! # heapmap
//!
//! A serializable, offset-addressed heap and the hash maps built on it:
//! - dlmalloc-style allocator over one growable byte buffer
//! - Storage with typed access and byte-for-byte snapshots
//! - Red-black tree hash segments whose nodes live inside the heap
//! - Sharded map facade, per-shard locking and a growable array
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              HeapMap / SharedMap (sharding)                 │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  |hash| % segments
//!          ┌────────────┴────────────┐
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐        ┌──────────┐
//!   │  Segment 0  │   ...    │  Segment N  │        │ HeapVec  │
//!   │ RB buckets  │          │ RB buckets  │        │          │
//!   └──────┬──────┘          └──────┬──────┘        └────┬─────┘
//!          ▼                        ▼                    ▼
//!   ┌─────────────┐          ┌─────────────┐        ┌──────────┐
//!   │   Storage   │          │   Storage   │        │ Storage  │
//!   │ DlAllocator │          │ DlAllocator │        │          │
//!   └─────────────┘          └─────────────┘        └──────────┘
//! ```
//!
//! Every link is a 32-bit offset into a storage buffer, so a whole map is
//! saved by writing its buffers out and restored by reading them back.

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod codec;
pub mod malloc;
pub mod map;
pub mod array;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{HeapError, Result};
pub use config::{Config, KeyOrder};
pub use codec::{BincodeCodec, BytesCodec, Codec, I32Codec, Source, StringCodec};
pub use malloc::{HeapStats, Offset, ReleaseOption, Storage, NIL};
pub use map::{HeapMap, Int32Keys, ObjectKeys, Segment, SharedMap};
pub use array::HeapVec;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of heapmap
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
