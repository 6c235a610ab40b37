//! Map Module
//!
//! Hash maps whose entries live inside an offset-addressed heap.
//!
//! ## Structure
//! ```text
//! HeapMap ──► Segment 0 ──► bucket table ──► red-black tree per bucket
//!         ├─► Segment 1        (roots)             │
//!         └─► ...                                  ▼
//!                              Storage (private heap, one chunk per entry)
//! ```
//!
//! A key picks its segment by `|hash| % segments` and its bucket by
//! `|hash| % table_size`. With one bucket the segment is a single sorted
//! tree.

mod facade;
mod format;
mod iter;
mod segment;
mod shared;
mod tree;

pub use facade::{HeapMap, ImageSummary, SegmentSummary};
pub use format::{Int32Keys, KeyFormat, NodeLayout, ObjectKeys, Probe};
pub use iter::{Entries, Keys, Values};
pub use segment::Segment;
pub use shared::SharedMap;

use crate::config::{Config, KeyOrder};
use crate::error::{HeapError, Result};

/// Option flags persisted in map images
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Options(u32);

impl Options {
    pub const TIMESTAMPS: u32 = 0x1;
    pub const HASH_THEN_BYTE_ORDER: u32 = 0x2;
    pub const BYTE_ORDER: u32 = 0x4;
    pub const NATURAL_ORDER: u32 = 0x8;

    const ORDER_MASK: u32 = Self::HASH_THEN_BYTE_ORDER | Self::BYTE_ORDER | Self::NATURAL_ORDER;

    pub fn new(timestamps: bool, order: KeyOrder) -> Self {
        let order = match order {
            KeyOrder::HashThenBytes => Self::HASH_THEN_BYTE_ORDER,
            KeyOrder::Bytes => Self::BYTE_ORDER,
            KeyOrder::Natural => Self::NATURAL_ORDER,
        };
        let stamps = if timestamps { Self::TIMESTAMPS } else { 0 };
        Self(order | stamps)
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.timestamps, config.key_order)
    }

    /// Parse persisted flags; exactly one order bit must be set
    pub fn from_bits(bits: u32) -> Result<Self> {
        let known = Self::TIMESTAMPS | Self::ORDER_MASK;
        if bits & !known != 0 || (bits & Self::ORDER_MASK).count_ones() != 1 {
            return Err(HeapError::InvalidImage(format!("unknown option flags {:#x}", bits)));
        }
        Ok(Self(bits))
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn timestamps(&self) -> bool {
        self.0 & Self::TIMESTAMPS != 0
    }

    pub fn key_order(&self) -> KeyOrder {
        if self.0 & Self::NATURAL_ORDER != 0 {
            KeyOrder::Natural
        } else if self.0 & Self::BYTE_ORDER != 0 {
            KeyOrder::Bytes
        } else {
            KeyOrder::HashThenBytes
        }
    }
}

/// Index of `hash` in a table of `len` slots
pub(crate) fn slot_of(hash: i32, len: usize) -> usize {
    hash.unsigned_abs() as usize % len
}
