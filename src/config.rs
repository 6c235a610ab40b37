//! Configuration for heapmap
//!
//! Centralized configuration with sensible defaults.

use crate::error::{HeapError, Result};

/// Default number of buckets per segment
pub const DEFAULT_TABLE_SIZE: usize = 4999;

/// Default heap growth quantum (1024 pages of 4 KiB)
pub const DEFAULT_GROWTH_INCREMENT: usize = 1024 * 0x1000;

/// Main configuration for a map instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Sharding Configuration
    // -------------------------------------------------------------------------
    /// Number of independent segments keys are spread across
    pub segments: usize,

    /// Number of red-black tree buckets per segment (fixed for life)
    pub table_size: usize,

    // -------------------------------------------------------------------------
    // Node Configuration
    // -------------------------------------------------------------------------
    /// Store a last-touched timestamp in every node
    pub timestamps: bool,

    /// Comparator used inside a bucket
    pub key_order: KeyOrder,

    // -------------------------------------------------------------------------
    // Heap Configuration
    // -------------------------------------------------------------------------
    /// Initial heap request for each segment's storage (in bytes)
    pub initial_storage: usize,

    /// Storage grows in multiples of this many bytes
    pub growth_increment: usize,
}

/// Ordering of entries within one bucket tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyOrder {
    /// Stored hash first, then the encoded key bytes (no decoding on descent)
    HashThenBytes,

    /// Encoded key bytes only
    Bytes,

    /// The decoded key's own `Ord` (sorted/tree maps)
    Natural,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            segments: 1,
            table_size: DEFAULT_TABLE_SIZE,
            timestamps: false,
            key_order: KeyOrder::HashThenBytes,
            initial_storage: 16,
            growth_increment: DEFAULT_GROWTH_INCREMENT,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// One segment holding one naturally ordered tree
    pub fn sorted() -> Self {
        Self {
            segments: 1,
            table_size: 1,
            key_order: KeyOrder::Natural,
            ..Self::default()
        }
    }

    /// Check field ranges
    pub fn validate(&self) -> Result<()> {
        if self.segments == 0 {
            return Err(HeapError::Config("segments must be at least 1".to_string()));
        }
        if self.table_size == 0 {
            return Err(HeapError::Config("table_size must be at least 1".to_string()));
        }
        if self.table_size > (i32::MAX as usize) / 4 {
            return Err(HeapError::Config(format!(
                "table_size {} does not fit a 32-bit table",
                self.table_size
            )));
        }
        if self.growth_increment == 0 {
            return Err(HeapError::Config("growth_increment must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the number of segments
    pub fn segments(mut self, count: usize) -> Self {
        self.config.segments = count;
        self
    }

    /// Set the number of buckets per segment
    pub fn table_size(mut self, size: usize) -> Self {
        self.config.table_size = size;
        self
    }

    /// Enable or disable node timestamps
    pub fn timestamps(mut self, enabled: bool) -> Self {
        self.config.timestamps = enabled;
        self
    }

    /// Set the in-bucket comparator
    pub fn key_order(mut self, order: KeyOrder) -> Self {
        self.config.key_order = order;
        self
    }

    /// Set the initial heap request per segment (in bytes)
    pub fn initial_storage(mut self, bytes: usize) -> Self {
        self.config.initial_storage = bytes;
        self
    }

    /// Set the heap growth quantum (rounded up to 8 bytes)
    pub fn growth_increment(mut self, bytes: usize) -> Self {
        self.config.growth_increment = (bytes + 7) & !7;
        self
    }

    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
