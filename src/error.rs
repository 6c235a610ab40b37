//! Error types for heapmap
//!
//! Provides a unified error type for all recoverable failures.
//!
//! Heap corruption is deliberately absent: a broken free chain or a chunk
//! with the wrong in-use flags is a bug, so the allocator logs it and panics
//! (see `heap_assert!` in the `malloc` module).

use thiserror::Error;

/// Result type alias using HeapError
pub type Result<T> = std::result::Result<T, HeapError>;

/// Unified error type for heapmap operations
#[derive(Debug, Error)]
pub enum HeapError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Allocation Errors
    // -------------------------------------------------------------------------
    /// Request exceeds the largest chunk the 32-bit allocator can describe
    #[error("Allocation of {requested} bytes exceeds the maximum request size")]
    AllocationTooLarge { requested: u64 },

    /// Growing the heap would overflow signed 32-bit offsets
    #[error("Cannot grow heap by {requested} bytes: {reserved} bytes already reserved")]
    CapacityExceeded { requested: u64, reserved: u64 },

    // -------------------------------------------------------------------------
    // Access Errors
    // -------------------------------------------------------------------------
    /// Chunk-relative access outside the chunk's usable size
    #[error("Invalid memory access at chunk {offset}: [{start}, {start}+{len}) exceeds {limit} usable bytes")]
    OutOfBounds {
        offset: u32,
        start: usize,
        len: usize,
        limit: usize,
    },

    // -------------------------------------------------------------------------
    // Image Errors
    // -------------------------------------------------------------------------
    /// A loaded image is shorter (or longer) than the lengths it declares
    #[error("Buffer underflow: expected {expected} got {got}")]
    BufferUnderflow { expected: u64, got: u64 },

    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Reported by explicit verification walks
    #[error("Structure corrupted: {0}")]
    Corrupted(String),

    // -------------------------------------------------------------------------
    // Key / Codec Errors
    // -------------------------------------------------------------------------
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HeapError {
    /// Whether this error came from a truncated or malformed image
    pub fn is_underflow(&self) -> bool {
        matches!(self, HeapError::BufferUnderflow { .. })
    }
}

/// Fails with `BufferUnderflow` unless `got == expected`
pub(crate) fn check_underflow(expected: usize, got: usize) -> Result<()> {
    if got != expected {
        return Err(HeapError::BufferUnderflow {
            expected: expected as u64,
            got: got as u64,
        });
    }
    Ok(())
}
