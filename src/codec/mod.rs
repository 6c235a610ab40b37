//! Codec Module
//!
//! The byte-oriented encode/decode contract the heap consumes for keys and
//! values.
//!
//! ## Responsibilities
//! - Encode a value into a growable sink (`BytesMut`)
//! - Decode a value from a bounded cursor (`Source`)
//! - Frame values itself: the heap never stores value lengths, so every
//!   codec must be self-delimiting
//!
//! ## Built-in codecs
//! ```text
//! ┌────────────────┬──────────────────────────────────────┐
//! │ I32Codec       │ 4 bytes, big-endian                  │
//! │ StringCodec    │ u32 LE length + UTF-8 bytes          │
//! │ BytesCodec     │ u32 LE length + raw bytes            │
//! │ BincodeCodec   │ bincode 1.x of any serde type        │
//! └────────────────┴──────────────────────────────────────┘
//! ```

mod serde_codec;
mod builtin;
mod source;

pub use serde_codec::BincodeCodec;
pub use builtin::{BytesCodec, I32Codec, StringCodec};
pub use source::Source;

use bytes::BytesMut;

use crate::error::Result;

/// Encodes and decodes one item type
pub trait Codec {
    type Item;

    /// Append the encoding of `item` to `sink`
    fn encode(&self, item: &Self::Item, sink: &mut BytesMut) -> Result<()>;

    /// Read one item from the front of `source`
    ///
    /// Trailing bytes after the item are left unread.
    fn decode(&self, source: &mut Source<'_>) -> Result<Self::Item>;

    /// Decode from a plain slice
    fn decode_slice(&self, bytes: &[u8]) -> Result<Self::Item> {
        self.decode(&mut Source::new(bytes))
    }
}
