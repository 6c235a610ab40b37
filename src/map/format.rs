//! Node Formats
//!
//! How a map entry is laid out inside its chunk, and how stored keys are
//! hashed, written, compared and read back.
//!
//! ## Object keys
//! ```text
//! ┌────────┬─────────┬────────┬────────┬────────┬───────┬──────────┬─────────┬───────┐
//! │ hash 4 │ keyLen 2│ left 4 │ right 4│ parent4│ color1│ [stamp 4]│ key     │ value │
//! └────────┴─────────┴────────┴────────┴────────┴───────┴──────────┴─────────┴───────┘
//!   0        4         6        10       14       18      19
//! ```
//!
//! ## Int32 keys
//! ```text
//! ┌───────┬────────┬────────┬────────┬────────┬───────┬──────────┬───────┐
//! │ key 4 │ hash 4 │ left 4 │ right 4│ parent4│ color1│ [stamp 4]│ value │
//! └───────┴────────┴────────┴────────┴────────┴───────┴──────────┴───────┘
//!   0       4        8        12       16       20      21
//! ```
//!
//! Values are never length-prefixed: the value codec frames itself and the
//! bytes after it (chunk slack) are ignored.

use std::cmp::Ordering;
use std::fmt;

use bytes::BytesMut;

use crate::codec::Codec;
use crate::config::KeyOrder;
use crate::error::{HeapError, Result};
use crate::malloc::{Offset, Storage, NIL};

pub(crate) const RED: i8 = 0;
pub(crate) const BLACK: i8 = 1;

const STAMP_LEN: u32 = 4;

// =============================================================================
// Layout
// =============================================================================

/// Field offsets shared by every node format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub hash: u32,
    pub left: u32,
    pub right: u32,
    pub parent: u32,
    pub color: u32,
    pub stamp: u32,

    /// Header length without a timestamp
    pub header: u32,
}

impl NodeLayout {
    /// Where the node body (key bytes, then value) starts
    pub const fn body(&self, timestamps: bool) -> u32 {
        if timestamps {
            self.header + STAMP_LEN
        } else {
            self.header
        }
    }

    pub fn hash_of(&self, storage: &Storage, node: Offset) -> i32 {
        storage.get_int(node + self.hash)
    }

    pub fn left(&self, storage: &Storage, node: Offset) -> Offset {
        if node == NIL {
            NIL
        } else {
            storage.get_uint(node + self.left)
        }
    }

    pub fn right(&self, storage: &Storage, node: Offset) -> Offset {
        if node == NIL {
            NIL
        } else {
            storage.get_uint(node + self.right)
        }
    }

    pub fn parent(&self, storage: &Storage, node: Offset) -> Offset {
        if node == NIL {
            NIL
        } else {
            storage.get_uint(node + self.parent)
        }
    }

    /// Color of `node`; the null leaf is black
    pub fn color(&self, storage: &Storage, node: Offset) -> i8 {
        if node == NIL {
            BLACK
        } else {
            storage.get_byte(node + self.color)
        }
    }

    pub fn set_left(&self, storage: &mut Storage, node: Offset, value: Offset) {
        storage.put_uint(node + self.left, value)
    }

    pub fn set_right(&self, storage: &mut Storage, node: Offset, value: Offset) {
        storage.put_uint(node + self.right, value)
    }

    pub fn set_parent(&self, storage: &mut Storage, node: Offset, value: Offset) {
        storage.put_uint(node + self.parent, value)
    }

    pub fn set_color(&self, storage: &mut Storage, node: Offset, color: i8) {
        if node != NIL {
            storage.put_byte(node + self.color, color)
        }
    }

    pub fn stamp(&self, storage: &Storage, node: Offset) -> u32 {
        storage.get_uint(node + self.stamp)
    }

    pub fn set_stamp(&self, storage: &mut Storage, node: Offset, stamp: u32) {
        storage.put_uint(node + self.stamp, stamp)
    }
}

// =============================================================================
// Key Format
// =============================================================================

/// A key being looked up, already encoded and hashed
pub struct Probe<'a, K> {
    pub key: &'a K,
    pub encoded: &'a [u8],
    pub hash: i32,
}

/// Key handling for one node layout
///
/// `body` arguments are `LAYOUT.body(timestamps)` for the owning segment.
pub trait KeyFormat: Clone {
    type Key;

    const LAYOUT: NodeLayout;

    /// Hash used for segment and bucket routing
    fn hash(&self, key: &Self::Key) -> Result<i32>;

    /// Append the body encoding of `key` (may be empty)
    fn encode(&self, key: &Self::Key, sink: &mut BytesMut) -> Result<()>;

    /// Whether `KeyOrder::Natural` can be used with this format
    fn supports_natural_order(&self) -> bool;

    /// Write hash and key fields into a freshly allocated node
    fn store_key(
        &self,
        storage: &mut Storage,
        node: Offset,
        probe: &Probe<'_, Self::Key>,
        body: u32,
    ) -> Result<()>;

    /// Node-relative offset of the value
    fn value_offset(&self, storage: &Storage, node: Offset, body: u32) -> u32;

    /// Order of `probe` relative to the key stored in `node`
    fn compare(
        &self,
        order: KeyOrder,
        probe: &Probe<'_, Self::Key>,
        storage: &Storage,
        node: Offset,
        body: u32,
    ) -> Result<Ordering>;

    /// Order of two stored keys
    fn compare_nodes(
        &self,
        order: KeyOrder,
        storage: &Storage,
        a: Offset,
        b: Offset,
        body: u32,
    ) -> Result<Ordering>;

    fn decode(&self, storage: &Storage, node: Offset, body: u32) -> Result<Self::Key>;
}

// =============================================================================
// Object Keys
// =============================================================================

const OBJECT_KEY_LEN: u32 = 4;

/// Arbitrary keys encoded with a codec and stored in the node body
pub struct ObjectKeys<KC: Codec> {
    codec: KC,
    hasher: Option<fn(&KC::Item) -> i32>,
    natural: Option<fn(&KC::Item, &KC::Item) -> Ordering>,
}

impl<KC: Codec> ObjectKeys<KC> {
    /// Keys hashed by the CRC-32 of their encoding
    pub fn new(codec: KC) -> Self {
        Self {
            codec,
            hasher: None,
            natural: None,
        }
    }

    /// Keys that can also be kept in their natural order
    pub fn sorted(codec: KC) -> Self
    where
        KC::Item: Ord,
    {
        Self {
            codec,
            hasher: None,
            natural: Some(|a: &KC::Item, b: &KC::Item| a.cmp(b)),
        }
    }

    /// Route keys with a custom hash function instead of CRC-32
    pub fn with_hasher(mut self, hasher: fn(&KC::Item) -> i32) -> Self {
        self.hasher = Some(hasher);
        self
    }

    pub fn codec(&self) -> &KC {
        &self.codec
    }

    fn key_len(storage: &Storage, node: Offset) -> usize {
        storage.get_ushort(node + OBJECT_KEY_LEN) as usize
    }

    fn stored_bytes<'s>(storage: &'s Storage, node: Offset, body: u32) -> Result<&'s [u8]> {
        storage.slice(node, body as usize, Some(Self::key_len(storage, node)))
    }

    fn natural(&self) -> Result<fn(&KC::Item, &KC::Item) -> Ordering> {
        self.natural.ok_or_else(|| {
            HeapError::Config("natural key order needs keys built with ObjectKeys::sorted".to_string())
        })
    }
}

impl<KC: Codec + Clone> Clone for ObjectKeys<KC> {
    fn clone(&self) -> Self {
        Self {
            codec: self.codec.clone(),
            hasher: self.hasher,
            natural: self.natural,
        }
    }
}

impl<KC: Codec + fmt::Debug> fmt::Debug for ObjectKeys<KC> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectKeys")
            .field("codec", &self.codec)
            .field("custom_hash", &self.hasher.is_some())
            .field("sorted", &self.natural.is_some())
            .finish()
    }
}

impl<KC: Codec + Clone> KeyFormat for ObjectKeys<KC> {
    type Key = KC::Item;

    const LAYOUT: NodeLayout = NodeLayout {
        hash: 0,
        left: 6,
        right: 10,
        parent: 14,
        color: 18,
        stamp: 19,
        header: 19,
    };

    fn hash(&self, key: &KC::Item) -> Result<i32> {
        if let Some(hasher) = self.hasher {
            return Ok(hasher(key));
        }
        let mut buf = BytesMut::new();
        self.encode(key, &mut buf)?;
        Ok(crc32fast::hash(&buf) as i32)
    }

    fn encode(&self, key: &KC::Item, sink: &mut BytesMut) -> Result<()> {
        let start = sink.len();
        self.codec.encode(key, sink)?;
        let len = sink.len() - start;
        if len > u16::MAX as usize {
            return Err(HeapError::InvalidKey(format!(
                "encoded key is {} bytes, the limit is {}",
                len,
                u16::MAX
            )));
        }
        Ok(())
    }

    fn supports_natural_order(&self) -> bool {
        self.natural.is_some()
    }

    fn store_key(
        &self,
        storage: &mut Storage,
        node: Offset,
        probe: &Probe<'_, KC::Item>,
        body: u32,
    ) -> Result<()> {
        storage.put_int(node + Self::LAYOUT.hash, probe.hash);
        storage.put_ushort(node + OBJECT_KEY_LEN, probe.encoded.len() as u16);
        storage.write(node, body as usize, probe.encoded)
    }

    fn value_offset(&self, storage: &Storage, node: Offset, body: u32) -> u32 {
        body + Self::key_len(storage, node) as u32
    }

    fn compare(
        &self,
        order: KeyOrder,
        probe: &Probe<'_, KC::Item>,
        storage: &Storage,
        node: Offset,
        body: u32,
    ) -> Result<Ordering> {
        match order {
            KeyOrder::HashThenBytes => {
                let by_hash = probe.hash.cmp(&Self::LAYOUT.hash_of(storage, node));
                if by_hash != Ordering::Equal {
                    return Ok(by_hash);
                }
                Ok(probe.encoded.cmp(Self::stored_bytes(storage, node, body)?))
            }
            KeyOrder::Bytes => Ok(probe.encoded.cmp(Self::stored_bytes(storage, node, body)?)),
            KeyOrder::Natural => {
                let cmp = self.natural()?;
                let stored = self.decode(storage, node, body)?;
                Ok(cmp(probe.key, &stored))
            }
        }
    }

    fn compare_nodes(
        &self,
        order: KeyOrder,
        storage: &Storage,
        a: Offset,
        b: Offset,
        body: u32,
    ) -> Result<Ordering> {
        let layout = Self::LAYOUT;
        match order {
            KeyOrder::HashThenBytes => {
                let by_hash = layout.hash_of(storage, a).cmp(&layout.hash_of(storage, b));
                if by_hash != Ordering::Equal {
                    return Ok(by_hash);
                }
                let left = Self::stored_bytes(storage, a, body)?;
                Ok(left.cmp(Self::stored_bytes(storage, b, body)?))
            }
            KeyOrder::Bytes => {
                let left = Self::stored_bytes(storage, a, body)?;
                Ok(left.cmp(Self::stored_bytes(storage, b, body)?))
            }
            KeyOrder::Natural => {
                let cmp = self.natural()?;
                let left = self.decode(storage, a, body)?;
                Ok(cmp(&left, &self.decode(storage, b, body)?))
            }
        }
    }

    fn decode(&self, storage: &Storage, node: Offset, body: u32) -> Result<KC::Item> {
        self.codec.decode_slice(Self::stored_bytes(storage, node, body)?)
    }
}

// =============================================================================
// Int32 Keys
// =============================================================================

const INT32_KEY: u32 = 0;

/// 32-bit integer keys held directly in the node header
///
/// The hash of a key is the key itself, and keys always compare
/// numerically whatever the configured order.
#[derive(Debug, Clone, Copy, Default)]
pub struct Int32Keys;

impl KeyFormat for Int32Keys {
    type Key = i32;

    const LAYOUT: NodeLayout = NodeLayout {
        hash: 4,
        left: 8,
        right: 12,
        parent: 16,
        color: 20,
        stamp: 21,
        header: 21,
    };

    fn hash(&self, key: &i32) -> Result<i32> {
        Ok(*key)
    }

    fn encode(&self, _key: &i32, _sink: &mut BytesMut) -> Result<()> {
        Ok(())
    }

    fn supports_natural_order(&self) -> bool {
        true
    }

    fn store_key(
        &self,
        storage: &mut Storage,
        node: Offset,
        probe: &Probe<'_, i32>,
        _body: u32,
    ) -> Result<()> {
        storage.put_int(node + INT32_KEY, *probe.key);
        storage.put_int(node + Self::LAYOUT.hash, probe.hash);
        Ok(())
    }

    fn value_offset(&self, _storage: &Storage, _node: Offset, body: u32) -> u32 {
        body
    }

    fn compare(
        &self,
        _order: KeyOrder,
        probe: &Probe<'_, i32>,
        storage: &Storage,
        node: Offset,
        _body: u32,
    ) -> Result<Ordering> {
        Ok(probe.key.cmp(&storage.get_int(node + INT32_KEY)))
    }

    fn compare_nodes(
        &self,
        _order: KeyOrder,
        storage: &Storage,
        a: Offset,
        b: Offset,
        _body: u32,
    ) -> Result<Ordering> {
        Ok(storage.get_int(a + INT32_KEY).cmp(&storage.get_int(b + INT32_KEY)))
    }

    fn decode(&self, storage: &Storage, node: Offset, _body: u32) -> Result<i32> {
        Ok(storage.get_int(node + INT32_KEY))
    }
}
