//! Serde-backed codec using bincode.

use std::fmt;
use std::marker::PhantomData;

use bytes::{BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Codec, Source};
use crate::error::{HeapError, Result};

/// Stores any serde type in bincode's compact format
///
/// bincode 1.x output is self-delimiting, so no extra framing is added.
pub struct BincodeCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> BincodeCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for BincodeCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCodec<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for BincodeCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BincodeCodec")
    }
}

impl<T: Serialize + DeserializeOwned> Codec for BincodeCodec<T> {
    type Item = T;

    fn encode(&self, item: &T, sink: &mut BytesMut) -> Result<()> {
        bincode::serialize_into(sink.writer(), item)
            .map_err(|e| HeapError::Serialization(e.to_string()))
    }

    fn decode(&self, source: &mut Source<'_>) -> Result<T> {
        bincode::deserialize_from(source).map_err(|e| HeapError::Serialization(e.to_string()))
    }
}
