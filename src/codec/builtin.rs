//! Codecs for primitive key and value types.

use bytes::{BufMut, BytesMut};

use super::{Codec, Source};
use crate::error::{HeapError, Result};

/// 32-bit signed integers, big-endian
///
/// Big-endian keeps byte order equal to numeric order for non-negative keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct I32Codec;

impl Codec for I32Codec {
    type Item = i32;

    fn encode(&self, item: &i32, sink: &mut BytesMut) -> Result<()> {
        sink.put_i32(*item);
        Ok(())
    }

    fn decode(&self, source: &mut Source<'_>) -> Result<i32> {
        source.read_i32_be()
    }
}

/// UTF-8 strings with a u32 length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct StringCodec;

impl Codec for StringCodec {
    type Item = String;

    fn encode(&self, item: &String, sink: &mut BytesMut) -> Result<()> {
        put_prefixed(sink, item.as_bytes())
    }

    fn decode(&self, source: &mut Source<'_>) -> Result<String> {
        source.read_utf().map(str::to_owned)
    }
}

/// Raw byte vectors with a u32 length prefix
#[derive(Debug, Clone, Copy, Default)]
pub struct BytesCodec;

impl Codec for BytesCodec {
    type Item = Vec<u8>;

    fn encode(&self, item: &Vec<u8>, sink: &mut BytesMut) -> Result<()> {
        put_prefixed(sink, item)
    }

    fn decode(&self, source: &mut Source<'_>) -> Result<Vec<u8>> {
        source.read_prefixed().map(<[u8]>::to_vec)
    }
}

fn put_prefixed(sink: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    let len = u32::try_from(bytes.len()).map_err(|_| {
        HeapError::Serialization(format!("{} bytes exceed a 32-bit length prefix", bytes.len()))
    })?;
    sink.reserve(4 + bytes.len());
    sink.put_u32_le(len);
    sink.put_slice(bytes);
    Ok(())
}
