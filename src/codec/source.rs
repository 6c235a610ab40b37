//! Bounded byte cursor used by decoders.

use std::io;

use crate::error::{HeapError, Result};

/// Read cursor over a borrowed byte slice
///
/// Every read is checked against the remaining length; running off the end
/// is a `Decode` error rather than a panic.
#[derive(Debug, Clone)]
pub struct Source<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Source<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Take the next `n` bytes
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let avail = self.remaining();
        if n > avail {
            return Err(HeapError::Decode(format!(
                "Requested {} but there's only {} remaining",
                n, avail
            )));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Skip `n` bytes
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.read_bytes(n).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_le(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32_be(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64_le(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    /// Read a u32 LE length prefix followed by that many bytes
    pub fn read_prefixed(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32_le()? as usize;
        self.read_bytes(len)
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_utf(&mut self) -> Result<&'a str> {
        let bytes = self.read_prefixed()?;
        std::str::from_utf8(bytes).map_err(|e| HeapError::Decode(format!("Invalid UTF-8: {}", e)))
    }
}

impl io::Read for Source<'_> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let n = out.len().min(self.remaining());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
