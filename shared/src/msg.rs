//! Byte-buffer codec shared by the server and the test client.
//!
//! Every multi-byte value is written little-endian, so the wire format does not
//! depend on the host. Readers never index past the end of their slice: a short
//! buffer surfaces as [`CodecError::Truncated`]. Writers are created with a fixed
//! capacity and refuse to grow past it.

use crate::{BIG_INFO_STRING, MAX_STRING_CHARS};
use thiserror::Error;

/// Failures raised while encoding or decoding a message
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("read past end of message: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("message overflow: {need} bytes requested, {remaining} remaining")]
    Overflow { need: usize, remaining: usize },

    #[error("string of {len} bytes exceeds limit of {max}")]
    StringTooLong { len: usize, max: usize },

    #[error("entity number {0} out of range")]
    EntityNumber(u16),

    #[error("unknown op code {0}")]
    UnknownOp(u8),
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Bounded output buffer
#[derive(Debug, Clone)]
pub struct MsgWriter {
    buf: Vec<u8>,
    capacity: usize,
}

impl MsgWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn reserve(&self, need: usize) -> Result<()> {
        if need > self.remaining() {
            return Err(CodecError::Overflow {
                need,
                remaining: self.remaining(),
            });
        }
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?;
        self.buf.push(value);
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_u8(value as u8)
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i16(&mut self, value: i16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        self.reserve(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Writes a u16 length prefix followed by the raw bytes of `value`
    pub fn write_string_capped(&mut self, value: &str, max: usize) -> Result<()> {
        let bytes = value.as_bytes();
        if bytes.len() > max || bytes.len() > u16::MAX as usize {
            return Err(CodecError::StringTooLong {
                len: bytes.len(),
                max,
            });
        }
        self.reserve(2 + bytes.len())?;
        self.write_u16(bytes.len() as u16)?;
        self.write_bytes(bytes)
    }

    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_string_capped(value, MAX_STRING_CHARS)
    }

    pub fn write_big_string(&mut self, value: &str) -> Result<()> {
        self.write_string_capped(value, BIG_INFO_STRING)
    }
}

/// Cursor over a received message
#[derive(Debug, Clone)]
pub struct MsgReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> MsgReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    /// Bytes not yet consumed
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(CodecError::Truncated {
                need: len,
                have: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    /// Reads a length-prefixed string, rejecting declared lengths above `max`.
    ///
    /// Invalid UTF-8 is replaced rather than rejected; peers are free to send
    /// arbitrary bytes in names and chat and the sanitisers downstream deal with them.
    pub fn read_string_capped(&mut self, max: usize) -> Result<String> {
        let len = self.read_u16()? as usize;
        if len > max {
            return Err(CodecError::StringTooLong { len, max });
        }
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    pub fn read_string(&mut self) -> Result<String> {
        self.read_string_capped(MAX_STRING_CHARS)
    }

    pub fn read_big_string(&mut self) -> Result<String> {
        self.read_string_capped(BIG_INFO_STRING)
    }
}
