//! Typed scalar read/write: big-endian integers and length-prefixed strings
//! and blobs.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::codec::CodecError;
use crate::types::attribute::Attribute;

/// Longest string accepted in any field.
pub const MAX_STRING_LEN: usize = 64 * 1024;

pub fn put_u32(buf: &mut BytesMut, v: u32) {
    buf.put_u32(v);
}

pub fn put_i32(buf: &mut BytesMut, v: i32) {
    buf.put_i32(v);
}

pub fn put_bytes(buf: &mut BytesMut, v: &[u8]) {
    buf.put_u32(v.len() as u32);
    buf.put_slice(v);
}

pub fn put_string(buf: &mut BytesMut, v: &str) {
    put_bytes(buf, v.as_bytes());
}

pub fn put_strings(buf: &mut BytesMut, v: &[String]) {
    buf.put_u32(v.len() as u32);
    for s in v {
        put_string(buf, s);
    }
}

pub fn put_attrs(buf: &mut BytesMut, attrs: &[Attribute]) {
    buf.put_u32(attrs.len() as u32);
    for a in attrs {
        put_string(buf, &a.name);
        put_string(buf, &a.resource);
        put_string(buf, &a.value);
    }
}

pub fn put_i32s(buf: &mut BytesMut, v: &[i32]) {
    for n in v {
        buf.put_i32(*n);
    }
}

/// A minimal decoder over one complete message body.
pub struct Decoder {
    from: Bytes,
}

impl Decoder {
    pub fn new(from: Bytes) -> Self {
        Self { from }
    }

    /// Asserts the body has been fully consumed, returning `result` if so.
    pub fn expect_done_and<R>(&self, result: R) -> Result<R, CodecError> {
        if self.from.is_empty() {
            Ok(result)
        } else {
            Err(CodecError::TrailingData(self.from.len()))
        }
    }

    pub fn expect_u32(&mut self) -> Result<u32, CodecError> {
        if self.from.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        Ok(self.from.get_u32())
    }

    pub fn expect_i32(&mut self) -> Result<i32, CodecError> {
        if self.from.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        Ok(self.from.get_i32())
    }

    /// A length-prefixed blob; the length is bounded by the body itself.
    pub fn expect_bytes(&mut self) -> Result<Bytes, CodecError> {
        let len = self.expect_u32()? as usize;
        if self.from.remaining() < len {
            return Err(CodecError::Truncated);
        }
        Ok(self.from.split_to(len))
    }

    pub fn expect_string(&mut self) -> Result<String, CodecError> {
        let len = self.expect_u32()? as usize;
        if len > MAX_STRING_LEN {
            return Err(CodecError::BadString);
        }
        if self.from.remaining() < len {
            return Err(CodecError::Truncated);
        }
        let raw = self.from.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::BadString)
    }

    /// A count of items that each take at least `min_item` bytes; a count the
    /// remaining body cannot possibly hold is a truncation.
    fn expect_count(&mut self, min_item: usize) -> Result<usize, CodecError> {
        let n = self.expect_u32()? as usize;
        if n.saturating_mul(min_item) > self.from.remaining() {
            return Err(CodecError::Truncated);
        }
        Ok(n)
    }

    pub fn expect_strings(&mut self) -> Result<Vec<String>, CodecError> {
        let n = self.expect_count(4)?;
        (0..n).map(|_| self.expect_string()).collect()
    }

    pub fn expect_attrs(&mut self) -> Result<Vec<Attribute>, CodecError> {
        let n = self.expect_count(12)?;
        (0..n)
            .map(|_| {
                Ok(Attribute {
                    name: self.expect_string()?,
                    resource: self.expect_string()?,
                    value: self.expect_string()?,
                })
            })
            .collect()
    }

    pub fn expect_i32s(&mut self, n: usize) -> Result<Vec<i32>, CodecError> {
        if n.saturating_mul(4) > self.from.remaining() {
            return Err(CodecError::Truncated);
        }
        (0..n).map(|_| self.expect_i32()).collect()
    }

    /// Row count of a resource query: four parallel `i32` arrays.
    pub fn expect_resource_count(&mut self) -> Result<usize, CodecError> {
        self.expect_count(16)
    }
}
