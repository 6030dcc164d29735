//! Wire primitives
//!
//! Reading side: [`WireReader`] is a cursor over buffered bytes. Every primitive either
//! returns a value and advances, or returns [`DecodeError::Incomplete`] and leaves the
//! cursor where it was. [`WireBuffer`] wraps the connection's `BytesMut` and releases bytes
//! only after a whole field group has been read (the "mark").
//!
//! Writing side: [`WireWrite`] adds the protocol encodings to any `BufMut`.
//!
//! ## Encodings
//! ```text
//! vint / vlong   7 bits per byte, least significant group first, high bit = more
//! signed vint    zig-zag mapped onto vint
//! ranged bytes   vint length + bytes
//! string         ranged bytes holding UTF-8
//! u16/i32/i64    fixed width, big endian
//! ```

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{DecodeError, DecodeResult};

/// Length limits applied while reading
#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    pub max_ranged_bytes: usize,
    pub max_string: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        Self {
            max_ranged_bytes: crate::config::DEFAULT_MAX_RANGED_BYTES,
            max_string: crate::config::DEFAULT_MAX_RANGED_BYTES,
        }
    }
}

// =============================================================================
// WireReader
// =============================================================================

/// Cursor over a borrowed byte slice
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
    limits: ReadLimits,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], limits: ReadLimits) -> Self {
        Self { buf, pos: 0, limits }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn limits(&self) -> ReadLimits {
        self.limits
    }

    pub fn read_u8(&mut self) -> DecodeResult<u8> {
        match self.buf.get(self.pos) {
            Some(&b) => {
                self.pos += 1;
                Ok(b)
            }
            None => Err(DecodeError::Incomplete),
        }
    }

    pub fn read_bool(&mut self) -> DecodeResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    fn read_fixed<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        if self.remaining() < N {
            return Err(DecodeError::Incomplete);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn read_u16(&mut self) -> DecodeResult<u16> {
        self.read_fixed::<2>().map(u16::from_be_bytes)
    }

    pub fn read_i32(&mut self) -> DecodeResult<i32> {
        self.read_fixed::<4>().map(i32::from_be_bytes)
    }

    pub fn read_i64(&mut self) -> DecodeResult<i64> {
        self.read_fixed::<8>().map(i64::from_be_bytes)
    }

    /// Variable length unsigned value of at most `max_bytes` groups
    fn read_var(&mut self, max_bytes: usize) -> DecodeResult<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        let mut idx = self.pos;
        for _ in 0..max_bytes {
            let b = *self.buf.get(idx).ok_or(DecodeError::Incomplete)?;
            idx += 1;
            result |= u64::from(b & 0x7F) << shift;
            if b & 0x80 == 0 {
                self.pos = idx;
                return Ok(result);
            }
            shift += 7;
        }
        Err(DecodeError::Malformed(format!(
            "variable length value longer than {} bytes",
            max_bytes
        )))
    }

    /// Unsigned vint; bits beyond 32 are dropped
    pub fn read_vint(&mut self) -> DecodeResult<u32> {
        self.read_var(5).map(|v| v as u32)
    }

    /// Vint reinterpreted as a signed 32-bit value (two's complement)
    pub fn read_vint_i32(&mut self) -> DecodeResult<i32> {
        self.read_vint().map(|v| v as i32)
    }

    pub fn read_vlong(&mut self) -> DecodeResult<u64> {
        self.read_var(10)
    }

    /// Zig-zag encoded signed vint
    pub fn read_signed_vint(&mut self) -> DecodeResult<i32> {
        let raw = self.read_vint()?;
        Ok(((raw >> 1) as i32) ^ -((raw & 1) as i32))
    }

    /// Exactly `len` raw bytes
    pub fn read_slice(&mut self, len: usize) -> DecodeResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(DecodeError::Incomplete);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn read_length(&mut self, what: &'static str, max: usize) -> DecodeResult<usize> {
        let len = self.read_vint()? as usize;
        if len > max {
            return Err(DecodeError::LimitExceeded { what, len, max });
        }
        Ok(len)
    }

    /// vint length + bytes
    pub fn read_ranged_bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let start = self.pos;
        let len = self.read_length("byte array", self.limits.max_ranged_bytes)?;
        match self.read_slice(len) {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(e) => {
                self.pos = start;
                Err(e)
            }
        }
    }

    /// Ranged bytes where a zero length means "absent"
    pub fn read_optional_ranged_bytes(&mut self) -> DecodeResult<Option<Vec<u8>>> {
        let bytes = self.read_ranged_bytes()?;
        Ok(if bytes.is_empty() { None } else { Some(bytes) })
    }

    /// Ranged bytes with the string limit applied
    pub fn read_string(&mut self) -> DecodeResult<String> {
        self.read_limited_string("string", self.limits.max_string)
    }

    pub fn read_limited_string(&mut self, what: &'static str, max: usize) -> DecodeResult<String> {
        let start = self.pos;
        let len = self.read_length(what, max)?;
        let bytes = match self.read_slice(len) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.pos = start;
                return Err(e);
            }
        };
        String::from_utf8(bytes.to_vec())
            .map_err(|_| DecodeError::Malformed(format!("{} is not valid UTF-8", what)))
    }

    /// String where a zero length means "absent"
    pub fn read_optional_string(&mut self) -> DecodeResult<Option<String>> {
        let s = self.read_string()?;
        Ok(if s.is_empty() { None } else { Some(s) })
    }
}

// =============================================================================
// WireBuffer
// =============================================================================

/// A connection buffer that releases bytes one field group at a time
pub struct WireBuffer<'a> {
    buf: &'a mut BytesMut,
    limits: ReadLimits,
}

impl<'a> WireBuffer<'a> {
    pub fn new(buf: &'a mut BytesMut, limits: ReadLimits) -> Self {
        Self { buf, limits }
    }

    /// Run `f` against the buffered bytes; on success consume what it read
    ///
    /// If `f` fails nothing is consumed, so an incomplete group is retried from its
    /// first byte once more data arrives.
    pub fn read<T>(&mut self, f: impl FnOnce(&mut WireReader<'_>) -> DecodeResult<T>) -> DecodeResult<T> {
        let mut reader = WireReader::new(&self.buf[..], self.limits);
        let value = f(&mut reader)?;
        let consumed = reader.position();
        self.buf.advance(consumed);
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

// =============================================================================
// WireWrite
// =============================================================================

/// Protocol encodings on top of `BufMut`
pub trait WireWrite: BufMut {
    fn put_vint(&mut self, value: u32) {
        self.put_vlong(u64::from(value));
    }

    fn put_vlong(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.put_u8((value as u8 & 0x7F) | 0x80);
            value >>= 7;
        }
        self.put_u8(value as u8);
    }

    fn put_signed_vint(&mut self, value: i32) {
        self.put_vint(((value << 1) ^ (value >> 31)) as u32);
    }

    fn put_ranged_bytes(&mut self, bytes: &[u8]) {
        self.put_vint(bytes.len() as u32);
        self.put_slice(bytes);
    }

    /// Absent values are written as a zero length
    fn put_optional_ranged_bytes(&mut self, bytes: Option<&[u8]>) {
        self.put_ranged_bytes(bytes.unwrap_or(&[]));
    }

    fn put_string(&mut self, value: &str) {
        self.put_ranged_bytes(value.as_bytes());
    }
}

impl<B: BufMut> WireWrite for B {}
