//! Little-endian binary codec for the byte-exact persisted and wire formats.
//!
//! Serialized forms written through this module end up in stored records and
//! in trie proofs, so every encoder here must stay byte-stable.

use thiserror::Error;

use super::hash::{Hash160, Hash256, HashError};

/// Upper bound for a single var-length byte string; anything larger is a
/// corrupt record, not a legitimate value.
pub const MAX_VAR_BYTES: u64 = 0x0200_0000;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("declared length {0} exceeds the limit")]
    TooLarge(u64),
    #[error("trailing {0} bytes after decoding")]
    TrailingBytes(usize),
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error(transparent)]
    Hash(#[from] HashError),
}

/// Growable little-endian writer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_u64_le(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_i64_le(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn write_hash256(&mut self, h: &Hash256) {
        self.buf.extend_from_slice(h.as_bytes());
    }

    pub fn write_hash160(&mut self, h: &Hash160) {
        self.buf.extend_from_slice(h.as_bytes());
    }

    /// Bitcoin-style compact integer.
    pub fn write_var_uint(&mut self, v: u64) {
        if v < 0xfd {
            self.buf.push(v as u8);
        } else if v <= u16::MAX as u64 {
            self.buf.push(0xfd);
            self.write_u16_le(v as u16);
        } else if v <= u32::MAX as u64 {
            self.buf.push(0xfe);
            self.write_u32_le(v as u32);
        } else {
            self.buf.push(0xff);
            self.write_u64_le(v);
        }
    }

    pub fn write_var_bytes(&mut self, data: &[u8]) {
        self.write_var_uint(data.len() as u64);
        self.write_bytes(data);
    }

    pub fn write_var_string(&mut self, s: &str) {
        self.write_var_bytes(s.as_bytes());
    }
}

/// Cursor over a byte slice with the matching read operations.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Fails unless every input byte was consumed.
    pub fn ensure_exhausted(&self) -> Result<(), CodecError> {
        if self.is_exhausted() {
            Ok(())
        } else {
            Err(CodecError::TrailingBytes(self.remaining()))
        }
    }

    pub fn read_exact(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::UnexpectedEof);
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.read_exact(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16, CodecError> {
        let b = self.read_exact(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32_le(&mut self) -> Result<u32, CodecError> {
        let b = self.read_exact(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64, CodecError> {
        let b = self.read_exact(8)?;
        let mut a = [0u8; 8];
        a.copy_from_slice(b);
        Ok(u64::from_le_bytes(a))
    }

    pub fn read_i64_le(&mut self) -> Result<i64, CodecError> {
        Ok(self.read_u64_le()? as i64)
    }

    pub fn read_hash256(&mut self) -> Result<Hash256, CodecError> {
        Ok(Hash256::from_slice(self.read_exact(Hash256::SIZE)?)?)
    }

    pub fn read_hash160(&mut self) -> Result<Hash160, CodecError> {
        Ok(Hash160::from_slice(self.read_exact(Hash160::SIZE)?)?)
    }

    pub fn read_var_uint(&mut self) -> Result<u64, CodecError> {
        let first = self.read_u8()?;
        Ok(match first {
            0xfd => self.read_u16_le()? as u64,
            0xfe => self.read_u32_le()? as u64,
            0xff => self.read_u64_le()?,
            v => v as u64,
        })
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        self.read_var_bytes_max(MAX_VAR_BYTES)
    }

    pub fn read_var_bytes_max(&mut self, max: u64) -> Result<Vec<u8>, CodecError> {
        let len = self.read_var_uint()?;
        if len > max {
            return Err(CodecError::TooLarge(len));
        }
        Ok(self.read_exact(len as usize)?.to_vec())
    }

    pub fn read_var_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.read_var_bytes()?;
        String::from_utf8(bytes).map_err(|e| CodecError::InvalidValue(e.to_string()))
    }
}
