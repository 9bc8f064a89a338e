/*
    wire.rs - Shared binary codec helpers

    Every binary format in the crate (feed messages, timeframes, credentials,
    envelopes, teleport control frames, replication messages) is written with
    the helpers in this file:

    - put_varint / WireReader::read_varint : unsigned LEB128
    - WireReader                           : bounds-checked cursor over a slice

    Decoders never panic on hostile input; they return DecodeError.
*/

use thiserror::Error;

use crate::core_identity::{PublicKey, Signature};

/// Errors produced while decoding any wire format
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input: needed {needed} more bytes")]
    UnexpectedEof { needed: usize },

    #[error("varint exceeds 64 bits")]
    VarintOverflow,

    #[error("unknown {what} tag {tag:#04x}")]
    UnknownTag { what: &'static str, tag: u8 },

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    #[error("invalid encoding: {0}")]
    Invalid(String),
}

/// Append `value` as an unsigned LEB128 varint.
pub fn put_varint(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Bounds-checked reader over a borrowed byte slice
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof {
                needed: len - self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_varint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift == 63 && byte > 1 {
                return Err(DecodeError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
            if shift > 63 {
                return Err(DecodeError::VarintOverflow);
            }
        }
    }

    pub fn read_key(&mut self) -> Result<PublicKey, DecodeError> {
        Ok(PublicKey::from_bytes(self.read_array()?))
    }

    pub fn read_signature(&mut self) -> Result<Signature, DecodeError> {
        Ok(Signature::from_bytes(self.read_array()?))
    }

    /// Length-prefixed (u32 BE) byte string, capped at `max`.
    pub fn read_len_prefixed(&mut self, max: usize) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32()? as usize;
        if len > max {
            return Err(DecodeError::Invalid(format!(
                "length {} exceeds limit {}",
                len, max
            )));
        }
        self.read_bytes(len)
    }

    /// Fails if any input is left over.
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
