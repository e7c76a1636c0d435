//! Fixed-width binary codec for ids and query bytes.
//!
//! Ids are unsigned 64-bit big-endian. Percentages inside queries are
//! 4-byte IEEE floats in little-endian order, as produced by the client.

use std::fmt;

use crate::error::StoreError;

/// Width of one encoded id.
pub const ID_WIDTH: usize = 8;

#[inline]
pub fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn put_u8(buf: &mut Vec<u8>, value: u8) {
    buf.push(value);
}

#[inline]
pub fn put_f32(buf: &mut Vec<u8>, value: f32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Encode ids as a flat sequence of 8-byte big-endian values.
pub fn encode_ids<I: IntoIterator<Item = u64>>(ids: I) -> Vec<u8> {
    let iter = ids.into_iter();
    let mut buf = Vec::with_capacity(iter.size_hint().0 * ID_WIDTH);
    for id in iter {
        put_u64(&mut buf, id);
    }
    buf
}

/// Decode a flat id list. Fails unless the length is a multiple of 8.
pub fn decode_ids(bytes: &[u8]) -> Result<Vec<u64>, StoreError> {
    if bytes.len() % ID_WIDTH != 0 {
        return Err(StoreError::Malformed(format!(
            "input length {} is not a multiple of {}",
            bytes.len(),
            ID_WIDTH
        )));
    }
    Ok(bytes
        .chunks_exact(ID_WIDTH)
        .map(|chunk| {
            let mut raw = [0u8; ID_WIDTH];
            raw.copy_from_slice(chunk);
            u64::from_be_bytes(raw)
        })
        .collect())
}

/// Read past the end of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncated {
    pub offset: usize,
    pub needed: usize,
}

impl fmt::Display for Truncated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "truncated at byte {}: {} more bytes needed", self.offset, self.needed)
    }
}

impl From<Truncated> for StoreError {
    fn from(t: Truncated) -> Self {
        StoreError::Malformed(t.to_string())
    }
}

/// Forward-only cursor over an input buffer.
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Unconsumed tail of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.bytes[self.offset..]
    }

    pub fn peek_u8(&self) -> Option<u8> {
        self.bytes.get(self.offset).copied()
    }

    /// Consume `byte` if it is next.
    pub fn eat(&mut self, byte: u8) -> bool {
        if self.peek_u8() == Some(byte) {
            self.offset += 1;
            true
        } else {
            false
        }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], Truncated> {
        if self.remaining() < N {
            return Err(Truncated {
                offset: self.offset,
                needed: N - self.remaining(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.offset..self.offset + N]);
        self.offset += N;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, Truncated> {
        Ok(self.take::<1>()?[0])
    }

    /// Two raw bytes, used for query comparators.
    pub fn read_pair(&mut self) -> Result<[u8; 2], Truncated> {
        self.take::<2>()
    }

    pub fn read_u64(&mut self) -> Result<u64, Truncated> {
        Ok(u64::from_be_bytes(self.take::<8>()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, Truncated> {
        Ok(f32::from_le_bytes(self.take::<4>()?))
    }
}
