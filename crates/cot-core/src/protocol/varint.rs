//! Base-128 varints as used by protobuf.
//!
//! Each byte carries seven bits of the value, least significant group first;
//! the high bit is set on every byte except the last.  A `u64` needs at most
//! ten bytes.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Longest valid encoding of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum VarintError {
    /// Input ended before the terminating byte.
    #[error("varint truncated")]
    Truncated,
    /// More than ten bytes, or bits beyond 64.
    #[error("varint overflows 64 bits")]
    Overflow,
}

/// Appends the varint encoding of `value` to `buf`.
pub fn encode_varint(mut value: u64, buf: &mut impl BufMut) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Number of bytes [`encode_varint`] writes for `value`.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Reads one varint from the front of `buf`, advancing it.
///
/// # Errors
///
/// Returns [`VarintError`] when the buffer ends early or the value overflows.
pub fn decode_varint(buf: &mut impl Buf) -> Result<u64, VarintError> {
    let mut decoder = VarintDecoder::default();
    while buf.has_remaining() {
        if let Some(value) = decoder.push(buf.get_u8())? {
            return Ok(value);
        }
    }
    Err(VarintError::Truncated)
}

/// Incremental decoder fed one byte at a time; used by the stream reader
/// where bytes arrive asynchronously.
#[derive(Debug, Default)]
pub struct VarintDecoder {
    value: u64,
    count: usize,
}

impl VarintDecoder {
    /// Feeds one byte.  Returns the value once the terminating byte arrives.
    ///
    /// # Errors
    ///
    /// Returns [`VarintError::Overflow`] past the tenth byte or when the
    /// tenth byte carries more than the single remaining bit.
    pub fn push(&mut self, byte: u8) -> Result<Option<u64>, VarintError> {
        if self.count == MAX_VARINT_LEN - 1 && byte > 1 {
            return Err(VarintError::Overflow);
        }
        self.value |= u64::from(byte & 0x7F) << (7 * self.count);
        self.count += 1;
        if byte & 0x80 == 0 {
            return Ok(Some(self.value));
        }
        if self.count == MAX_VARINT_LEN {
            return Err(VarintError::Overflow);
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(value: u64) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_varint(value, &mut buf);
        buf
    }

    #[test]
    fn test_known_encodings() {
        assert_eq!(encode(0), [0x00]);
        assert_eq!(encode(1), [0x01]);
        assert_eq!(encode(127), [0x7F]);
        assert_eq!(encode(128), [0x80, 0x01]);
        assert_eq!(encode(300), [0xAC, 0x02]);
    }

    #[test]
    fn test_boundary_values_decode() {
        for value in [0, 127, 128, 16_383, 16_384, u64::from(u32::MAX), u64::MAX] {
            let bytes = encode(value);
            assert_eq!(bytes.len(), encoded_len(value), "length of {value}");
            assert_eq!(decode_varint(&mut bytes.as_slice()), Ok(value));
        }
    }

    #[test]
    fn test_u64_max_is_ten_bytes() {
        assert_eq!(encode(u64::MAX).len(), MAX_VARINT_LEN);
    }

    #[test]
    fn test_truncated() {
        assert_eq!(
            decode_varint(&mut [0x80u8, 0x80].as_slice()),
            Err(VarintError::Truncated)
        );
    }

    #[test]
    fn test_overflow_on_eleven_bytes() {
        let bytes = [0xFFu8; 11];
        assert_eq!(
            decode_varint(&mut bytes.as_slice()),
            Err(VarintError::Overflow)
        );
    }

    #[test]
    fn test_decode_advances_buffer() {
        let bytes = [0xAC, 0x02, 0x05];
        let mut slice = &bytes[..];
        assert_eq!(decode_varint(&mut slice), Ok(300));
        assert_eq!(slice, [0x05]);
    }
}
