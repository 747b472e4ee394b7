//! Variable-length integer encoding and decoding
//!
//! This module implements the LEB128 encoding used by Protocol Buffers. Each byte carries
//! 7 bits of the value and 1 "continuation" bit that is set when more bytes follow.
//!
//! Only `u32` is supported: lengths on the wire never exceed it, and restricting the width keeps
//! the encoding identical across 32-bit and 64-bit targets.

use crate::Error;
use bytes::{Buf, BufMut};

const DATA_BITS_PER_BYTE: u32 = 7;
const DATA_BITS_MASK: u8 = 0x7F;
const CONTINUATION_BIT_MASK: u8 = 0x80;

/// Maximum number of bytes a `u32` can occupy once encoded.
pub const MAX_SIZE: usize = 5;

/// Encodes a `u32` as a varint.
pub fn write(value: u32, buf: &mut impl BufMut) {
    let mut val = value;
    while val >= u32::from(CONTINUATION_BIT_MASK) {
        buf.put_u8((val as u8 & DATA_BITS_MASK) | CONTINUATION_BIT_MASK);
        val >>= DATA_BITS_PER_BYTE;
    }
    buf.put_u8(val as u8);
}

/// Decodes a `u32` from a varint.
///
/// Rejects encodings that overflow 32 bits or that carry redundant trailing zero groups, so every
/// value has exactly one valid encoding.
pub fn read(buf: &mut impl Buf) -> Result<u32, Error> {
    let mut result: u32 = 0;
    for i in 0..MAX_SIZE {
        if !buf.has_remaining() {
            return Err(Error::EndOfBuffer);
        }
        let byte = buf.get_u8();
        let shift = DATA_BITS_PER_BYTE * i as u32;

        // The fifth byte may only contribute the top 4 bits of a u32.
        if i == MAX_SIZE - 1 && byte > 0x0F {
            return Err(Error::InvalidVarint);
        }
        result |= u32::from(byte & DATA_BITS_MASK) << shift;

        if byte & CONTINUATION_BIT_MASK == 0 {
            if i > 0 && byte == 0 {
                return Err(Error::InvalidVarint);
            }
            return Ok(result);
        }
    }
    Err(Error::InvalidVarint)
}

/// Calculates the number of bytes needed to encode a `u32` as a varint.
pub fn size(value: u32) -> usize {
    let data_bits = u32::BITS - value.leading_zeros();
    usize::max(1, data_bits.div_ceil(DATA_BITS_PER_BYTE) as usize)
}
