//! Primitive representations.
//!
//! N-bit prefix integers and length-prefixed strings:
//!
//! ```not_rust
//!   0   1   2   3   4   5   6   7
//! +---+---+---+---+---+---+---+---+
//! | ? | ? | ? |       Value       |
//! +---+---+---+-------------------+
//! | 1 |    Value-(2^N-1) LSB      |
//! +---+---------------------------+
//!                ...
//! +---+---------------------------+
//! | 0 |    Value-(2^N-1) MSB      |
//! +---+---------------------------+
//! ```
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::huffman;
use super::HpackError;

/// Decoded values never need to exceed this; larger is treated as an
/// attack on the decoder.
const MAX_INT: usize = 1 << 24;

/// Decodes an integer whose prefix bits were already consumed from
/// `prefix_value` (masked to the N-bit prefix maximum `max`).
pub(super) fn decode(
    prefix_value: u8,
    max: u8,
    bytes: &mut Bytes,
) -> Result<usize, HpackError> {
    let value = (prefix_value & max) as usize;
    if value < max as usize {
        return Ok(value);
    }

    let mut value = value;
    let mut shift = 0u32;
    loop {
        if !bytes.has_remaining() {
            return Err(HpackError::Incomplete);
        }
        let byte = bytes.get_u8();
        value += ((byte & 127) as usize) << shift;
        shift += 7;
        if value > MAX_INT {
            return Err(HpackError::IntegerOverflow);
        }
        if byte & 128 == 0 {
            return Ok(value);
        }
    }
}

/// Encodes `value` into a representation whose first byte carries `repr`
/// in the bits above the N-bit prefix `max`.
pub(super) fn encode(value: usize, max: u8, repr: u8, out: &mut BytesMut) {
    if value < max as usize {
        out.put_u8(repr | value as u8);
        return;
    }
    out.put_u8(repr | max);
    let mut value = value - max as usize;
    while value > 127 {
        out.put_u8(value as u8 | 128);
        value >>= 7;
    }
    out.put_u8(value as u8);
}

/// Decodes a length-prefixed string, Huffman-decoding when flagged.
pub(super) fn decode_string(bytes: &mut Bytes) -> Result<Bytes, HpackError> {
    if !bytes.has_remaining() {
        return Err(HpackError::Incomplete);
    }
    let prefix = bytes.get_u8();
    let huffman_coded = prefix & 128 != 0;
    let len = decode(prefix, 127, bytes)?;
    if bytes.remaining() < len {
        return Err(HpackError::Incomplete);
    }
    let raw = bytes.split_to(len);
    if huffman_coded {
        let mut out = BytesMut::with_capacity(raw.len() * 2);
        huffman::decode(&raw, &mut out)?;
        Ok(out.freeze())
    } else {
        Ok(raw)
    }
}

/// Encodes a string literal without Huffman coding.
pub(super) fn encode_string(value: &[u8], out: &mut BytesMut) {
    encode(value.len(), 127, 0, out);
    out.put_slice(value);
}

// ===== Test =====
