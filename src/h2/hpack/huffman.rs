//! Huffman coding for string literals.
//!
//! The canonical code of RFC 7541 Appendix B. Decoding walks a binary
//! tree built once from the code table; trailing padding must be the
//! most-significant bits of EOS and shorter than a byte.
use std::sync::OnceLock;

use bytes::{BufMut, BytesMut};

use super::HpackError;

/// `(bit length, code)` per symbol, EOS last.
const CODES: [(u8, u32); 257] = [
    (13, 0x1ff8),
    (23, 0x7fffd8),
    (28, 0xfffffe2),
    (28, 0xfffffe3),
    (28, 0xfffffe4),
    (28, 0xfffffe5),
    (28, 0xfffffe6),
    (28, 0xfffffe7),
    (28, 0xfffffe8),
    (24, 0xffffea),
    (30, 0x3ffffffc),
    (28, 0xfffffe9),
    (28, 0xfffffea),
    (30, 0x3ffffffd),
    (28, 0xfffffeb),
    (28, 0xfffffec),
    (28, 0xfffffed),
    (28, 0xfffffee),
    (28, 0xfffffef),
    (28, 0xffffff0),
    (28, 0xffffff1),
    (28, 0xffffff2),
    (30, 0x3ffffffe),
    (28, 0xffffff3),
    (28, 0xffffff4),
    (28, 0xffffff5),
    (28, 0xffffff6),
    (28, 0xffffff7),
    (28, 0xffffff8),
    (28, 0xffffff9),
    (28, 0xffffffa),
    (28, 0xffffffb),
    (6, 0x14),
    (10, 0x3f8),
    (10, 0x3f9),
    (12, 0xffa),
    (13, 0x1ff9),
    (6, 0x15),
    (8, 0xf8),
    (11, 0x7fa),
    (10, 0x3fa),
    (10, 0x3fb),
    (8, 0xf9),
    (11, 0x7fb),
    (8, 0xfa),
    (6, 0x16),
    (6, 0x17),
    (6, 0x18),
    (5, 0x0),
    (5, 0x1),
    (5, 0x2),
    (6, 0x19),
    (6, 0x1a),
    (6, 0x1b),
    (6, 0x1c),
    (6, 0x1d),
    (6, 0x1e),
    (6, 0x1f),
    (7, 0x5c),
    (8, 0xfb),
    (15, 0x7ffc),
    (6, 0x20),
    (12, 0xffb),
    (10, 0x3fc),
    (13, 0x1ffa),
    (6, 0x21),
    (7, 0x5d),
    (7, 0x5e),
    (7, 0x5f),
    (7, 0x60),
    (7, 0x61),
    (7, 0x62),
    (7, 0x63),
    (7, 0x64),
    (7, 0x65),
    (7, 0x66),
    (7, 0x67),
    (7, 0x68),
    (7, 0x69),
    (7, 0x6a),
    (7, 0x6b),
    (7, 0x6c),
    (7, 0x6d),
    (7, 0x6e),
    (7, 0x6f),
    (7, 0x70),
    (7, 0x71),
    (7, 0x72),
    (8, 0xfc),
    (7, 0x73),
    (8, 0xfd),
    (13, 0x1ffb),
    (19, 0x7fff0),
    (13, 0x1ffc),
    (14, 0x3ffc),
    (6, 0x22),
    (15, 0x7ffd),
    (5, 0x3),
    (6, 0x23),
    (5, 0x4),
    (6, 0x24),
    (5, 0x5),
    (6, 0x25),
    (6, 0x26),
    (6, 0x27),
    (5, 0x6),
    (7, 0x74),
    (7, 0x75),
    (6, 0x28),
    (6, 0x29),
    (6, 0x2a),
    (5, 0x7),
    (6, 0x2b),
    (7, 0x76),
    (6, 0x2c),
    (5, 0x8),
    (5, 0x9),
    (6, 0x2d),
    (7, 0x77),
    (7, 0x78),
    (7, 0x79),
    (7, 0x7a),
    (7, 0x7b),
    (15, 0x7ffe),
    (11, 0x7fc),
    (14, 0x3ffd),
    (13, 0x1ffd),
    (28, 0xffffffc),
    (20, 0xfffe6),
    (22, 0x3fffd2),
    (20, 0xfffe7),
    (20, 0xfffe8),
    (22, 0x3fffd3),
    (22, 0x3fffd4),
    (22, 0x3fffd5),
    (23, 0x7fffd9),
    (22, 0x3fffd6),
    (23, 0x7fffda),
    (23, 0x7fffdb),
    (23, 0x7fffdc),
    (23, 0x7fffdd),
    (23, 0x7fffde),
    (24, 0xffffeb),
    (23, 0x7fffdf),
    (24, 0xffffec),
    (24, 0xffffed),
    (22, 0x3fffd7),
    (23, 0x7fffe0),
    (24, 0xffffee),
    (23, 0x7fffe1),
    (23, 0x7fffe2),
    (23, 0x7fffe3),
    (23, 0x7fffe4),
    (21, 0x1fffdc),
    (22, 0x3fffd8),
    (23, 0x7fffe5),
    (22, 0x3fffd9),
    (23, 0x7fffe6),
    (23, 0x7fffe7),
    (24, 0xffffef),
    (22, 0x3fffda),
    (21, 0x1fffdd),
    (20, 0xfffe9),
    (22, 0x3fffdb),
    (22, 0x3fffdc),
    (23, 0x7fffe8),
    (23, 0x7fffe9),
    (21, 0x1fffde),
    (23, 0x7fffea),
    (22, 0x3fffdd),
    (22, 0x3fffde),
    (24, 0xfffff0),
    (21, 0x1fffdf),
    (22, 0x3fffdf),
    (23, 0x7fffeb),
    (23, 0x7fffec),
    (21, 0x1fffe0),
    (21, 0x1fffe1),
    (22, 0x3fffe0),
    (21, 0x1fffe2),
    (23, 0x7fffed),
    (22, 0x3fffe1),
    (23, 0x7fffee),
    (23, 0x7fffef),
    (20, 0xfffea),
    (22, 0x3fffe2),
    (22, 0x3fffe3),
    (22, 0x3fffe4),
    (23, 0x7ffff0),
    (22, 0x3fffe5),
    (22, 0x3fffe6),
    (23, 0x7ffff1),
    (26, 0x3ffffe0),
    (26, 0x3ffffe1),
    (20, 0xfffeb),
    (19, 0x7fff1),
    (22, 0x3fffe7),
    (23, 0x7ffff2),
    (22, 0x3fffe8),
    (25, 0x1ffffec),
    (26, 0x3ffffe2),
    (26, 0x3ffffe3),
    (26, 0x3ffffe4),
    (27, 0x7ffffde),
    (27, 0x7ffffdf),
    (26, 0x3ffffe5),
    (24, 0xfffff1),
    (25, 0x1ffffed),
    (19, 0x7fff2),
    (21, 0x1fffe3),
    (26, 0x3ffffe6),
    (27, 0x7ffffe0),
    (27, 0x7ffffe1),
    (26, 0x3ffffe7),
    (27, 0x7ffffe2),
    (24, 0xfffff2),
    (21, 0x1fffe4),
    (21, 0x1fffe5),
    (26, 0x3ffffe8),
    (26, 0x3ffffe9),
    (28, 0xffffffd),
    (27, 0x7ffffe3),
    (27, 0x7ffffe4),
    (27, 0x7ffffe5),
    (20, 0xfffec),
    (24, 0xfffff3),
    (20, 0xfffed),
    (21, 0x1fffe6),
    (22, 0x3fffe9),
    (21, 0x1fffe7),
    (21, 0x1fffe8),
    (23, 0x7ffff3),
    (22, 0x3fffea),
    (22, 0x3fffeb),
    (25, 0x1ffffee),
    (25, 0x1ffffef),
    (24, 0xfffff4),
    (24, 0xfffff5),
    (26, 0x3ffffea),
    (23, 0x7ffff4),
    (26, 0x3ffffeb),
    (27, 0x7ffffe6),
    (26, 0x3ffffec),
    (26, 0x3ffffed),
    (27, 0x7ffffe7),
    (27, 0x7ffffe8),
    (27, 0x7ffffe9),
    (27, 0x7ffffea),
    (27, 0x7ffffeb),
    (28, 0xffffffe),
    (27, 0x7ffffec),
    (27, 0x7ffffed),
    (27, 0x7ffffee),
    (27, 0x7ffffef),
    (27, 0x7fffff0),
    (26, 0x3ffffee),
    (30, 0x3fffffff),
];

const EOS: u16 = 256;

#[derive(Clone, Copy)]
struct Node {
    /// Child node indexes for bits 0 and 1; 0 means absent.
    children: [u32; 2],
    /// Decoded symbol at a leaf; EOS marks the error leaf.
    symbol: Option<u16>,
}

const EMPTY: Node = Node { children: [0, 0], symbol: None };

fn tree() -> &'static Vec<Node> {
    static TREE: OnceLock<Vec<Node>> = OnceLock::new();
    TREE.get_or_init(|| {
        let mut nodes = vec![EMPTY];
        for (symbol, &(len, code)) in CODES.iter().enumerate() {
            let mut at = 0usize;
            for depth in (0..len).rev() {
                let bit = ((code >> depth) & 1) as usize;
                if nodes[at].children[bit] == 0 {
                    nodes.push(EMPTY);
                    let next = (nodes.len() - 1) as u32;
                    nodes[at].children[bit] = next;
                }
                at = nodes[at].children[bit] as usize;
            }
            debug_assert!(nodes[at].symbol.is_none(), "huffman code collision");
            nodes[at].symbol = Some(symbol as u16);
        }
        nodes
    })
}

/// Decodes a Huffman-coded string into `out`.
pub(super) fn decode(bytes: &[u8], out: &mut BytesMut) -> Result<(), HpackError> {
    let tree = tree();
    let mut at = 0usize;
    let mut padding_ones = true;
    let mut depth = 0u8;

    for &byte in bytes {
        for shift in (0..8).rev() {
            let bit = ((byte >> shift) & 1) as usize;
            padding_ones &= bit == 1;
            depth += 1;

            let next = tree[at].children[bit];
            if next == 0 {
                return Err(HpackError::Huffman);
            }
            at = next as usize;

            if let Some(symbol) = tree[at].symbol {
                if symbol == EOS {
                    // EOS inside a string is a coding error
                    return Err(HpackError::Huffman);
                }
                out.put_u8(symbol as u8);
                at = 0;
                padding_ones = true;
                depth = 0;
            }
        }
    }

    // padding must be a strict prefix of EOS, under one byte long
    if depth >= 8 || !padding_ones {
        return Err(HpackError::Huffman);
    }
    Ok(())
}

/// Encodes `bytes` with the canonical code.
pub(super) fn encode(bytes: &[u8], out: &mut BytesMut) {
    let mut acc: u64 = 0;
    let mut bits: u8 = 0;

    for &byte in bytes {
        let (len, code) = CODES[byte as usize];
        acc = (acc << len) | code as u64;
        bits += len;
        while bits >= 8 {
            bits -= 8;
            out.put_u8((acc >> bits) as u8);
        }
    }
    if bits > 0 {
        // pad with the high bits of EOS
        out.put_u8(((acc << (8 - bits)) as u8) | (0xff >> bits));
    }
}

/// Encoded bit length in whole bytes.
pub(super) fn encoded_len(bytes: &[u8]) -> usize {
    let bits: usize = bytes.iter().map(|&b| CODES[b as usize].0 as usize).sum();
    bits.div_ceil(8)
}

// ===== Test =====

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(text: &[u8]) {
        let mut coded = BytesMut::new();
        encode(text, &mut coded);
        assert_eq!(coded.len(), encoded_len(text));
        let mut decoded = BytesMut::new();
        decode(&coded, &mut decoded).unwrap();
        assert_eq!(decoded.as_ref(), text);
    }

    #[test]
    fn test_rfc_appendix_c_strings() {
        // C.4.1
        let mut coded = BytesMut::new();
        encode(b"www.example.com", &mut coded);
        assert_eq!(
            coded.as_ref(),
            &[0xf1, 0xe3, 0xc2, 0xe5, 0xf2, 0x3a, 0x6b, 0xa0, 0xab, 0x90, 0xf4, 0xff],
        );
        // C.4.2
        let mut coded = BytesMut::new();
        encode(b"no-cache", &mut coded);
        assert_eq!(coded.as_ref(), &[0xa8, 0xeb, 0x10, 0x64, 0x9c, 0xbf]);
        // C.6.1
        let mut coded = BytesMut::new();
        encode(b"302", &mut coded);
        assert_eq!(coded.as_ref(), &[0x64, 0x02]);
        let mut coded = BytesMut::new();
        encode(b"private", &mut coded);
        assert_eq!(coded.as_ref(), &[0xae, 0xc3, 0x77, 0x1a, 0x4b]);
    }

    #[test]
    fn test_roundtrip_all_byte_values() {
        roundtrip(b"");
        roundtrip(b"custom-key");
        roundtrip(b"custom-value");
        roundtrip(b"Mon, 21 Oct 2013 20:13:21 GMT");
        let all: Vec<u8> = (0u8..=255).collect();
        roundtrip(&all);
    }

    #[test]
    fn test_bad_padding() {
        // a 5-bit symbol followed by zero padding
        let mut decoded = BytesMut::new();
        assert_eq!(decode(&[0x00], &mut decoded), Err(HpackError::Huffman));
    }

    #[test]
    fn test_eos_rejected() {
        // 30 bits of EOS followed by ones
        let mut decoded = BytesMut::new();
        assert_eq!(
            decode(&[0xff, 0xff, 0xff, 0xff], &mut decoded),
            Err(HpackError::Huffman),
        );
    }
}
