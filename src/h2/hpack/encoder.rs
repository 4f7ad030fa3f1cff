//! Field block encoding.
//!
//! The response side stays conservative: static-table name indexes where
//! available, literal values, no dynamic table, no Huffman on output.
use bytes::{Bytes, BytesMut};

use super::integer;
use super::table::STATIC_TABLE;

/// Indexed representations for the common response statuses.
fn status_index(status: u16) -> Option<u8> {
    Some(match status {
        200 => 8,
        204 => 9,
        206 => 10,
        304 => 11,
        400 => 12,
        404 => 13,
        500 => 14,
        _ => return None,
    })
}

fn static_name_index(name: &[u8]) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|&(entry, _)| entry == name)
        .map(|at| at + 1)
}

#[derive(Debug, Default)]
pub(crate) struct Encoder {}

impl Encoder {
    pub(crate) fn new() -> Self {
        Self {}
    }

    /// Encodes a response field block: `:status` first, then the field
    /// lines in application order, names lowercased.
    pub(crate) fn encode_response(
        &mut self,
        status: u16,
        headers: &[(Bytes, Bytes)],
        out: &mut BytesMut,
    ) {
        match status_index(status) {
            Some(index) => integer::encode(index as usize, 127, 0b1000_0000, out),
            None => {
                // literal without indexing, :status name at index 8
                integer::encode(8, 15, 0, out);
                let mut digits = itoa::Buffer::new();
                integer::encode_string(digits.format(status).as_bytes(), out);
            }
        }

        for (name, value) in headers {
            let lowered;
            let name = if name.iter().any(u8::is_ascii_uppercase) {
                lowered = name.to_ascii_lowercase();
                &lowered[..]
            } else {
                name.as_ref()
            };
            match static_name_index(name) {
                Some(index) => integer::encode(index, 15, 0, out),
                None => {
                    integer::encode(0, 15, 0, out);
                    integer::encode_string(name, out);
                }
            }
            integer::encode_string(value, out);
        }
    }
}

// ===== Test =====

#[cfg(test)]
mod test {
    use super::*;
    use crate::h2::hpack::Decoder;

    fn roundtrip(status: u16, headers: &[(&[u8], &[u8])]) -> Vec<(String, String)> {
        let headers: Vec<(Bytes, Bytes)> = headers
            .iter()
            .map(|(n, v)| (Bytes::copy_from_slice(n), Bytes::copy_from_slice(v)))
            .collect();
        let mut out = BytesMut::new();
        Encoder::new().encode_response(status, &headers, &mut out);

        let mut decoder = Decoder::new(4096);
        decoder
            .decode_block(out.freeze())
            .unwrap()
            .into_iter()
            .map(|(n, v)| {
                (
                    String::from_utf8(n.to_vec()).unwrap(),
                    String::from_utf8(v.to_vec()).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn test_indexed_status() {
        let fields = roundtrip(200, &[(b"content-type", b"text/plain")]);
        assert_eq!(
            fields,
            vec![
                (":status".to_owned(), "200".to_owned()),
                ("content-type".to_owned(), "text/plain".to_owned()),
            ],
        );
    }

    #[test]
    fn test_literal_status_and_custom_name() {
        let fields = roundtrip(418, &[(b"X-Teapot", b"short and stout")]);
        assert_eq!(
            fields,
            vec![
                (":status".to_owned(), "418".to_owned()),
                ("x-teapot".to_owned(), "short and stout".to_owned()),
            ],
        );
    }
}
