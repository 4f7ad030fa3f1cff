//! Chunked transfer coding.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::parser::ParseError;

/// Largest accepted chunk-size line value.
const MAX_CHUNK_SIZE: u64 = 1024 * 1024 * 1024;

/// One decoded piece of a chunked body.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Chunk {
    Data(Bytes),
    /// Last chunk and trailer section consumed.
    End,
}

/// Incremental chunked body decoder.
///
/// `decode` pulls the next piece off the front of the buffer, returning
/// `None` when more bytes are needed.
#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    phase: Phase,
}

#[derive(Debug)]
enum Phase {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
}

impl ChunkedDecoder {
    pub(crate) fn new() -> Self {
        Self { phase: Phase::Size }
    }

    pub(crate) fn decode(&mut self, buffer: &mut BytesMut) -> Result<Option<Chunk>, ParseError> {
        loop {
            match self.phase {
                Phase::Size => {
                    let Some(digits_len) = buffer.iter().position(|b| !b.is_ascii_hexdigit())
                    else {
                        return Ok(None);
                    };
                    if digits_len == 0 {
                        return Err(ParseError::InvalidHeader);
                    }
                    // SAFETY: hex digits are ASCII
                    let digits = unsafe { std::str::from_utf8_unchecked(&buffer[..digits_len]) };
                    let size = u64::from_str_radix(digits, 16)
                        .ok()
                        .filter(|&size| size <= MAX_CHUNK_SIZE)
                        .ok_or(ParseError::InvalidHeader)?;

                    // chunk extension runs to the end of the line
                    let line_len = match buffer[digits_len] {
                        b'\r' | b';' => {
                            match buffer[digits_len..].iter().position(|&b| b == b'\n') {
                                Some(nl) => nl + 1,
                                None => return Ok(None),
                            }
                        }
                        b'\n' => 1,
                        _ => return Err(ParseError::InvalidHeader),
                    };
                    buffer.advance(digits_len + line_len);

                    self.phase = match size {
                        0 => Phase::Trailer,
                        size => Phase::Data(size),
                    };
                }
                Phase::Data(remaining) => {
                    if buffer.is_empty() {
                        return Ok(None);
                    }
                    let take = remaining.min(buffer.len() as u64) as usize;
                    let data = buffer.split_to(take).freeze();
                    self.phase = match remaining - take as u64 {
                        0 => Phase::DataEnd,
                        left => Phase::Data(left),
                    };
                    return Ok(Some(Chunk::Data(data)));
                }
                Phase::DataEnd => match chunk_delimiter(buffer) {
                    Some(len) => {
                        buffer.advance(len);
                        self.phase = Phase::Size;
                    }
                    None if buffer.len() < 2 => return Ok(None),
                    None => return Err(ParseError::InvalidHeader),
                },
                Phase::Trailer => {
                    // trailer fields are consumed and dropped
                    let Some(nl) = buffer.iter().position(|&b| b == b'\n') else {
                        return Ok(None);
                    };
                    let blank = nl == 0 || (nl == 1 && buffer[0] == b'\r');
                    buffer.advance(nl + 1);
                    if blank {
                        self.phase = Phase::Size;
                        return Ok(Some(Chunk::End));
                    }
                }
            }
        }
    }
}

fn chunk_delimiter(buffer: &[u8]) -> Option<usize> {
    match buffer {
        [b'\r', b'\n', ..] => Some(2),
        [b'\n', ..] => Some(1),
        _ => None,
    }
}

// ===== Encode =====

/// Appends one response chunk. Empty data is skipped, it would read as the
/// last chunk.
pub(crate) fn encode_chunk(data: &[u8], buffer: &mut BytesMut) {
    if data.is_empty() {
        return;
    }
    let size = format!("{:x}", data.len());
    buffer.reserve(size.len() + data.len() + 4);
    buffer.put_slice(size.as_bytes());
    buffer.put_slice(b"\r\n");
    buffer.put_slice(data);
    buffer.put_slice(b"\r\n");
}

/// Appends the chunked body terminator.
pub(crate) fn encode_end(buffer: &mut BytesMut) {
    buffer.put_slice(b"0\r\n\r\n");
}

// ===== Test =====

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(decoder: &mut ChunkedDecoder, bytes: &[u8]) -> (Vec<Chunk>, BytesMut) {
        let mut buffer = BytesMut::from(bytes);
        let mut chunks = Vec::new();
        while let Some(chunk) = decoder.decode(&mut buffer).unwrap() {
            let end = matches!(chunk, Chunk::End);
            chunks.push(chunk);
            if end {
                break;
            }
        }
        (chunks, buffer)
    }

    #[test]
    fn test_decode_simple() {
        let mut decoder = ChunkedDecoder::new();
        let (chunks, rest) = decode_all(&mut decoder, b"2\r\nhi\r\n0\r\n\r\nNEXT");
        assert_eq!(
            chunks,
            vec![Chunk::Data(Bytes::from_static(b"hi")), Chunk::End],
        );
        assert_eq!(rest.as_ref(), b"NEXT");
    }

    #[test]
    fn test_decode_split_feed() {
        let mut decoder = ChunkedDecoder::new();
        let mut buffer = BytesMut::from(&b"4\r\nab"[..]);
        assert_eq!(
            decoder.decode(&mut buffer).unwrap(),
            Some(Chunk::Data(Bytes::from_static(b"ab"))),
        );
        assert_eq!(decoder.decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(b"cd\r\n0\r\n\r\n");
        assert_eq!(
            decoder.decode(&mut buffer).unwrap(),
            Some(Chunk::Data(Bytes::from_static(b"cd"))),
        );
        assert_eq!(decoder.decode(&mut buffer).unwrap(), Some(Chunk::End));
    }

    #[test]
    fn test_decode_extension_and_trailer() {
        let mut decoder = ChunkedDecoder::new();
        let (chunks, _) = decode_all(
            &mut decoder,
            b"2;ext=1\r\nhi\r\n0\r\nx-trailer: 1\r\n\r\n",
        );
        assert_eq!(
            chunks,
            vec![Chunk::Data(Bytes::from_static(b"hi")), Chunk::End],
        );
    }

    #[test]
    fn test_decode_invalid_size() {
        let mut decoder = ChunkedDecoder::new();
        let mut buffer = BytesMut::from(&b"zz\r\n"[..]);
        assert!(decoder.decode(&mut buffer).is_err());
    }

    #[test]
    fn test_encode() {
        let mut buffer = BytesMut::new();
        encode_chunk(b"hi", &mut buffer);
        encode_end(&mut buffer);
        assert_eq!(buffer.as_ref(), b"2\r\nhi\r\n0\r\n\r\n");

        let mut buffer = BytesMut::new();
        encode_chunk(b"", &mut buffer);
        assert!(buffer.is_empty());
    }
}
