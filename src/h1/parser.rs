//! Request head parsing.
//!
//! Incremental: parsing a partial head returns `Ok(None)` and leaves the
//! buffer untouched, a complete head consumes its bytes. Field names are
//! validated against the RFC 9110 token grammar and lowercased; values keep
//! their bytes verbatim.
use bytes::{Buf, Bytes, BytesMut};

/// Largest accepted request head.
pub(crate) const MAX_HEAD: usize = 8 * 1024;
/// Most headers accepted per request.
const MAX_HEADERS: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Version {
    Http10,
    Http11,
}

impl Version {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Version::Http10 => "1.0",
            Version::Http11 => "1.1",
        }
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct RequestHead {
    /// Token method, case preserved.
    pub method: String,
    /// Raw request target bytes.
    pub target: Bytes,
    pub version: Version,
    /// Lowercase names, values verbatim, received order.
    pub headers: Vec<(Bytes, Bytes)>,
}

impl RequestHead {
    /// Single header lookup by lowercase name. First match wins.
    pub(crate) fn header(&self, name: &str) -> Option<&[u8]> {
        self.headers
            .iter()
            .find(|(n, _)| n.as_ref() == name.as_bytes())
            .map(|(_, v)| v.as_ref())
    }

    /// Whether a comma separated list header contains `token`,
    /// case-insensitive.
    pub(crate) fn header_contains(&self, name: &str, token: &str) -> bool {
        self.header(name).is_some_and(|value| {
            value
                .split(|&b| b == b',')
                .any(|part| trim(part).eq_ignore_ascii_case(token.as_bytes()))
        })
    }
}

/// Parses one request head off the front of `buffer`.
pub(crate) fn parse_head(buffer: &mut BytesMut) -> Result<Option<RequestHead>, ParseError> {
    let Some(head_len) = head_len(buffer) else {
        if buffer.len() > MAX_HEAD {
            return Err(ParseError::TooLarge);
        }
        return Ok(None);
    };
    if head_len > MAX_HEAD {
        return Err(ParseError::TooLarge);
    }

    let mut head = buffer.split_to(head_len).freeze();

    let line = take_line(&mut head).ok_or(ParseError::InvalidRequestLine)?;
    let (method, target, version) = parse_request_line(line)?;

    let mut headers = Vec::with_capacity(16);
    loop {
        let line = match take_line(&mut head) {
            Some(line) if line.is_empty() => break,
            Some(line) => line,
            // head_len guarantees the terminating blank line
            None => break,
        };
        if headers.len() == MAX_HEADERS {
            return Err(ParseError::TooManyHeaders);
        }
        headers.push(parse_header(line)?);
    }

    Ok(Some(RequestHead { method, target, version, headers }))
}

/// Byte length of the head including its blank line, or `None` when the
/// head is still incomplete.
fn head_len(buffer: &[u8]) -> Option<usize> {
    let mut pos = 0;
    loop {
        let nl = buffer[pos..].iter().position(|&b| b == b'\n')?;
        let line_len = if nl > 0 && buffer[pos + nl - 1] == b'\r' { nl - 1 } else { nl };
        pos += nl + 1;
        // blank line terminates the head; an empty request line is caught
        // by the request-line parser
        if line_len == 0 {
            return Some(pos);
        }
    }
}

/// Takes the next line, trimming the terminator.
fn take_line(head: &mut Bytes) -> Option<Bytes> {
    let nl = head.iter().position(|&b| b == b'\n')?;
    let mut line = head.split_to(nl + 1);
    line.truncate(nl);
    if line.last() == Some(&b'\r') {
        line.truncate(nl - 1);
    }
    Some(line)
}

fn parse_request_line(line: Bytes) -> Result<(String, Bytes, Version), ParseError> {
    let mut line = line;

    let sp = line
        .iter()
        .position(|&b| b == b' ')
        .ok_or(ParseError::InvalidRequestLine)?;
    let method = line.split_to(sp);
    line.advance(1);
    if method.is_empty() || !method.iter().all(|&b| is_token(b)) {
        return Err(ParseError::InvalidMethod);
    }

    let sp = line
        .iter()
        .rposition(|&b| b == b' ')
        .ok_or(ParseError::InvalidRequestLine)?;
    let version = line.split_off(sp + 1);
    line.truncate(sp);

    let version = match version.as_ref() {
        b"HTTP/1.1" => Version::Http11,
        b"HTTP/1.0" => Version::Http10,
        _ => return Err(ParseError::UnsupportedVersion),
    };

    // visible ASCII only; non-ASCII targets are rejected outright
    if line.is_empty() || !line.iter().all(|&b| (0x21..=0x7e).contains(&b)) {
        return Err(ParseError::InvalidTarget);
    }

    // SAFETY: checked to be a token, a subset of ASCII
    let method = unsafe { String::from_utf8_unchecked(method.to_vec()) };
    Ok((method, line, version))
}

fn parse_header(line: Bytes) -> Result<(Bytes, Bytes), ParseError> {
    // obs-fold is obsolete and rejected
    if matches!(line.first(), Some(b' ' | b'\t')) {
        return Err(ParseError::InvalidHeader);
    }

    let colon = line
        .iter()
        .position(|&b| b == b':')
        .ok_or(ParseError::InvalidHeader)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| is_token(b)) {
        return Err(ParseError::InvalidHeader);
    }

    let value = trim(&line[colon + 1..]);
    if value.iter().any(|&b| b == b'\r' || b == b'\n' || b == b'\0') {
        return Err(ParseError::InvalidHeader);
    }

    let name = if name.iter().any(u8::is_ascii_uppercase) {
        Bytes::from(name.to_ascii_lowercase())
    } else {
        line.slice(..colon)
    };
    let value = Bytes::copy_from_slice(value);
    Ok((name, value))
}

fn trim(mut bytes: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = bytes {
        bytes = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = bytes {
        bytes = rest;
    }
    bytes
}

/// RFC 9110 token characters.
pub(crate) fn is_token(byte: u8) -> bool {
    matches!(byte,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.'
        | b'^' | b'_' | b'`' | b'|' | b'~'
        | b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

// ===== Error =====

/// A malformed request head.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ParseError {
    InvalidRequestLine,
    InvalidMethod,
    InvalidTarget,
    UnsupportedVersion,
    InvalidHeader,
    TooManyHeaders,
    TooLarge,
}

impl ParseError {
    fn message(&self) -> &'static str {
        match self {
            ParseError::InvalidRequestLine => "malformed request line",
            ParseError::InvalidMethod => "invalid method",
            ParseError::InvalidTarget => "invalid characters in request target",
            ParseError::UnsupportedVersion => "unsupported http version",
            ParseError::InvalidHeader => "malformed header field",
            ParseError::TooManyHeaders => "too many headers",
            ParseError::TooLarge => "request head too large",
        }
    }
}

impl std::error::Error for ParseError {}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

// ===== Test =====

#[cfg(test)]
mod test {
    use super::*;

    fn parse(bytes: &[u8]) -> Result<Option<RequestHead>, ParseError> {
        let mut buffer = BytesMut::from(bytes);
        parse_head(&mut buffer)
    }

    #[test]
    fn test_simple_get() {
        let head = parse(b"GET /path?x=1 HTTP/1.1\r\nHost: example\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target.as_ref(), b"/path?x=1");
        assert_eq!(head.version, Version::Http11);
        assert_eq!(head.headers.len(), 1);
        assert_eq!(head.headers[0].0.as_ref(), b"host");
        assert_eq!(head.headers[0].1.as_ref(), b"example");
    }

    #[test]
    fn test_partial_head() {
        assert_eq!(parse(b"GET / HTTP/1.1\r\nHost: e").unwrap().map(|_| ()), None);
        assert_eq!(parse(b"GE").unwrap().map(|_| ()), None);
    }

    #[test]
    fn test_consumes_only_head() {
        let mut buffer = BytesMut::from(&b"GET / HTTP/1.1\r\n\r\nNEXT"[..]);
        parse_head(&mut buffer).unwrap().unwrap();
        assert_eq!(buffer.as_ref(), b"NEXT");
    }

    #[test]
    fn test_header_case_and_order() {
        let head = parse(b"GET / HTTP/1.1\r\nB: 2\r\nA: 1\r\nb: 3\r\n\r\n")
            .unwrap()
            .unwrap();
        let collected: Vec<_> = head
            .headers
            .iter()
            .map(|(n, v)| (n.as_ref().to_vec(), v.as_ref().to_vec()))
            .collect();
        assert_eq!(
            collected,
            vec![
                (b"b".to_vec(), b"2".to_vec()),
                (b"a".to_vec(), b"1".to_vec()),
                (b"b".to_vec(), b"3".to_vec()),
            ],
        );
    }

    #[test]
    fn test_bad_header_name() {
        assert_eq!(
            parse(b"GET / HTTP/1.1\r\nBad Header: x\r\n\r\n"),
            Err(ParseError::InvalidHeader),
        );
        assert_eq!(
            parse(b"GET / HTTP/1.1\r\n: x\r\n\r\n"),
            Err(ParseError::InvalidHeader),
        );
    }

    #[test]
    fn test_non_ascii_target() {
        assert_eq!(
            parse(b"GET /caf\xc3\xa9 HTTP/1.1\r\n\r\n"),
            Err(ParseError::InvalidTarget),
        );
    }

    #[test]
    fn test_unsupported_version() {
        assert_eq!(
            parse(b"GET / HTTP/0.9\r\n\r\n"),
            Err(ParseError::UnsupportedVersion),
        );
    }

    #[test]
    fn test_lone_lf_lines() {
        let head = parse(b"GET / HTTP/1.1\nHost: x\n\n").unwrap().unwrap();
        assert_eq!(head.headers[0].0.as_ref(), b"host");
    }

    #[test]
    fn test_header_contains() {
        let head = parse(b"GET / HTTP/1.1\r\nConnection: keep-alive, Upgrade\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.header_contains("connection", "upgrade"));
        assert!(head.header_contains("connection", "keep-alive"));
        assert!(!head.header_contains("connection", "close"));
    }
}
