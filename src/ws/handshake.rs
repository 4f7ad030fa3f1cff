//! Opening handshake.
//!
//! <https://datatracker.ietf.org/doc/html/rfc6455#section-4>
use base64ct::{Base64, Encoding};
use bytes::{BufMut, BytesMut};
use sha1::{Digest, Sha1};

use crate::h1::parser::RequestHead;

const WS_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derives the `Sec-WebSocket-Accept` value for a client key.
pub(crate) fn derive_accept(key: &[u8]) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key);
    sha1.update(WS_GUID);
    Base64::encode_string(&sha1.finalize())
}

/// Checks the upgrade request and returns the client key.
pub(crate) fn validate(head: &RequestHead) -> Result<Vec<u8>, &'static str> {
    if !head.method.eq_ignore_ascii_case("GET") {
        return Err("websocket upgrade requires GET");
    }
    match head.header("sec-websocket-version") {
        Some(b"13") => {}
        _ => return Err("unsupported websocket version"),
    }
    match head.header("sec-websocket-key") {
        Some(key) if !key.is_empty() => Ok(key.to_vec()),
        _ => Err("missing websocket key"),
    }
}

/// Subprotocol offers, in header order.
pub(crate) fn subprotocols(head: &RequestHead) -> Vec<String> {
    let mut offers = Vec::new();
    for (name, value) in &head.headers {
        if name.as_ref() != b"sec-websocket-protocol" {
            continue;
        }
        let Ok(value) = std::str::from_utf8(value) else {
            continue;
        };
        offers.extend(
            value
                .split(',')
                .map(str::trim)
                .filter(|offer| !offer.is_empty())
                .map(str::to_owned),
        );
    }
    offers
}

/// Writes the 101 Switching Protocols response.
///
/// Extra headers come from `websocket.accept`; the chosen subprotocol is
/// echoed, never negotiated by the server.
pub(crate) fn encode_accept(
    out: &mut BytesMut,
    key: &[u8],
    subprotocol: Option<&str>,
    extra_headers: &[(bytes::Bytes, bytes::Bytes)],
    server_name: &str,
) {
    out.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
    out.put_slice(b"upgrade: websocket\r\nconnection: upgrade\r\n");
    out.put_slice(b"sec-websocket-accept: ");
    out.put_slice(derive_accept(key).as_bytes());
    out.put_slice(b"\r\n");
    if let Some(subprotocol) = subprotocol {
        out.put_slice(b"sec-websocket-protocol: ");
        out.put_slice(subprotocol.as_bytes());
        out.put_slice(b"\r\n");
    }
    if !server_name.is_empty() {
        out.put_slice(b"server: ");
        out.put_slice(server_name.as_bytes());
        out.put_slice(b"\r\n");
    }
    for (name, value) in extra_headers {
        if name.is_empty()
            || !name.iter().all(|&b| crate::h1::parser::is_token(b))
            || value.iter().any(|&b| b == b'\r' || b == b'\n')
        {
            continue;
        }
        out.put_slice(name);
        out.put_slice(b": ");
        out.put_slice(value);
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
}

// ===== Test =====

#[cfg(test)]
mod test {
    use super::*;
    use bytes::BytesMut;

    fn head(bytes: &[u8]) -> RequestHead {
        let mut buffer = BytesMut::from(bytes);
        crate::h1::parser::parse_head(&mut buffer).unwrap().unwrap()
    }

    #[test]
    fn test_derive_accept_rfc_example() {
        // RFC 6455 section 1.3
        assert_eq!(
            derive_accept(b"dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=",
        );
    }

    #[test]
    fn test_validate() {
        let ok = head(
            b"GET /ws HTTP/1.1\r\n\
              Upgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        );
        assert_eq!(validate(&ok).unwrap(), b"dGhlIHNhbXBsZSBub25jZQ==");

        let bad_version = head(
            b"GET /ws HTTP/1.1\r\nSec-WebSocket-Key: x\r\nSec-WebSocket-Version: 8\r\n\r\n",
        );
        assert!(validate(&bad_version).is_err());

        let not_get = head(
            b"POST /ws HTTP/1.1\r\nSec-WebSocket-Key: x\r\nSec-WebSocket-Version: 13\r\n\r\n",
        );
        assert!(validate(&not_get).is_err());
    }

    #[test]
    fn test_subprotocols() {
        let head = head(
            b"GET /ws HTTP/1.1\r\n\
              Sec-WebSocket-Protocol: graphql-ws, chat\r\n\
              Sec-WebSocket-Protocol: legacy\r\n\r\n",
        );
        assert_eq!(subprotocols(&head), vec!["graphql-ws", "chat", "legacy"]);
    }

    #[test]
    fn test_encode_accept() {
        let mut out = BytesMut::new();
        encode_accept(&mut out, b"dGhlIHNhbXBsZSBub25jZQ==", Some("chat"), &[], "daphne");
        let text = std::str::from_utf8(&out).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("sec-websocket-accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(text.contains("sec-websocket-protocol: chat\r\n"));
        assert!(text.contains("server: daphne\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }
}
