//! End-to-end HTTP/2 over a prior-knowledge plaintext connection.
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use daphne::asgi::{AppEvent, Application, EventReceiver, EventSender, Scope, ServerEvent};
use daphne::testing::TestServer;
use daphne::Config;

const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

const DATA: u8 = 0x0;
const HEADERS: u8 = 0x1;
const RST_STREAM: u8 = 0x3;
const SETTINGS: u8 = 0x4;
const PING: u8 = 0x6;
const GOAWAY: u8 = 0x7;
const WINDOW_UPDATE: u8 = 0x8;

const FLAG_END_STREAM: u8 = 0x1;
const FLAG_ACK: u8 = 0x1;
const FLAG_END_HEADERS: u8 = 0x4;

fn quiet_config() -> Config {
    Config {
        access_log: daphne::access::AccessLogConfig::Disabled,
        ..Config::default()
    }
}

fn spawn(app: impl Application) -> TestServer {
    TestServer::spawn(quiet_config(), Arc::new(app)).unwrap()
}

fn connect(server: &TestServer) -> TcpStream {
    let stream = TcpStream::connect(server.addr()).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn write_frame(stream: &mut TcpStream, ty: u8, flags: u8, stream_id: u32, payload: &[u8]) {
    let len = (payload.len() as u32).to_be_bytes();
    let mut out = Vec::with_capacity(9 + payload.len());
    out.extend_from_slice(&len[1..]);
    out.push(ty);
    out.push(flags);
    out.extend_from_slice(&stream_id.to_be_bytes());
    out.extend_from_slice(payload);
    stream.write_all(&out).unwrap();
}

fn read_frame(stream: &mut TcpStream) -> (u8, u8, u32, Vec<u8>) {
    let mut header = [0u8; 9];
    stream.read_exact(&mut header).unwrap();
    let len = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
    let stream_id =
        u32::from_be_bytes([header[5] & 0x7f, header[6], header[7], header[8]]);
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (header[3], header[4], stream_id, payload)
}

/// Opens the connection: preface, settings exchange, acks.
fn handshake(stream: &mut TcpStream) {
    stream.write_all(PREFACE).unwrap();
    write_frame(stream, SETTINGS, 0, 0, &[]);

    let (ty, flags, _, _) = read_frame(stream);
    assert_eq!(ty, SETTINGS);
    assert_eq!(flags & FLAG_ACK, 0, "expected the server settings first");

    let (ty, flags, _, _) = read_frame(stream);
    assert_eq!(ty, SETTINGS);
    assert_eq!(flags & FLAG_ACK, FLAG_ACK, "expected a settings ack");

    write_frame(stream, SETTINGS, FLAG_ACK, 0, &[]);
}

/// `GET <indexed /> http` with END_STREAM: static indexes only.
const SIMPLE_GET: &[u8] = &[0x82, 0x84, 0x86];

fn echo_app() -> impl Application {
    |scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        let Scope::Http(scope) = &scope else { panic!("expected http scope") };
        assert_eq!(scope.http_version, "2");
        while let Some(event) = rx.recv().await {
            if matches!(event, ServerEvent::HttpRequest { more_body: false, .. }) {
                break;
            }
        }
        tx.send(AppEvent::ResponseStart {
            status: 200,
            headers: vec![(Bytes::from_static(b"content-type"), Bytes::from_static(b"text/plain"))],
            trailers: false,
        })
        .await?;
        tx.send(AppEvent::ResponseBody { body: Bytes::from_static(b"hi"), more_body: false })
            .await?;
        Ok(())
    }
}

#[test]
fn test_request_response_cycle() {
    let server = spawn(echo_app());
    let mut stream = connect(&server);
    handshake(&mut stream);

    write_frame(
        &mut stream,
        HEADERS,
        FLAG_END_HEADERS | FLAG_END_STREAM,
        1,
        SIMPLE_GET,
    );

    let (ty, flags, stream_id, payload) = read_frame(&mut stream);
    assert_eq!(ty, HEADERS);
    assert_eq!(stream_id, 1);
    assert_eq!(flags & FLAG_END_HEADERS, FLAG_END_HEADERS);
    // :status 200 is the indexed representation of static entry 8
    assert_eq!(payload[0], 0x88);

    let (ty, flags, stream_id, payload) = read_frame(&mut stream);
    assert_eq!(ty, DATA);
    assert_eq!(stream_id, 1);
    assert_eq!(payload, b"hi");
    assert_eq!(flags & FLAG_END_STREAM, FLAG_END_STREAM);
}

#[test]
fn test_concurrent_streams_multiplex() {
    let server = spawn(echo_app());
    let mut stream = connect(&server);
    handshake(&mut stream);

    write_frame(&mut stream, HEADERS, FLAG_END_HEADERS | FLAG_END_STREAM, 1, SIMPLE_GET);
    write_frame(&mut stream, HEADERS, FLAG_END_HEADERS | FLAG_END_STREAM, 3, SIMPLE_GET);
    write_frame(&mut stream, HEADERS, FLAG_END_HEADERS | FLAG_END_STREAM, 5, SIMPLE_GET);

    let mut finished = Vec::new();
    while finished.len() < 3 {
        let (ty, flags, stream_id, _) = read_frame(&mut stream);
        if ty == DATA && flags & FLAG_END_STREAM != 0 {
            finished.push(stream_id);
        }
    }
    finished.sort_unstable();
    assert_eq!(finished, vec![1, 3, 5]);
}

#[test]
fn test_request_body_via_data_frames() {
    let app = |_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        let mut body = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                ServerEvent::HttpRequest { body: chunk, more_body } => {
                    body.extend_from_slice(&chunk);
                    if !more_body {
                        break;
                    }
                }
                _ => break,
            }
        }
        tx.send(AppEvent::ResponseStart { status: 200, headers: Vec::new(), trailers: false })
            .await?;
        tx.send(AppEvent::ResponseBody { body: Bytes::from(body), more_body: false }).await?;
        Ok(())
    };
    let server = spawn(app);
    let mut stream = connect(&server);
    handshake(&mut stream);

    // POST / http
    write_frame(&mut stream, HEADERS, FLAG_END_HEADERS, 1, &[0x83, 0x84, 0x86]);
    write_frame(&mut stream, DATA, 0, 1, b"hello ");
    write_frame(&mut stream, DATA, FLAG_END_STREAM, 1, b"world");

    let mut body = Vec::new();
    loop {
        let (ty, flags, _, payload) = read_frame(&mut stream);
        match ty {
            DATA => {
                body.extend_from_slice(&payload);
                if flags & FLAG_END_STREAM != 0 {
                    break;
                }
            }
            HEADERS => {}
            // flow-control replenishment
            WINDOW_UPDATE => {}
            other => panic!("unexpected frame type {other}"),
        }
    }
    assert_eq!(body, b"hello world");
}

#[test]
fn test_ping_acked() {
    let server = spawn(echo_app());
    let mut stream = connect(&server);
    handshake(&mut stream);

    write_frame(&mut stream, PING, 0, 0, &[9, 9, 9, 9, 8, 8, 8, 8]);
    let (ty, flags, _, payload) = read_frame(&mut stream);
    assert_eq!(ty, PING);
    assert_eq!(flags & FLAG_ACK, FLAG_ACK);
    assert_eq!(payload, &[9, 9, 9, 9, 8, 8, 8, 8]);
}

#[test]
fn test_rst_stream_cancels_cycle() {
    let app = |_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        // wait for the cancellation
        while rx.recv().await.is_some() {}
        drop(tx);
        Ok(())
    };
    let server = spawn(app);
    let mut stream = connect(&server);
    handshake(&mut stream);

    write_frame(&mut stream, HEADERS, FLAG_END_HEADERS, 1, SIMPLE_GET);
    write_frame(&mut stream, RST_STREAM, 0, 1, &0x8u32.to_be_bytes());

    // the connection survives: a ping still gets answered
    write_frame(&mut stream, PING, 0, 0, &[0; 8]);
    loop {
        let (ty, flags, _, _) = read_frame(&mut stream);
        if ty == PING && flags & FLAG_ACK != 0 {
            return;
        }
    }
}

#[test]
fn test_push_promise_from_client_is_connection_error() {
    let server = spawn(echo_app());
    let mut stream = connect(&server);
    handshake(&mut stream);

    write_frame(&mut stream, 0x5, FLAG_END_HEADERS, 1, &[0, 0, 0, 2]);
    loop {
        let (ty, _, _, payload) = read_frame(&mut stream);
        if ty == GOAWAY {
            let code = u32::from_be_bytes(payload[4..8].try_into().unwrap());
            assert_eq!(code, 0x1, "expected PROTOCOL_ERROR");
            break;
        }
    }
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
}
