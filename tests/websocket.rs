//! End-to-end WebSocket behavior over real sockets.
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use daphne::asgi::{
    AppEvent, Application, EventReceiver, EventSender, Message, Scope, ServerEvent,
};
use daphne::testing::TestServer;
use daphne::Config;

const SAMPLE_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";
const SAMPLE_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

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

fn upgrade(stream: &mut TcpStream, target: &str) -> String {
    write!(
        stream,
        "GET {target} HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 13\r\n\r\n",
    )
    .unwrap();
    read_head(stream)
}

/// Reads an HTTP response head up to and including the blank line.
fn read_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

fn write_masked(stream: &mut TcpStream, opcode: u8, payload: &[u8]) {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | opcode);
    let mask = [0xa1, 0xb2, 0xc3, 0xd4];
    match payload.len() {
        len @ 0..=125 => out.push(0x80 | len as u8),
        len @ 126..=65535 => {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        }
        len => {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
    stream.write_all(&out).unwrap();
}

/// Reads one unmasked server frame, returning `(opcode, payload)`.
fn read_frame(stream: &mut TcpStream) -> (u8, Vec<u8>) {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).unwrap();
    assert_eq!(head[0] & 0x80, 0x80, "server frames must set FIN");
    assert_eq!(head[1] & 0x80, 0, "server frames must be unmasked");
    let len = match head[1] & 0x7f {
        126 => {
            let mut ext = [0u8; 2];
            stream.read_exact(&mut ext).unwrap();
            u16::from_be_bytes(ext) as usize
        }
        127 => {
            let mut ext = [0u8; 8];
            stream.read_exact(&mut ext).unwrap();
            u64::from_be_bytes(ext) as usize
        }
        len => len as usize,
    };
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).unwrap();
    (head[0] & 0x0f, payload)
}

#[test]
fn test_accept_and_text_frame() {
    let server = spawn(|scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        let Scope::WebSocket(scope) = &scope else { panic!("expected websocket scope") };
        assert_eq!(scope.path, "/ws");
        assert_eq!(scope.query_string.as_ref(), b"x=1");
        assert_eq!(scope.scheme, "ws");

        match rx.recv().await {
            Some(ServerEvent::WebSocketConnect) => {}
            other => panic!("expected websocket.connect, got {other:?}"),
        }
        tx.send(AppEvent::Accept { subprotocol: None, headers: Vec::new() }).await?;
        tx.send(AppEvent::Send(Message::Text("hello".into()))).await?;
        while rx.recv().await.is_some() {}
        Ok(())
    });

    let mut stream = connect(&server);
    let head = upgrade(&mut stream, "/ws?x=1");
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head:?}");
    assert!(
        head.contains(&format!("sec-websocket-accept: {SAMPLE_ACCEPT}\r\n")),
        "{head:?}",
    );

    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b"hello");
}

#[test]
fn test_subprotocol_echoed() {
    let server = spawn(|scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        let Scope::WebSocket(scope) = &scope else { panic!("expected websocket scope") };
        assert_eq!(scope.subprotocols, vec!["graphql-ws", "chat"]);
        let chosen = scope.subprotocols[1].clone();
        match rx.recv().await {
            Some(ServerEvent::WebSocketConnect) => {}
            other => panic!("expected websocket.connect, got {other:?}"),
        }
        tx.send(AppEvent::Accept { subprotocol: Some(chosen), headers: Vec::new() }).await?;
        while rx.recv().await.is_some() {}
        Ok(())
    });

    let mut stream = connect(&server);
    write!(
        stream,
        "GET /ws HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: {SAMPLE_KEY}\r\nSec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Protocol: graphql-ws, chat\r\n\r\n",
    )
    .unwrap();
    let head = read_head(&mut stream);
    assert!(head.contains("sec-websocket-protocol: chat\r\n"), "{head:?}");
}

#[test]
fn test_denied_handshake_is_403() {
    let server = spawn(|_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        match rx.recv().await {
            Some(ServerEvent::WebSocketConnect) => {}
            other => panic!("expected websocket.connect, got {other:?}"),
        }
        tx.send(AppEvent::Close { code: 1000, reason: None }).await?;
        while rx.recv().await.is_some() {}
        Ok(())
    });

    let mut stream = connect(&server);
    let head = upgrade(&mut stream, "/ws");
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{head:?}");
}

#[test]
fn test_echo_binary_and_close_handshake() {
    let (probe_tx, probe_rx) = mpsc::channel::<u16>();
    let server = spawn(move |_scope: Scope, mut rx: EventReceiver, tx: EventSender| {
        let probe = probe_tx.clone();
        async move {
            match rx.recv().await {
                Some(ServerEvent::WebSocketConnect) => {}
                other => panic!("expected websocket.connect, got {other:?}"),
            }
            tx.send(AppEvent::Accept { subprotocol: None, headers: Vec::new() }).await?;
            while let Some(event) = rx.recv().await {
                match event {
                    ServerEvent::WebSocketReceive(Message::Binary(data)) => {
                        tx.send(AppEvent::Send(Message::Binary(data))).await?;
                    }
                    ServerEvent::WebSocketReceive(Message::Text(text)) => {
                        tx.send(AppEvent::Send(Message::Text(text))).await?;
                    }
                    ServerEvent::WebSocketDisconnect { code } => {
                        probe.send(code).unwrap();
                    }
                    _ => {}
                }
            }
            Ok(())
        }
    });

    let mut stream = connect(&server);
    upgrade(&mut stream, "/ws");

    write_masked(&mut stream, 0x2, &[1, 2, 3]);
    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!((opcode, payload.as_slice()), (0x2, &[1u8, 2, 3][..]));

    write_masked(&mut stream, 0x1, "caf\u{e9}".as_bytes());
    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    assert_eq!(String::from_utf8(payload).unwrap(), "caf\u{e9}");

    // close with code 1000, expect the echo and the app-side disconnect
    write_masked(&mut stream, 0x8, &1000u16.to_be_bytes());
    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert_eq!(payload, 1000u16.to_be_bytes());

    assert_eq!(probe_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1000);
}

#[test]
fn test_fragmented_message_reassembled() {
    let server = spawn(|_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        match rx.recv().await {
            Some(ServerEvent::WebSocketConnect) => {}
            other => panic!("expected websocket.connect, got {other:?}"),
        }
        tx.send(AppEvent::Accept { subprotocol: None, headers: Vec::new() }).await?;
        while let Some(event) = rx.recv().await {
            if let ServerEvent::WebSocketReceive(Message::Text(text)) = event {
                tx.send(AppEvent::Send(Message::Text(text))).await?;
            }
        }
        Ok(())
    });

    let mut stream = connect(&server);
    upgrade(&mut stream, "/ws");

    // "hel" + "lo" across a text frame and a continuation
    let mask = [9u8, 8, 7, 6];
    let mut fragment = vec![0x01, 0x83];
    fragment.extend_from_slice(&mask);
    fragment.extend(b"hel".iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
    fragment.extend_from_slice(&[0x80, 0x82]);
    fragment.extend_from_slice(&mask);
    fragment.extend(b"lo".iter().enumerate().map(|(i, b)| b ^ mask[i & 3]));
    stream.write_all(&fragment).unwrap();

    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!(opcode, 0x1);
    assert_eq!(payload, b"hello");
}

#[test]
fn test_unmasked_frame_closes_1002() {
    let server = spawn(|_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        match rx.recv().await {
            Some(ServerEvent::WebSocketConnect) => {}
            other => panic!("expected websocket.connect, got {other:?}"),
        }
        tx.send(AppEvent::Accept { subprotocol: None, headers: Vec::new() }).await?;
        while rx.recv().await.is_some() {}
        Ok(())
    });

    let mut stream = connect(&server);
    upgrade(&mut stream, "/ws");

    // unmasked client frame is a protocol violation
    stream.write_all(&[0x81, 0x02, b'h', b'i']).unwrap();
    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert_eq!(payload[..2], 1002u16.to_be_bytes());
}

#[test]
fn test_ping_answered_with_pong() {
    let server = spawn(|_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        match rx.recv().await {
            Some(ServerEvent::WebSocketConnect) => {}
            other => panic!("expected websocket.connect, got {other:?}"),
        }
        tx.send(AppEvent::Accept { subprotocol: None, headers: Vec::new() }).await?;
        while rx.recv().await.is_some() {}
        Ok(())
    });

    let mut stream = connect(&server);
    upgrade(&mut stream, "/ws");

    write_masked(&mut stream, 0x9, b"mark");
    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!(opcode, 0xa);
    assert_eq!(payload, b"mark");
}

#[test]
fn test_keepalive_ping_sent_when_idle() {
    let config = Config {
        ping_interval: Duration::from_millis(200),
        ping_timeout: Duration::from_secs(30),
        ..quiet_config()
    };
    let app = |_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        match rx.recv().await {
            Some(ServerEvent::WebSocketConnect) => {}
            other => panic!("expected websocket.connect, got {other:?}"),
        }
        tx.send(AppEvent::Accept { subprotocol: None, headers: Vec::new() }).await?;
        while rx.recv().await.is_some() {}
        Ok(())
    };
    let server = TestServer::spawn(config, Arc::new(app)).unwrap();

    let mut stream = connect(&server);
    upgrade(&mut stream, "/ws");

    let (opcode, _) = read_frame(&mut stream);
    assert_eq!(opcode, 0x9, "expected a keepalive ping");
}

#[test]
fn test_server_close_from_application() {
    let server = spawn(|_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        match rx.recv().await {
            Some(ServerEvent::WebSocketConnect) => {}
            other => panic!("expected websocket.connect, got {other:?}"),
        }
        tx.send(AppEvent::Accept { subprotocol: None, headers: Vec::new() }).await?;
        tx.send(AppEvent::Close { code: 4001, reason: None }).await?;
        // ignored after close
        tx.send(AppEvent::Send(Message::Text("late".into()))).await?;
        while rx.recv().await.is_some() {}
        Ok(())
    });

    let mut stream = connect(&server);
    upgrade(&mut stream, "/ws");

    let (opcode, payload) = read_frame(&mut stream);
    assert_eq!(opcode, 0x8);
    assert_eq!(payload[..2], 4001u16.to_be_bytes());

    // complete the handshake from the client side
    write_masked(&mut stream, 0x8, &4001u16.to_be_bytes());
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest);
    assert!(rest.is_empty(), "no frames expected after close: {rest:?}");
}
