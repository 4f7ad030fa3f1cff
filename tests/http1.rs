//! End-to-end HTTP/1.1 behavior over real sockets.
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use daphne::asgi::{
    AppEvent, Application, EventReceiver, EventSender, Scope, ServerEvent, SyncApplication,
};
use daphne::testing::TestServer;
use daphne::Config;

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

fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut bytes = Vec::new();
    let _ = stream.read_to_end(&mut bytes);
    bytes
}

fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    stream.read_exact(&mut bytes).unwrap();
    bytes
}

async fn drain_request(rx: &mut EventReceiver) {
    while let Some(event) = rx.recv().await {
        if let ServerEvent::HttpRequest { more_body: false, .. } = event {
            return;
        }
    }
}

async fn send_response(tx: &EventSender, body: &[u8], headers: &[(&[u8], &[u8])]) {
    tx.send(AppEvent::ResponseStart {
        status: 200,
        headers: headers
            .iter()
            .map(|(n, v)| (Bytes::copy_from_slice(n), Bytes::copy_from_slice(v)))
            .collect(),
        trailers: false,
    })
    .await
    .unwrap();
    tx.send(AppEvent::ResponseBody {
        body: Bytes::copy_from_slice(body),
        more_body: false,
    })
    .await
    .unwrap();
}

#[test]
fn test_chunked_response_wire_bytes() {
    let server = spawn(|_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        drain_request(&mut rx).await;
        send_response(&tx, b"hi", &[(b"content-type", b"text/plain")]).await;
        Ok(())
    });

    let mut stream = connect(&server);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let expected = b"HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\nserver: daphne\r\n\
                     transfer-encoding: chunked\r\n\r\n2\r\nhi\r\n0\r\n\r\n";
    let bytes = read_exact(&mut stream, expected.len());
    assert_eq!(
        String::from_utf8_lossy(&bytes),
        String::from_utf8_lossy(expected),
    );
}

#[test]
fn test_pipelined_responses_in_order() {
    let server = spawn(|scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        drain_request(&mut rx).await;
        let body = scope.path().to_owned();
        tx.send(AppEvent::ResponseStart {
            status: 200,
            headers: vec![(
                Bytes::from_static(b"content-length"),
                Bytes::from(body.len().to_string().into_bytes()),
            )],
            trailers: false,
        })
        .await?;
        tx.send(AppEvent::ResponseBody {
            body: Bytes::from(body.into_bytes()),
            more_body: false,
        })
        .await?;
        Ok(())
    });

    let mut stream = connect(&server);
    stream
        .write_all(
            b"GET /first HTTP/1.1\r\nHost: x\r\n\r\nGET /second HTTP/1.1\r\nHost: x\r\n\r\n",
        )
        .unwrap();

    let mut collected = Vec::new();
    loop {
        let mut buf = [0u8; 4096];
        let read = stream.read(&mut buf).unwrap();
        assert!(read > 0, "connection closed early");
        collected.extend_from_slice(&buf[..read]);

        let text = String::from_utf8_lossy(&collected);
        if let (Some(first), Some(second)) = (text.find("/first"), text.find("/second")) {
            assert!(first < second, "responses out of order: {text:?}");
            return;
        }
    }
}

#[test]
fn test_request_body_streamed_to_application() {
    let (probe_tx, probe_rx) = mpsc::channel::<Vec<u8>>();
    let server = spawn(move |_scope: Scope, mut rx: EventReceiver, tx: EventSender| {
        let probe = probe_tx.clone();
        async move {
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
            probe.send(body).unwrap();
            send_response(&tx, b"ok", &[(b"content-length", b"2")]).await;
            Ok(())
        }
    });

    let mut stream = connect(&server);
    stream
        .write_all(b"POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello ")
        .unwrap();
    stream.flush().unwrap();
    std::thread::sleep(Duration::from_millis(50));
    stream.write_all(b"world").unwrap();

    let body = probe_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(body, b"hello world");

    let response = read_exact(&mut stream, 16);
    assert!(response.starts_with(b"HTTP/1.1 200"));
}

#[test]
fn test_chunked_request_body() {
    let (probe_tx, probe_rx) = mpsc::channel::<Vec<u8>>();
    let server = spawn(move |_scope: Scope, mut rx: EventReceiver, tx: EventSender| {
        let probe = probe_tx.clone();
        async move {
            let mut body = Vec::new();
            while let Some(ServerEvent::HttpRequest { body: chunk, more_body }) = rx.recv().await
            {
                body.extend_from_slice(&chunk);
                if !more_body {
                    break;
                }
            }
            probe.send(body).unwrap();
            send_response(&tx, b"ok", &[(b"content-length", b"2")]).await;
            Ok(())
        }
    });

    let mut stream = connect(&server);
    stream
        .write_all(
            b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .unwrap();

    let body = probe_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(body, b"hello world");
}

#[test]
fn test_disconnect_delivered_exactly_once() {
    let (probe_tx, probe_rx) = mpsc::channel::<&'static str>();
    let server = spawn(move |_scope: Scope, mut rx: EventReceiver, tx: EventSender| {
        let probe = probe_tx.clone();
        async move {
            // request itself
            match rx.recv().await {
                Some(ServerEvent::HttpRequest { .. }) => {}
                other => panic!("expected request event, got {other:?}"),
            }
            // client hangs up before any response is sent
            match rx.recv().await {
                Some(ServerEvent::HttpDisconnect) => {}
                other => panic!("expected disconnect, got {other:?}"),
            }
            assert!(rx.recv().await.is_none());
            probe.send("disconnected").unwrap();
            drop(tx);
            Ok(())
        }
    });

    let mut stream = connect(&server);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
    std::thread::sleep(Duration::from_millis(100));
    drop(stream);

    assert_eq!(
        probe_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        "disconnected",
    );
}

#[test]
fn test_root_path_header() {
    let server = spawn(|scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        drain_request(&mut rx).await;
        let Scope::Http(scope) = &scope else { panic!("expected http scope") };
        let leaked = scope
            .headers
            .iter()
            .any(|(name, _)| name.as_ref() == b"daphne-root-path");
        let body = format!("{}|{}|{leaked}", scope.root_path, scope.path);
        tx.send(AppEvent::ResponseStart {
            status: 200,
            headers: vec![(
                Bytes::from_static(b"content-length"),
                Bytes::from(body.len().to_string().into_bytes()),
            )],
            trailers: false,
        })
        .await?;
        tx.send(AppEvent::ResponseBody { body: Bytes::from(body.into_bytes()), more_body: false })
            .await?;
        Ok(())
    });

    let mut stream = connect(&server);
    stream
        .write_all(
            b"GET /forum/app HTTP/1.1\r\nHost: x\r\nDaphne-Root-Path: %2Fforum\r\n\
              Connection: close\r\n\r\n",
        )
        .unwrap();

    let response = String::from_utf8(read_until_close(&mut stream)).unwrap();
    assert!(response.ends_with("/forum|/app|false"), "{response:?}");
}

#[test]
fn test_proxy_headers_rewrite_client() {
    let config = Config {
        proxy: Some(daphne::ProxyConfig::default()),
        ..quiet_config()
    };
    let app = |scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        drain_request(&mut rx).await;
        let Scope::Http(scope) = &scope else { panic!("expected http scope") };
        let body = match &scope.client {
            Some((host, port)) => format!("{host}:{port}"),
            None => "none".to_owned(),
        };
        tx.send(AppEvent::ResponseStart {
            status: 200,
            headers: vec![(
                Bytes::from_static(b"content-length"),
                Bytes::from(body.len().to_string().into_bytes()),
            )],
            trailers: false,
        })
        .await?;
        tx.send(AppEvent::ResponseBody { body: Bytes::from(body.into_bytes()), more_body: false })
            .await?;
        Ok(())
    };
    let server = TestServer::spawn(config, Arc::new(app)).unwrap();

    let mut stream = connect(&server);
    stream
        .write_all(
            b"GET / HTTP/1.1\r\nHost: x\r\nX-Forwarded-For: 203.0.113.7, 10.0.0.1\r\n\
              Connection: close\r\n\r\n",
        )
        .unwrap();

    let response = String::from_utf8(read_until_close(&mut stream)).unwrap();
    assert!(response.ends_with("203.0.113.7:0"), "{response:?}");
}

#[test]
fn test_malformed_header_rejected() {
    let server = spawn(|_scope: Scope, _rx: EventReceiver, _tx: EventSender| async move {
        if true {
            panic!("application must not be invoked for malformed requests");
        }
        Ok(())
    });

    let mut stream = connect(&server);
    stream
        .write_all(b"GET / HTTP/1.1\r\nBad Header Name: x\r\n\r\n")
        .unwrap();

    let response = read_until_close(&mut stream);
    assert!(response.starts_with(b"HTTP/1.1 400"), "{response:?}");
}

#[test]
fn test_application_error_yields_500() {
    let server = spawn(|_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        drain_request(&mut rx).await;
        drop(tx);
        Err("deliberate failure".into())
    });

    let mut stream = connect(&server);
    stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

    let response = read_until_close(&mut stream);
    assert!(response.starts_with(b"HTTP/1.1 500"), "{response:?}");
}

#[test]
fn test_server_header_disabled() {
    let config = Config {
        server_name: String::new(),
        ..quiet_config()
    };
    let app = |_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        drain_request(&mut rx).await;
        send_response(&tx, b"x", &[(b"content-length", b"1")]).await;
        Ok(())
    };
    let server = TestServer::spawn(config, Arc::new(app)).unwrap();

    let mut stream = connect(&server);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let response = String::from_utf8(read_until_close(&mut stream)).unwrap();
    assert!(!response.to_ascii_lowercase().contains("server:"), "{response:?}");
}

#[test]
fn test_keep_alive_serves_second_request() {
    let server = spawn(|_scope: Scope, mut rx: EventReceiver, tx: EventSender| async move {
        drain_request(&mut rx).await;
        send_response(&tx, b"ok", &[(b"content-length", b"2")]).await;
        Ok(())
    });

    let mut stream = connect(&server);
    let expected = b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nserver: daphne\r\n\r\nok";
    for _ in 0..2 {
        stream.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        let response = read_exact(&mut stream, expected.len());
        assert_eq!(
            String::from_utf8_lossy(&response),
            String::from_utf8_lossy(expected),
        );
    }
}

#[test]
fn test_sync_application_on_worker_pool() {
    let app = SyncApplication::new(
        |_scope: Scope,
         mut rx: daphne::asgi::SyncEventReceiver,
         tx: daphne::asgi::SyncEventSender| {
            while let Some(event) = rx.recv() {
                if matches!(event, ServerEvent::HttpRequest { more_body: false, .. }) {
                    break;
                }
            }
            tx.send(AppEvent::ResponseStart {
                status: 200,
                headers: vec![(Bytes::from_static(b"content-length"), Bytes::from_static(b"4"))],
                trailers: false,
            })?;
            tx.send(AppEvent::ResponseBody {
                body: Bytes::from_static(b"sync"),
                more_body: false,
            })?;
            Ok(())
        },
    );
    let server = TestServer::spawn(quiet_config(), Arc::new(app)).unwrap();

    let mut stream = connect(&server);
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
        .unwrap();

    let response = String::from_utf8(read_until_close(&mut stream)).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "{response:?}");
    assert!(response.ends_with("sync"), "{response:?}");
}
