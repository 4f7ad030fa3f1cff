//! WebSocket connection driver.
//!
//! Entered from an HTTP upgrade. The 101 response is withheld until the
//! application answers `websocket.connect`; after that one task drives the
//! frame loop, the keepalive timers and the close handshake, bridging
//! reassembled messages inward and application sends outward.
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::frame::{self, OpCode};
use super::handshake;
use crate::access::WsAction;
use crate::asgi::{
    bridge_pair, AppEvent, BoxError, BridgeSender, CycleKind, Message, Scope, ServerEvent,
    WebSocketScope,
};
use crate::h1::driver::{scope_parts, write_empty_error, write_error_page};
use crate::h1::parser::RequestHead;
use crate::server::{join_app, reap_app, Conn};

/// Wait for the peer's close frame after sending ours.
const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) async fn serve<IO>(
    rd: &mut ReadHalf<IO>,
    wr: &mut WriteHalf<IO>,
    head: RequestHead,
    mut read_buf: BytesMut,
    mut conn: Conn,
) -> std::io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = conn.config();

    // ===== Handshake request =====

    let key = match handshake::validate(&head) {
        Ok(key) => key,
        Err(reason) => {
            log::info!("connection {}: bad websocket upgrade: {reason}", conn.id);
            return write_empty_error(wr, 400).await;
        }
    };

    let log_path = String::from_utf8_lossy(&head.target).into_owned();
    let scope = {
        let parts = scope_parts(&head, &conn);
        let scheme = match parts.scheme.as_str() {
            "https" | "wss" => "wss",
            _ => "ws",
        };
        Scope::WebSocket(WebSocketScope {
            http_version: head.version.as_str(),
            scheme: scheme.to_owned(),
            path: parts.path,
            raw_path: parts.raw_path,
            query_string: parts.query_string,
            root_path: parts.root_path,
            headers: parts.headers,
            subprotocols: handshake::subprotocols(&head),
            client: parts.client,
            server: parts.server,
        })
    };
    drop(head);

    if let Some(access) = &conn.state.access {
        access.ws_event(WsAction::Connecting, conn.client.as_ref(), &log_path);
    }

    // ===== Application =====

    let (mut btx, mut brx, rx, tx) = bridge_pair(CycleKind::WebSocket);
    let app = Arc::clone(&conn.state.app);
    let mut app_task = Some(tokio::spawn(app.call(scope, rx, tx)));
    let close_grace = config.application_close_timeout;

    if !btx.send(ServerEvent::WebSocketConnect).await {
        log::error!("connection {}: application dropped websocket.connect", conn.id);
        write_error_page(wr, 500, "Internal Server Error", "WebSocket processing error", &[])
            .await?;
        btx.disconnect(Some(1006));
        finish(&mut app_task, close_grace, conn.id);
        return Ok(());
    }

    // ===== Handshake reply =====

    let deadline = config.websocket_connect_timeout.map(|wait| Instant::now() + wait);
    let accepted = loop {
        tokio::select! {
            event = brx.recv() => match event {
                Some(AppEvent::Accept { subprotocol, headers }) => break (subprotocol, headers),
                Some(AppEvent::Close { code, .. }) => {
                    log::debug!("connection {}: websocket rejected by application", conn.id);
                    write_error_page(wr, 403, "Forbidden", "Access denied", &[]).await?;
                    if let Some(access) = &conn.state.access {
                        access.ws_event(WsAction::Rejected, conn.client.as_ref(), &log_path);
                    }
                    btx.disconnect(Some(code));
                    finish(&mut app_task, close_grace, conn.id);
                    return Ok(());
                }
                Some(event) => {
                    log::error!(
                        "connection {}: unexpected {} during websocket handshake",
                        conn.id,
                        event.kind(),
                    );
                    write_error_page(wr, 500, "Internal Server Error", "WebSocket processing error", &[]).await?;
                    btx.disconnect(Some(1006));
                    finish(&mut app_task, close_grace, conn.id);
                    return Ok(());
                }
                None => {
                    btx.disconnect(Some(1006));
                    let result = join_app(app_task.take().unwrap(), close_grace).await;
                    if let Err(err) = result {
                        log::error!("connection {}: application error: {err}", conn.id);
                    } else {
                        log::error!(
                            "connection {}: application ended without answering websocket.connect",
                            conn.id,
                        );
                    }
                    write_error_page(wr, 500, "Internal Server Error", "WebSocket processing error", &[]).await?;
                    if let Some(access) = &conn.state.access {
                        access.ws_event(WsAction::Rejected, conn.client.as_ref(), &log_path);
                    }
                    return Ok(());
                }
            },

            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                log::warn!(
                    "connection {}: websocket handshake timed out, rejecting",
                    conn.id,
                );
                write_error_page(wr, 403, "Forbidden", "Access denied", &[]).await?;
                if let Some(access) = &conn.state.access {
                    access.ws_event(WsAction::Rejected, conn.client.as_ref(), &log_path);
                }
                btx.disconnect(Some(1006));
                finish(&mut app_task, close_grace, conn.id);
                return Ok(());
            }

            read = rd.read_buf(&mut read_buf) => {
                if read? == 0 {
                    log::debug!("connection {}: closed during websocket handshake", conn.id);
                    btx.disconnect(Some(1006));
                    finish(&mut app_task, close_grace, conn.id);
                    return Ok(());
                }
            }
        }
    };

    let (chosen_subprotocol, accept_headers) = accepted;
    let mut out = BytesMut::with_capacity(256);
    handshake::encode_accept(
        &mut out,
        &key,
        chosen_subprotocol.as_deref(),
        &accept_headers,
        &config.server_name,
    );
    wr.write_all(&out).await?;
    wr.flush().await?;
    log::debug!("connection {}: websocket established", conn.id);
    if let Some(access) = &conn.state.access {
        access.ws_event(WsAction::Connected, conn.client.as_ref(), &log_path);
    }

    // ===== Frame loop =====

    let result = connected(rd, wr, &mut read_buf, &mut conn, &mut btx, &mut brx, &mut app_task)
        .await;

    if let Some(access) = &conn.state.access {
        access.ws_event(WsAction::Disconnected, conn.client.as_ref(), &log_path);
    }
    finish(&mut app_task, close_grace, conn.id);
    result
}

/// Whether and how a close frame already went out.
struct CloseSent {
    /// Code reported in `websocket.disconnect`.
    code: u16,
    /// Give up waiting for the peer's echo at this point.
    deadline: Instant,
}

#[allow(clippy::too_many_arguments)]
async fn connected<IO>(
    rd: &mut ReadHalf<IO>,
    wr: &mut WriteHalf<IO>,
    read_buf: &mut BytesMut,
    conn: &mut Conn,
    btx: &mut BridgeSender,
    brx: &mut crate::asgi::BridgeReceiver,
    app_task: &mut Option<JoinHandle<Result<(), BoxError>>>,
) -> std::io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let max_message = conn.config().websocket_max_message_size;
    let ping_interval = conn.config().ping_interval;
    let ping_timeout = conn.config().ping_timeout;
    let close_grace = conn.config().application_close_timeout;

    let opened = Instant::now();
    let expiry = conn.config().websocket_timeout.map(|t| opened + t);

    let mut pending: Option<ServerEvent> = None;
    let mut pending_since: Option<Instant> = None;
    let mut fragments: Option<(OpCode, BytesMut)> = None;
    let mut last_incoming = Instant::now();
    let mut pinged = false;
    let mut ping_counter: u64 = 0;
    let mut closing: Option<CloseSent> = None;
    let mut app_done = false;
    let mut write_buf = BytesMut::with_capacity(256);

    loop {
        // ===== Parse buffered frames =====

        while pending.is_none() {
            let parsed = match frame::parse(read_buf, max_message) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => break,
                Err(err) => {
                    log::info!("connection {}: websocket protocol error: {err}", conn.id);
                    let code = err.close_code();
                    send_close(wr, &mut write_buf, code, None).await?;
                    btx.disconnect(Some(code));
                    return Ok(());
                }
            };

            if closing.is_some() && parsed.opcode != OpCode::Close {
                // data after our close frame is discarded
                continue;
            }

            match parsed.opcode {
                OpCode::Ping => {
                    write_buf.clear();
                    frame::encode(true, OpCode::Pong, &parsed.payload, &mut write_buf);
                    wr.write_all(&write_buf).await?;
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    let code = match frame::parse_close(&parsed.payload) {
                        Ok(payload) => payload.code,
                        Err(err) => {
                            log::info!(
                                "connection {}: bad close frame: {err}",
                                conn.id,
                            );
                            if closing.is_none() {
                                send_close(wr, &mut write_buf, 1002, None).await?;
                            }
                            btx.disconnect(Some(1002));
                            return Ok(());
                        }
                    };
                    let report = match closing.take() {
                        // the peer echoed our close
                        Some(sent) => sent.code,
                        None => {
                            write_buf.clear();
                            if code == 1005 {
                                frame::encode(true, OpCode::Close, &[], &mut write_buf);
                            } else {
                                frame::encode_close(code, None, &mut write_buf);
                            }
                            wr.write_all(&write_buf).await?;
                            wr.flush().await?;
                            code
                        }
                    };
                    btx.disconnect(Some(report));
                    return Ok(());
                }
                OpCode::Text | OpCode::Binary => {
                    if fragments.is_some() {
                        send_close(wr, &mut write_buf, 1002, None).await?;
                        btx.disconnect(Some(1002));
                        return Ok(());
                    }
                    if parsed.fin {
                        match assemble(parsed.opcode, parsed.payload) {
                            Ok(message) => {
                                pending = Some(ServerEvent::WebSocketReceive(message));
                                pending_since = Some(Instant::now());
                            }
                            Err(code) => {
                                send_close(wr, &mut write_buf, code, None).await?;
                                btx.disconnect(Some(code));
                                return Ok(());
                            }
                        }
                    } else {
                        fragments = Some((parsed.opcode, parsed.payload));
                    }
                }
                OpCode::Continuation => {
                    let Some((opcode, mut buffered)) = fragments.take() else {
                        send_close(wr, &mut write_buf, 1002, None).await?;
                        btx.disconnect(Some(1002));
                        return Ok(());
                    };
                    if buffered.len() + parsed.payload.len() > max_message {
                        send_close(wr, &mut write_buf, 1009, None).await?;
                        btx.disconnect(Some(1009));
                        return Ok(());
                    }
                    buffered.extend_from_slice(&parsed.payload);
                    if parsed.fin {
                        match assemble(opcode, buffered) {
                            Ok(message) => {
                                pending = Some(ServerEvent::WebSocketReceive(message));
                                pending_since = Some(Instant::now());
                            }
                            Err(code) => {
                                send_close(wr, &mut write_buf, code, None).await?;
                                btx.disconnect(Some(code));
                                return Ok(());
                            }
                        }
                    } else {
                        fragments = Some((opcode, buffered));
                    }
                }
            }
        }

        // ===== Timers =====

        let mut wake = match pending_since {
            // receive backpressure stall deadline
            Some(since) => since + ping_timeout,
            None => last_incoming + ping_timeout,
        };
        if !pinged && closing.is_none() {
            wake = wake.min(last_incoming + ping_interval);
        }
        if let Some(expiry) = expiry {
            wake = wake.min(expiry);
        }
        if let Some(sent) = &closing {
            wake = wake.min(sent.deadline);
        }

        tokio::select! {
            permit = btx.reserve(), if pending.is_some() => {
                match permit {
                    Some(permit) => {
                        permit.send(pending.take().unwrap());
                    }
                    // application stopped receiving
                    None => pending = None,
                }
                pending_since = None;
            }

            read = rd.read_buf(read_buf), if pending.is_none() => {
                if read? == 0 {
                    log::debug!("connection {}: websocket transport lost", conn.id);
                    let code = closing.take().map(|sent| sent.code).unwrap_or(1006);
                    btx.disconnect(Some(code));
                    return Ok(());
                }
                last_incoming = Instant::now();
                pinged = false;
            }

            event = brx.recv(), if !app_done => match event {
                Some(AppEvent::Send(message)) => {
                    if closing.is_none() {
                        write_buf.clear();
                        match &message {
                            Message::Text(text) => {
                                frame::encode(true, OpCode::Text, text.as_bytes(), &mut write_buf)
                            }
                            Message::Binary(data) => {
                                frame::encode(true, OpCode::Binary, data, &mut write_buf)
                            }
                        }
                        wr.write_all(&write_buf).await?;
                        wr.flush().await?;
                    }
                }
                Some(AppEvent::Close { code, reason }) => {
                    if closing.is_none() {
                        send_close(wr, &mut write_buf, code, reason.as_deref()).await?;
                        closing = Some(CloseSent {
                            code,
                            deadline: Instant::now() + CLOSE_HANDSHAKE_TIMEOUT,
                        });
                    }
                }
                Some(event) => {
                    log::error!(
                        "connection {}: unexpected {} on open websocket",
                        conn.id,
                        event.kind(),
                    );
                }
                None => {
                    app_done = true;
                    let result = join_app(app_task.take().unwrap(), close_grace).await;
                    let code = match result {
                        Ok(()) => 1000,
                        Err(err) => {
                            log::error!("connection {}: application error: {err}", conn.id);
                            1011
                        }
                    };
                    if closing.is_none() {
                        send_close(wr, &mut write_buf, code, None).await?;
                        closing = Some(CloseSent {
                            code,
                            deadline: Instant::now() + CLOSE_HANDSHAKE_TIMEOUT,
                        });
                    }
                }
            },

            _ = conn.shutdown.changed(), if closing.is_none() => {
                log::debug!("connection {}: closing websocket for shutdown", conn.id);
                send_close(wr, &mut write_buf, 1001, None).await?;
                closing = Some(CloseSent {
                    code: 1001,
                    deadline: Instant::now() + CLOSE_HANDSHAKE_TIMEOUT,
                });
            }

            _ = tokio::time::sleep_until(wake) => {
                let now = Instant::now();

                if closing.as_ref().is_some_and(|sent| now >= sent.deadline) {
                    // peer never echoed the close
                    let code = closing.take().unwrap().code;
                    btx.disconnect(Some(code));
                    return Ok(());
                }

                if let Some(since) = pending_since {
                    if now >= since + ping_timeout {
                        // the application is not consuming, ask the peer to retry later
                        log::warn!(
                            "connection {}: websocket receive backpressure, closing",
                            conn.id,
                        );
                        if closing.is_none() {
                            send_close(wr, &mut write_buf, 1013, None).await?;
                        }
                        btx.disconnect(Some(1013));
                        return Ok(());
                    }
                }

                if now >= last_incoming + ping_timeout && pending_since.is_none() {
                    log::info!("connection {}: websocket ping timeout", conn.id);
                    if closing.is_none() {
                        send_close(wr, &mut write_buf, 1011, None).await?;
                    }
                    btx.disconnect(Some(1011));
                    return Ok(());
                }

                if let Some(expiry) = expiry {
                    if now >= expiry && closing.is_none() {
                        // accommodate channel-layer group expiry
                        log::debug!("connection {}: websocket lifetime expired", conn.id);
                        send_close(wr, &mut write_buf, 1000, None).await?;
                        closing = Some(CloseSent {
                            code: 1000,
                            deadline: now + CLOSE_HANDSHAKE_TIMEOUT,
                        });
                    }
                }

                if closing.is_none() && !pinged && now >= last_incoming + ping_interval {
                    write_buf.clear();
                    let mut digits = itoa::Buffer::new();
                    frame::encode(
                        true,
                        OpCode::Ping,
                        digits.format(ping_counter).as_bytes(),
                        &mut write_buf,
                    );
                    wr.write_all(&write_buf).await?;
                    wr.flush().await?;
                    ping_counter += 1;
                    pinged = true;
                }
            }
        }
    }
}

fn assemble(opcode: OpCode, payload: BytesMut) -> Result<Message, u16> {
    match opcode {
        OpCode::Text => match String::from_utf8(payload.to_vec()) {
            Ok(text) => Ok(Message::Text(text)),
            // invalid UTF-8 in a text message
            Err(_) => Err(1007),
        },
        OpCode::Binary => Ok(Message::Binary(payload.freeze())),
        _ => Err(1002),
    }
}

async fn send_close<W>(
    wr: &mut W,
    write_buf: &mut BytesMut,
    code: u16,
    reason: Option<&str>,
) -> std::io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    write_buf.clear();
    frame::encode_close(code, reason, write_buf);
    wr.write_all(write_buf).await?;
    wr.flush().await
}

fn finish(
    app_task: &mut Option<JoinHandle<Result<(), BoxError>>>,
    grace: Duration,
    conn_id: u64,
) {
    if let Some(task) = app_task.take() {
        reap_app(task, grace, conn_id);
    }
}
