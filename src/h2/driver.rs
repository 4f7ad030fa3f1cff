//! HTTP/2 connection driver.
//!
//! One task multiplexes every stream of the connection: it parses frames,
//! answers SETTINGS/PING, spawns an independent request cycle per
//! HEADERS-opened stream and writes responses under flow control. Reached
//! through ALPN on TLS listeners or by prior-knowledge preface on
//! plaintext ones.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};

use super::flow::Window;
use super::frame::{self, ErrorCode, Type};
use super::hpack;
use super::settings::Settings;
use super::stream::{Phase, Stream};
use crate::asgi::{bridge_pair, AppEvent, CycleKind, HttpScope, Scope, ServerEvent};
use crate::h1::driver::assemble_scope;
use crate::server::{reap_app, Conn};

const PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Accumulated HEADERS+CONTINUATION cap.
const MAX_HEADER_BLOCK: usize = 64 * 1024;
/// Response bytes buffered beyond flow control before a stream is reset.
const MAX_PENDING_OUT: usize = 1024 * 1024;

enum Mux {
    Event(u32, AppEvent),
    Closed(u32),
}

/// A HEADERS frame awaiting its CONTINUATIONs.
struct Partial {
    stream_id: u32,
    end_stream: bool,
    block: BytesMut,
}

enum H2Error {
    /// Connection error: GOAWAY with this code, then close.
    Conn(ErrorCode, &'static str),
    Io(std::io::Error),
    /// Peer vanished without GOAWAY.
    TransportLost,
}

impl From<std::io::Error> for H2Error {
    fn from(err: std::io::Error) -> Self {
        H2Error::Io(err)
    }
}

struct ConnState {
    streams: HashMap<u32, Stream>,
    decoder: hpack::Decoder,
    encoder: hpack::Encoder,
    /// Peer's settings, defaults until its SETTINGS frame arrives.
    peer: Settings,
    /// Settings we advertised.
    ours: Settings,
    conn_window: Window,
    highest_stream: u32,
    shutting: bool,
    continuation: Option<Partial>,
    mux_tx: mpsc::Sender<Mux>,
}

pub(crate) async fn serve<IO>(io: IO, conn: Conn)
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(io);
    if let Err(err) = serve_buffered(&mut rd, &mut wr, BytesMut::with_capacity(1024), conn).await
    {
        log::debug!("http2 connection closed: {err}");
    }
    let _ = wr.shutdown().await;
}

/// Entry from the HTTP/1.1 driver once it has seen the client preface;
/// `read_buf` holds whatever arrived so far.
pub(crate) async fn serve_buffered<IO>(
    rd: &mut ReadHalf<IO>,
    wr: &mut WriteHalf<IO>,
    mut read_buf: BytesMut,
    mut conn: Conn,
) -> std::io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    // ===== Preface =====

    let deadline = Instant::now() + conn.config().connect_timeout;
    loop {
        let have = read_buf.len().min(PREFACE.len());
        if !PREFACE.starts_with(&read_buf[..have]) {
            log::info!("connection {}: bad http2 preface", conn.id);
            return Ok(());
        }
        if read_buf.len() >= PREFACE.len() {
            break;
        }
        match timeout_at(deadline, rd.read_buf(&mut read_buf)).await {
            Ok(Ok(0)) | Err(_) => return Ok(()),
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err),
        }
    }
    read_buf.advance(PREFACE.len());

    // ===== Our SETTINGS =====

    let ours = Settings::server();
    let mut payload = BytesMut::new();
    ours.encode(&mut payload);
    let mut write_buf = BytesMut::with_capacity(payload.len() + frame::Header::SIZE);
    frame::encode(Type::Settings, 0, 0, &payload, &mut write_buf);
    wr.write_all(&write_buf).await?;

    let (mux_tx, mut mux_rx) = mpsc::channel(64);
    let mut state = ConnState {
        streams: HashMap::new(),
        decoder: hpack::Decoder::new(ours.header_table_size as usize),
        encoder: hpack::Encoder::new(),
        peer: Settings::new(),
        ours,
        conn_window: Window::new(65535),
        highest_stream: 0,
        shutting: false,
        continuation: None,
        mux_tx,
    };

    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_activity = Instant::now();

    // ===== Multiplex =====

    let result: Result<(), H2Error> = 'conn: loop {
        if state.shutting && state.streams.is_empty() {
            break Ok(());
        }

        tokio::select! {
            read = rd.read_buf(&mut read_buf) => {
                match read {
                    Ok(0) => break Err(H2Error::TransportLost),
                    Ok(_) => {}
                    Err(err) => break Err(err.into()),
                }
                last_activity = Instant::now();
                loop {
                    match frame::parse(&mut read_buf, state.ours.max_frame_size) {
                        Ok(Some(parsed)) => {
                            if let Err(err) = handle_frame(parsed, &mut state, &conn, wr).await {
                                break 'conn Err(err);
                            }
                        }
                        Ok(None) => break,
                        Err(_) => {
                            break 'conn Err(H2Error::Conn(
                                ErrorCode::FrameSize,
                                "frame exceeds maximum frame size",
                            ));
                        }
                    }
                }
            }

            event = mux_rx.recv() => {
                // state holds a sender, the channel cannot close
                let event = event.expect("mux channel closed");
                let outcome = match event {
                    Mux::Event(id, event) => handle_app_event(id, event, &mut state, &conn, wr).await,
                    Mux::Closed(id) => handle_app_closed(id, &mut state, &conn, wr).await,
                };
                if let Err(err) = outcome {
                    break Err(err);
                }
            }

            _ = conn.shutdown.changed(), if !state.shutting => {
                log::debug!("connection {}: sending GOAWAY for shutdown", conn.id);
                state.shutting = true;
                if let Err(err) = write_goaway(wr, state.highest_stream, ErrorCode::NoError).await {
                    break Err(err.into());
                }
            }

            _ = tick.tick() => {
                if state.streams.is_empty()
                    && last_activity.elapsed() >= conn.config().idle_timeout
                {
                    let _ = write_goaway(wr, state.highest_stream, ErrorCode::NoError).await;
                    break Ok(());
                }
                if let Some(wait) = conn.config().http_timeout {
                    if let Err(err) = sweep_timeouts(wait, &mut state, &conn, wr).await {
                        break Err(err);
                    }
                }
            }
        }
    };

    // ===== Teardown =====

    match &result {
        Ok(()) => {}
        Err(H2Error::Conn(code, context)) => {
            log::info!("connection {}: http2 connection error: {context}", conn.id);
            let _ = write_goaway(wr, state.highest_stream, *code).await;
        }
        Err(H2Error::TransportLost) => {
            log::debug!("connection {}: client disconnected", conn.id);
        }
        Err(H2Error::Io(err)) => {
            log::debug!("connection {}: {err}", conn.id);
        }
    }

    let close_grace = conn.config().application_close_timeout;
    for (_, mut stream) in state.streams.drain() {
        stream.btx.disconnect(None);
        if let Some(task) = stream.app_task.take() {
            reap_app(task, close_grace, conn.id);
        }
    }

    match result {
        Err(H2Error::Io(err)) => Err(err),
        _ => Ok(()),
    }
}

// ===== Frame handling =====

async fn handle_frame<IO>(
    parsed: frame::Frame,
    state: &mut ConnState,
    conn: &Conn,
    wr: &mut WriteHalf<IO>,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let header = parsed.header;
    let mut payload = parsed.payload;

    // a field block owns the connection until END_HEADERS
    if state.continuation.is_some() && header.frame_type() != Some(Type::Continuation) {
        return Err(H2Error::Conn(
            ErrorCode::Protocol,
            "frame interleaved in a field block",
        ));
    }

    let Some(ty) = header.frame_type() else {
        // unknown frame types are ignored and discarded
        return Ok(());
    };

    match ty {
        Type::Settings => {
            if header.stream_id != 0 {
                return Err(H2Error::Conn(ErrorCode::Protocol, "settings on a stream"));
            }
            if header.has(frame::FLAG_ACK) {
                if !payload.is_empty() {
                    return Err(H2Error::Conn(ErrorCode::FrameSize, "settings ack with payload"));
                }
                return Ok(());
            }
            let old_initial = state.peer.initial_window_size;
            if let Err(err) = state.peer.apply(&payload) {
                log::info!("connection {}: {err}", conn.id);
                return Err(H2Error::Conn(ErrorCode::Protocol, "invalid settings"));
            }
            let new_initial = state.peer.initial_window_size;
            if old_initial != new_initial {
                for stream in state.streams.values_mut() {
                    stream.send_window.adjust(old_initial, new_initial);
                }
            }
            write_frame(wr, Type::Settings, frame::FLAG_ACK, 0, &[]).await?;
            flush_streams(state, conn, wr).await?;
        }

        Type::Ping => {
            if header.stream_id != 0 {
                return Err(H2Error::Conn(ErrorCode::Protocol, "ping on a stream"));
            }
            if payload.len() != 8 {
                return Err(H2Error::Conn(ErrorCode::FrameSize, "ping payload not 8 octets"));
            }
            if !header.has(frame::FLAG_ACK) {
                write_frame(wr, Type::Ping, frame::FLAG_ACK, 0, &payload).await?;
            }
        }

        Type::WindowUpdate => {
            if payload.len() != 4 {
                return Err(H2Error::Conn(
                    ErrorCode::FrameSize,
                    "window update payload not 4 octets",
                ));
            }
            let increment = u32::from_be_bytes(payload[..4].try_into().unwrap()) & 0x7fff_ffff;
            if header.stream_id == 0 {
                if state.conn_window.expand(increment).is_err() {
                    return Err(H2Error::Conn(
                        ErrorCode::FlowControl,
                        "connection window overflow",
                    ));
                }
                flush_streams(state, conn, wr).await?;
            } else if let Some(stream) = state.streams.get_mut(&header.stream_id) {
                if stream.send_window.expand(increment).is_err() {
                    write_frame(
                        wr,
                        Type::RstStream,
                        0,
                        header.stream_id,
                        &(ErrorCode::FlowControl as u32).to_be_bytes(),
                    )
                    .await?;
                    cancel_stream(header.stream_id, state, conn);
                    return Ok(());
                }
                flush_one(header.stream_id, state, conn, wr).await?;
            }
        }

        Type::RstStream => {
            if payload.len() != 4 {
                return Err(H2Error::Conn(
                    ErrorCode::FrameSize,
                    "rst stream payload not 4 octets",
                ));
            }
            if header.stream_id == 0 {
                return Err(H2Error::Conn(ErrorCode::Protocol, "rst on stream zero"));
            }
            cancel_stream(header.stream_id, state, conn);
        }

        Type::GoAway => {
            log::debug!("connection {}: peer sent GOAWAY", conn.id);
            state.shutting = true;
        }

        Type::Priority => {}

        Type::PushPromise => {
            return Err(H2Error::Conn(ErrorCode::Protocol, "push promise from client"));
        }

        Type::Headers => {
            if header.stream_id == 0 || header.stream_id % 2 == 0 {
                return Err(H2Error::Conn(ErrorCode::Protocol, "bad stream id in headers"));
            }
            if header.has(frame::FLAG_PADDED) {
                strip_padding(&mut payload)?;
            }
            if header.has(frame::FLAG_PRIORITY) {
                if payload.len() < 5 {
                    return Err(H2Error::Conn(ErrorCode::FrameSize, "short priority section"));
                }
                payload.advance(5);
            }
            let partial = Partial {
                stream_id: header.stream_id,
                end_stream: header.has(frame::FLAG_END_STREAM),
                block: payload,
            };
            if header.has(frame::FLAG_END_HEADERS) {
                open_stream(partial, state, conn, wr).await?;
            } else {
                state.continuation = Some(partial);
            }
        }

        Type::Continuation => {
            let Some(mut partial) = state.continuation.take() else {
                return Err(H2Error::Conn(ErrorCode::Protocol, "unexpected continuation"));
            };
            if partial.stream_id != header.stream_id {
                return Err(H2Error::Conn(ErrorCode::Protocol, "continuation stream mismatch"));
            }
            if partial.block.len() + payload.len() > MAX_HEADER_BLOCK {
                return Err(H2Error::Conn(ErrorCode::EnhanceYourCalm, "field block too large"));
            }
            partial.block.extend_from_slice(&payload);
            if header.has(frame::FLAG_END_HEADERS) {
                open_stream(partial, state, conn, wr).await?;
            } else {
                state.continuation = Some(partial);
            }
        }

        Type::Data => {
            if header.has(frame::FLAG_PADDED) {
                strip_padding(&mut payload)?;
            }
            let end_stream = header.has(frame::FLAG_END_STREAM);
            let id = header.stream_id;

            let Some(stream) = state.streams.get_mut(&id) else {
                // stream already finished on our side, keep the peer's
                // flow-control account level and move on
                replenish(wr, 0, header.len).await?;
                return Ok(());
            };
            if !stream.inbound_open {
                return Err(H2Error::Conn(ErrorCode::StreamClosed, "data on closed stream"));
            }

            if end_stream {
                stream.inbound_open = false;
            }
            let event = ServerEvent::HttpRequest {
                body: payload.freeze(),
                more_body: !end_stream,
            };
            // bounded by the stream window the peer spent to send this
            let _ = stream.btx.send(event).await;

            replenish(wr, 0, header.len).await?;
            if state.streams.contains_key(&id) && !end_stream {
                replenish(wr, id, header.len).await?;
            }
        }
    }

    Ok(())
}

/// Removes pad-length octet and trailing padding.
fn strip_padding(payload: &mut BytesMut) -> Result<(), H2Error> {
    let Some(&pad) = payload.first() else {
        return Err(H2Error::Conn(ErrorCode::Protocol, "missing pad length"));
    };
    if pad as usize >= payload.len() {
        return Err(H2Error::Conn(ErrorCode::Protocol, "padding exceeds payload"));
    }
    payload.advance(1);
    payload.truncate(payload.len() - pad as usize);
    Ok(())
}

/// WINDOW_UPDATE giving back consumed receive window.
async fn replenish<IO>(
    wr: &mut WriteHalf<IO>,
    stream_id: u32,
    amount: u32,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    if amount == 0 {
        return Ok(());
    }
    write_frame(wr, Type::WindowUpdate, 0, stream_id, &amount.to_be_bytes()).await?;
    Ok(())
}

// ===== Stream open =====

async fn open_stream<IO>(
    partial: Partial,
    state: &mut ConnState,
    conn: &Conn,
    wr: &mut WriteHalf<IO>,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let id = partial.stream_id;
    if id <= state.highest_stream {
        return Err(H2Error::Conn(ErrorCode::Protocol, "stream id not increasing"));
    }
    state.highest_stream = id;

    let fields = match state.decoder.decode_block(partial.block.freeze()) {
        Ok(fields) => fields,
        Err(err) => {
            log::info!("connection {}: hpack error: {err}", conn.id);
            return Err(H2Error::Conn(ErrorCode::Compression, "field block decoding failed"));
        }
    };

    if state.shutting
        || state
            .ours
            .max_concurrent_streams
            .is_some_and(|max| state.streams.len() as u32 >= max)
    {
        write_frame(
            wr,
            Type::RstStream,
            0,
            id,
            &(ErrorCode::RefusedStream as u32).to_be_bytes(),
        )
        .await?;
        return Ok(());
    }

    let request = match split_pseudo(fields) {
        Ok(request) => request,
        Err(reason) => {
            log::info!("connection {}: malformed http2 request: {reason}", conn.id);
            write_frame(
                wr,
                Type::RstStream,
                0,
                id,
                &(ErrorCode::Protocol as u32).to_be_bytes(),
            )
            .await?;
            return Ok(());
        }
    };

    // ===== Scope and application task =====

    let target = Bytes::from(request.path.clone());
    let mut parts = assemble_scope(&target, &request.fields, conn);
    if !matches!(request.scheme.as_str(), "" | "http" | "https") {
        parts.scheme = request.scheme.clone();
    }
    let scope = HttpScope {
        http_version: "2",
        method: request.method.to_ascii_uppercase(),
        scheme: parts.scheme,
        path: parts.path,
        raw_path: parts.raw_path,
        query_string: parts.query_string,
        root_path: parts.root_path,
        headers: parts.headers,
        client: parts.client,
        server: parts.server,
    };

    let (btx, mut brx, rx, tx) = bridge_pair(CycleKind::Http);
    let app = Arc::clone(&conn.state.app);
    let app_task = tokio::spawn(app.call(Scope::Http(scope), rx, tx));

    let mux = state.mux_tx.clone();
    tokio::spawn(async move {
        while let Some(event) = brx.recv().await {
            if mux.send(Mux::Event(id, event)).await.is_err() {
                return;
            }
        }
        let _ = mux.send(Mux::Closed(id)).await;
    });

    let mut stream = Stream::new(
        btx,
        state.peer.initial_window_size,
        request.method,
        request.path,
    );
    stream.app_task = Some(app_task);

    if partial.end_stream {
        stream.inbound_open = false;
        let _ = stream
            .btx
            .send(ServerEvent::HttpRequest { body: Bytes::new(), more_body: false })
            .await;
    }

    state.streams.insert(id, stream);
    Ok(())
}

struct PseudoRequest {
    method: String,
    path: String,
    scheme: String,
    fields: Vec<(Bytes, Bytes)>,
}

/// Splits pseudo fields from regular ones, enforcing RFC 9113 section
/// 8.3 ordering and the connection-specific field ban.
fn split_pseudo(fields: Vec<(Bytes, Bytes)>) -> Result<PseudoRequest, &'static str> {
    let mut method = None;
    let mut path = None;
    let mut scheme = None;
    let mut authority: Option<Bytes> = None;
    let mut regular: Vec<(Bytes, Bytes)> = Vec::with_capacity(fields.len());

    for (name, value) in fields {
        if name.starts_with(b":") {
            if !regular.is_empty() {
                return Err("pseudo field after regular field");
            }
            let slot = match name.as_ref() {
                b":method" => &mut method,
                b":path" => &mut path,
                b":scheme" => &mut scheme,
                b":authority" => &mut authority,
                _ => return Err("unknown pseudo field"),
            };
            if slot.is_some() {
                return Err("duplicate pseudo field");
            }
            *slot = Some(value);
        } else {
            if name.iter().any(|&b| b.is_ascii_uppercase()) {
                return Err("uppercase field name");
            }
            if name.as_ref() == b"connection"
                || name.as_ref() == b"keep-alive"
                || name.as_ref() == b"proxy-connection"
                || name.as_ref() == b"transfer-encoding"
                || name.as_ref() == b"upgrade"
            {
                return Err("connection-specific field");
            }
            if name.as_ref() == b"te" && value.as_ref() != b"trailers" {
                return Err("te other than trailers");
            }
            regular.push((name, value));
        }
    }

    let method = method.ok_or("missing :method")?;
    let path = path.ok_or("missing :path")?;
    let scheme = scheme.ok_or("missing :scheme")?;
    if path.is_empty() {
        return Err("empty :path");
    }
    if method.as_ref() == b"CONNECT" {
        return Err("connect not supported");
    }

    // :authority stands in for the host header
    if let Some(authority) = authority {
        if !regular.iter().any(|(name, _)| name.as_ref() == b"host") {
            regular.insert(0, (Bytes::from_static(b"host"), authority));
        }
    }

    Ok(PseudoRequest {
        method: String::from_utf8(method.to_vec()).map_err(|_| "non-ascii :method")?,
        path: String::from_utf8(path.to_vec()).map_err(|_| "non-ascii :path")?,
        scheme: String::from_utf8(scheme.to_vec()).map_err(|_| "non-ascii :scheme")?,
        fields: regular,
    })
}

// ===== Application events =====

async fn handle_app_event<IO>(
    id: u32,
    event: AppEvent,
    state: &mut ConnState,
    conn: &Conn,
    wr: &mut WriteHalf<IO>,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let Some(stream) = state.streams.get_mut(&id) else {
        // stream already reset, late events are dropped
        return Ok(());
    };

    match event {
        AppEvent::ResponseStart { status, headers, trailers: _ } => {
            if stream.phase != Phase::AwaitStart {
                log::error!("connection {}: duplicate response start on stream {id}", conn.id);
                reset_stream(id, state, conn, wr, ErrorCode::Internal).await?;
                return Ok(());
            }
            stream.phase = Phase::Body;
            stream.status = status;

            let mut filtered = Vec::with_capacity(headers.len() + 1);
            for (name, value) in headers {
                // connection-specific fields do not exist in http2
                if name.eq_ignore_ascii_case(b"connection")
                    || name.eq_ignore_ascii_case(b"keep-alive")
                    || name.eq_ignore_ascii_case(b"transfer-encoding")
                    || name.eq_ignore_ascii_case(b"upgrade")
                {
                    continue;
                }
                filtered.push((name, value));
            }
            if !conn.config().server_name.is_empty() {
                filtered.push((
                    Bytes::from_static(b"server"),
                    Bytes::from(conn.config().server_name.clone().into_bytes()),
                ));
            }

            let mut block = BytesMut::with_capacity(256);
            state.encoder.encode_response(status, &filtered, &mut block);
            write_field_block(wr, id, &block, state.peer.max_frame_size as usize, false).await?;
        }

        AppEvent::ResponseBody { body, more_body } => {
            if stream.phase != Phase::Body {
                log::error!(
                    "connection {}: response body before start on stream {id}",
                    conn.id,
                );
                reset_stream(id, state, conn, wr, ErrorCode::Internal).await?;
                return Ok(());
            }
            if stream.pending_out.len() + body.len() > MAX_PENDING_OUT {
                log::warn!(
                    "connection {}: stream {id} response backpressure overrun",
                    conn.id,
                );
                reset_stream(id, state, conn, wr, ErrorCode::EnhanceYourCalm).await?;
                return Ok(());
            }
            stream.pending_out.extend_from_slice(&body);
            stream.written += body.len() as u64;
            if !more_body {
                stream.end_pending = true;
            }
            flush_one(id, state, conn, wr).await?;
        }

        event => {
            log::error!(
                "connection {}: unexpected {} event on http2 stream {id}",
                conn.id,
                event.kind(),
            );
            reset_stream(id, state, conn, wr, ErrorCode::Internal).await?;
        }
    }

    Ok(())
}

async fn handle_app_closed<IO>(
    id: u32,
    state: &mut ConnState,
    conn: &Conn,
    wr: &mut WriteHalf<IO>,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let Some(stream) = state.streams.get_mut(&id) else {
        return Ok(());
    };

    match stream.phase {
        Phase::AwaitStart => {
            log::error!(
                "connection {}: application ended without a response on stream {id}",
                conn.id,
            );
            stream.status = 500;
            let mut block = BytesMut::with_capacity(64);
            let server_name = conn.config().server_name.clone();
            let mut fields = vec![(
                Bytes::from_static(b"content-length"),
                Bytes::from_static(b"0"),
            )];
            if !server_name.is_empty() {
                fields.push((Bytes::from_static(b"server"), Bytes::from(server_name.into_bytes())));
            }
            state.encoder.encode_response(500, &fields, &mut block);
            write_field_block(wr, id, &block, state.peer.max_frame_size as usize, true).await?;
            finish_stream(id, state, conn);
        }
        Phase::Body if stream.end_pending => {
            // response already complete, the task just returned
            flush_one(id, state, conn, wr).await?;
        }
        Phase::Body => {
            log::error!(
                "connection {}: application dropped mid response on stream {id}",
                conn.id,
            );
            reset_stream(id, state, conn, wr, ErrorCode::Internal).await?;
        }
    }
    Ok(())
}

// ===== Writing =====

async fn write_frame<IO>(
    wr: &mut WriteHalf<IO>,
    ty: Type,
    flags: u8,
    stream_id: u32,
    payload: &[u8],
) -> std::io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut out = BytesMut::with_capacity(frame::Header::SIZE + payload.len());
    frame::encode(ty, flags, stream_id, payload, &mut out);
    wr.write_all(&out).await?;
    wr.flush().await
}

/// HEADERS plus CONTINUATIONs for a field block of any size.
async fn write_field_block<IO>(
    wr: &mut WriteHalf<IO>,
    stream_id: u32,
    block: &[u8],
    max_frame: usize,
    end_stream: bool,
) -> std::io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut chunks = block.chunks(max_frame.max(1)).peekable();
    let mut first = true;
    loop {
        let chunk = chunks.next().unwrap_or(&[]);
        let last = chunks.peek().is_none();
        let ty = if first { Type::Headers } else { Type::Continuation };
        let mut flags = 0;
        if first && end_stream {
            flags |= frame::FLAG_END_STREAM;
        }
        if last {
            flags |= frame::FLAG_END_HEADERS;
        }
        write_frame(wr, ty, flags, stream_id, chunk).await?;
        first = false;
        if last {
            break;
        }
    }
    Ok(())
}

async fn write_goaway<IO>(
    wr: &mut WriteHalf<IO>,
    last_stream: u32,
    code: ErrorCode,
) -> std::io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut payload = [0u8; 8];
    payload[..4].copy_from_slice(&(last_stream & 0x7fff_ffff).to_be_bytes());
    payload[4..].copy_from_slice(&(code as u32).to_be_bytes());
    write_frame(wr, Type::GoAway, 0, 0, &payload).await
}

/// Writes as much pending response body as the windows allow; finishes
/// the stream once everything is out.
async fn flush_one<IO>(
    id: u32,
    state: &mut ConnState,
    conn: &Conn,
    wr: &mut WriteHalf<IO>,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let max_frame = state.peer.max_frame_size as usize;
    loop {
        let (chunk, last) = {
            let Some(stream) = state.streams.get_mut(&id) else {
                return Ok(());
            };
            if stream.pending_out.is_empty() {
                if !stream.end_pending {
                    return Ok(());
                }
                (BytesMut::new(), true)
            } else {
                let want = stream.pending_out.len().min(max_frame);
                let allowed = state.conn_window.available(stream.send_window.available(want));
                if allowed == 0 {
                    return Ok(());
                }
                state.conn_window.consume(allowed);
                stream.send_window.consume(allowed);
                let chunk = stream.pending_out.split_to(allowed);
                (chunk, stream.end_pending && stream.pending_out.is_empty())
            }
        };

        let flags = if last { frame::FLAG_END_STREAM } else { 0 };
        write_frame(wr, Type::Data, flags, id, &chunk).await?;
        if last {
            finish_stream(id, state, conn);
            return Ok(());
        }
    }
}

async fn flush_streams<IO>(
    state: &mut ConnState,
    conn: &Conn,
    wr: &mut WriteHalf<IO>,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let ids: Vec<u32> = state
        .streams
        .iter()
        .filter(|(_, stream)| !stream.pending_out.is_empty() || stream.end_pending)
        .map(|(&id, _)| id)
        .collect();
    for id in ids {
        flush_one(id, state, conn, wr).await?;
    }
    Ok(())
}

// ===== Stream teardown =====

/// Normal completion: response fully written.
fn finish_stream(id: u32, state: &mut ConnState, conn: &Conn) {
    let Some(mut stream) = state.streams.remove(&id) else {
        return;
    };
    stream.btx.disconnect(None);
    if let Some(task) = stream.app_task.take() {
        reap_app(task, conn.config().application_close_timeout, conn.id);
    }
    if let Some(access) = &conn.state.access {
        access.http_complete(
            conn.client.as_ref(),
            &stream.method,
            &stream.target,
            stream.status,
            stream.written,
        );
    }
}

/// Abnormal teardown after a peer reset or local error; no access log
/// status beyond what was recorded.
fn cancel_stream(id: u32, state: &mut ConnState, conn: &Conn) {
    let Some(mut stream) = state.streams.remove(&id) else {
        return;
    };
    stream.btx.disconnect(None);
    if let Some(task) = stream.app_task.take() {
        reap_app(task, conn.config().application_close_timeout, conn.id);
    }
}

async fn reset_stream<IO>(
    id: u32,
    state: &mut ConnState,
    conn: &Conn,
    wr: &mut WriteHalf<IO>,
    code: ErrorCode,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    write_frame(wr, Type::RstStream, 0, id, &(code as u32).to_be_bytes()).await?;
    cancel_stream(id, state, conn);
    Ok(())
}

/// Answers streams whose application missed the pre-response deadline.
async fn sweep_timeouts<IO>(
    wait: Duration,
    state: &mut ConnState,
    conn: &Conn,
    wr: &mut WriteHalf<IO>,
) -> Result<(), H2Error>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let now = Instant::now();
    let expired: Vec<u32> = state
        .streams
        .iter()
        .filter(|(_, stream)| stream.phase == Phase::AwaitStart && now >= stream.opened_at + wait)
        .map(|(&id, _)| id)
        .collect();

    for id in expired {
        log::warn!(
            "connection {}: stream {id} application timed out before responding",
            conn.id,
        );
        let server_name = conn.config().server_name.clone();
        let mut fields = vec![
            (Bytes::from_static(b"content-length"), Bytes::from_static(b"0")),
            (Bytes::from_static(b"retry-after"), Bytes::from_static(b"1")),
        ];
        if !server_name.is_empty() {
            fields.push((Bytes::from_static(b"server"), Bytes::from(server_name.into_bytes())));
        }
        let mut block = BytesMut::with_capacity(64);
        state.encoder.encode_response(503, &fields, &mut block);
        if let Some(stream) = state.streams.get_mut(&id) {
            stream.status = 503;
        }
        write_field_block(wr, id, &block, state.peer.max_frame_size as usize, true).await?;
        finish_stream(id, state, conn);
    }
    Ok(())
}
