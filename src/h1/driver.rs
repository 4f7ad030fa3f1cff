//! HTTP/1.1 connection driver.
//!
//! One task per connection. Request cycles run strictly one at a time:
//! pipelined requests wait in the read buffer until the previous response
//! is fully sent. Each cycle spawns its application task and bridges body
//! chunks inward and response events outward, with the write half owned
//! exclusively by this driver.
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::time::{timeout_at, Instant};

use super::chunked::{self, Chunk, ChunkedDecoder};
use super::parser::{self, is_token, ParseError, RequestHead, Version};
use crate::asgi::{self, bridge_pair, AppEvent, CycleKind, HttpScope, Scope, ServerEvent};
use crate::server::{join_app, reap_app, Conn};
use crate::{h2, ws};

/// Read-ahead cap for pipelined requests while a response is in flight.
const PIPELINE_LIMIT: usize = 16 * 1024;

const H2_PREFACE: &[u8; 24] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub(crate) async fn serve<IO>(io: IO, conn: Conn)
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut rd, mut wr) = tokio::io::split(io);
    if let Err(err) = try_serve(&mut rd, &mut wr, conn).await {
        log::debug!("http connection closed: {err}");
    }
    let _ = wr.shutdown().await;
}

async fn try_serve<IO>(
    rd: &mut ReadHalf<IO>,
    wr: &mut WriteHalf<IO>,
    mut conn: Conn,
) -> std::io::Result<()>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let mut read_buf = BytesMut::with_capacity(1024);
    let mut first = true;

    loop {
        if conn.shutting_down() {
            return Ok(());
        }

        let wait = if first {
            conn.config().connect_timeout
        } else {
            conn.config().idle_timeout
        };
        let deadline = Instant::now() + wait;

        // ===== Head =====

        let head = loop {
            // prior-knowledge HTTP/2 opens with the client preface
            if !read_buf.is_empty() && H2_PREFACE.starts_with(&read_buf[..read_buf.len().min(24)])
            {
                if read_buf.len() >= H2_PREFACE.len() {
                    return h2::serve_buffered(rd, wr, read_buf, conn).await;
                }
            } else {
                match parser::parse_head(&mut read_buf) {
                    Ok(Some(head)) => break head,
                    Ok(None) => {}
                    Err(err) => {
                        log::info!("connection {}: bad request: {err}", conn.id);
                        let status = match err {
                            ParseError::TooLarge => 431,
                            _ => 400,
                        };
                        write_empty_error(wr, status).await?;
                        return Ok(());
                    }
                }
            }

            let read = tokio::select! {
                read = timeout_at(deadline, rd.read_buf(&mut read_buf)) => match read {
                    Ok(read) => read?,
                    // connect/idle deadline passed, close silently
                    Err(_) => return Ok(()),
                },
                _ = conn.shutdown.changed() => return Ok(()),
            };
            if read == 0 {
                if !read_buf.is_empty() {
                    log::debug!("connection {}: closed mid request head", conn.id);
                }
                return Ok(());
            }
        };
        first = false;

        // ===== Upgrade =====

        if head.header_contains("connection", "upgrade")
            && head
                .header("upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case(b"websocket"))
        {
            return ws::serve(rd, wr, head, read_buf, conn).await;
        }

        match cycle(rd, wr, &mut read_buf, head, &conn).await? {
            CycleEnd::KeepAlive => {}
            CycleEnd::Close => return Ok(()),
        }
    }
}

enum CycleEnd {
    KeepAlive,
    Close,
}

// ===== Request cycle =====

enum Reading {
    Body(Framing),
    Drained,
}

enum Framing {
    Length(u64),
    Chunked(ChunkedDecoder),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum WritePhase {
    AwaitStart,
    Body,
    Done,
}

async fn cycle<IO>(
    rd: &mut ReadHalf<IO>,
    wr: &mut WriteHalf<IO>,
    read_buf: &mut BytesMut,
    head: RequestHead,
    conn: &Conn,
) -> std::io::Result<CycleEnd>
where
    IO: AsyncRead + AsyncWrite + Send + 'static,
{
    let config = conn.config();
    let version = head.version;
    let is_head_request = head.method == "HEAD";
    let peer_wants_close = head.header_contains("connection", "close")
        || (version == Version::Http10 && !head.header_contains("connection", "keep-alive"));

    // ===== Body framing =====

    let mut pending: Option<ServerEvent> = None;
    let mut reading = if head.header_contains("transfer-encoding", "chunked") {
        Reading::Body(Framing::Chunked(ChunkedDecoder::new()))
    } else {
        match head.header("content-length") {
            Some(value) => {
                let Some(length) = parse_content_length(value) else {
                    log::info!("connection {}: invalid content-length", conn.id);
                    write_empty_error(wr, 400).await?;
                    return Ok(CycleEnd::Close);
                };
                match length {
                    0 => Reading::Drained,
                    length => Reading::Body(Framing::Length(length)),
                }
            }
            None => Reading::Drained,
        }
    };
    if matches!(reading, Reading::Drained) {
        pending = Some(ServerEvent::HttpRequest { body: Bytes::new(), more_body: false });
    }

    if version == Version::Http11 && head.header_contains("expect", "100-continue") {
        wr.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
    }

    // ===== Application task =====

    let log_target = String::from_utf8_lossy(&head.target).into_owned();
    let method = head.method.clone();
    let scope = Scope::Http(http_scope(&head, conn));

    let (mut btx, mut brx, rx, tx) = bridge_pair(CycleKind::Http);
    let app = Arc::clone(&conn.state.app);
    let mut app_task = Some(tokio::spawn(app.call(scope, rx, tx)));
    drop(head);

    // ===== Drive =====

    let close_grace = config.application_close_timeout;
    let mut write_phase = WritePhase::AwaitStart;
    let mut flushed = false;
    let mut chunked_out = false;
    let mut body_suppressed = is_head_request;
    let mut close_after = peer_wants_close;
    let mut status_logged: u16 = 0;
    let mut body_written: u64 = 0;
    let mut write_buf = BytesMut::with_capacity(512);

    let http_deadline = config.http_timeout.map(|wait| Instant::now() + wait);
    let http_sleep = tokio::time::sleep_until(http_deadline.unwrap_or_else(Instant::now));
    tokio::pin!(http_sleep);

    loop {
        if pending.is_none() {
            match next_body_event(&mut reading, read_buf) {
                Ok(event) => pending = event,
                Err(err) => {
                    log::info!("connection {}: bad request body: {err}", conn.id);
                    if !flushed {
                        write_empty_error(wr, 400).await?;
                    }
                    btx.disconnect(None);
                    finish_app(app_task.take(), close_grace, conn.id);
                    return Ok(CycleEnd::Close);
                }
            }
        }

        let want_read = match reading {
            Reading::Body(_) => pending.is_none(),
            Reading::Drained => read_buf.len() < PIPELINE_LIMIT,
        };

        tokio::select! {
            permit = btx.reserve(), if pending.is_some() => {
                match permit {
                    Some(permit) => {
                        permit.send(pending.take().unwrap());
                    }
                    // application stopped receiving; keep draining the wire
                    None => pending = None,
                }
            }

            read = rd.read_buf(read_buf), if want_read => {
                let read = read?;
                if read == 0 {
                    // transport loss is reported the moment it is observed
                    log::debug!("connection {}: client disconnected", conn.id);
                    btx.disconnect(None);
                    finish_app(app_task.take(), close_grace, conn.id);
                    return Ok(CycleEnd::Close);
                }
            }

            event = brx.recv() => match (event, write_phase) {
                (Some(AppEvent::ResponseStart { status, headers, trailers: _ }), WritePhase::AwaitStart) => {
                    write_buf.clear();
                    let framing = match encode_head(
                        &mut write_buf,
                        version,
                        status,
                        &headers,
                        &config.server_name,
                        peer_wants_close,
                    ) {
                        Ok(framing) => framing,
                        Err(reason) => {
                            log::error!(
                                "connection {}: application protocol violation: {reason}",
                                conn.id,
                            );
                            write_error_page(wr, 500, "Internal Server Error", ERROR_500_BODY, &[]).await?;
                            btx.disconnect(None);
                            finish_app(app_task.take(), close_grace, conn.id);
                            return Ok(CycleEnd::Close);
                        }
                    };
                    chunked_out = framing.chunked;
                    close_after |= framing.close_after;
                    body_suppressed |= framing.bodyless;
                    status_logged = status;
                    wr.write_all(&write_buf).await?;
                    flushed = true;
                    write_phase = WritePhase::Body;
                }
                (Some(AppEvent::ResponseBody { body, more_body }), WritePhase::Body) => {
                    if !body_suppressed && !body.is_empty() {
                        if chunked_out {
                            write_buf.clear();
                            chunked::encode_chunk(&body, &mut write_buf);
                            wr.write_all(&write_buf).await?;
                        } else {
                            wr.write_all(&body).await?;
                        }
                        body_written += body.len() as u64;
                    }
                    if !more_body {
                        if chunked_out && !body_suppressed {
                            write_buf.clear();
                            chunked::encode_end(&mut write_buf);
                            wr.write_all(&write_buf).await?;
                        }
                        wr.flush().await?;
                        write_phase = WritePhase::Done;
                        break;
                    }
                }
                (Some(event), _) => {
                    // the bridge already rejects out-of-order events; seeing
                    // one here means the cycle state diverged
                    log::error!(
                        "connection {}: unexpected {} event from application",
                        conn.id,
                        event.kind(),
                    );
                    if !flushed {
                        write_error_page(wr, 500, "Internal Server Error", ERROR_500_BODY, &[]).await?;
                    }
                    btx.disconnect(None);
                    finish_app(app_task.take(), close_grace, conn.id);
                    return Ok(CycleEnd::Close);
                }
                (None, WritePhase::AwaitStart) => {
                    // application finished without producing a response
                    btx.disconnect(None);
                    let result = join_app(app_task.take().unwrap(), close_grace).await;
                    match result {
                        Ok(()) => log::error!(
                            "connection {}: application returned without a response",
                            conn.id,
                        ),
                        Err(err) => log::error!(
                            "connection {}: application error: {err}",
                            conn.id,
                        ),
                    }
                    if !flushed {
                        write_error_page(wr, 500, "Internal Server Error", ERROR_500_BODY, &[]).await?;
                        access_log(conn, &method, &log_target, 500, 0);
                    }
                    return Ok(CycleEnd::Close);
                }
                (None, _) => {
                    log::error!(
                        "connection {}: application dropped mid response",
                        conn.id,
                    );
                    btx.disconnect(None);
                    finish_app(app_task.take(), close_grace, conn.id);
                    return Ok(CycleEnd::Close);
                }
            },

            _ = &mut http_sleep, if http_deadline.is_some() && matches!(write_phase, WritePhase::AwaitStart) => {
                log::warn!(
                    "connection {}: application timed out before responding",
                    conn.id,
                );
                write_error_page(
                    wr,
                    503,
                    "Service Unavailable",
                    ERROR_503_BODY,
                    &[("retry-after", "1")],
                ).await?;
                access_log(conn, &method, &log_target, 503, 0);
                btx.disconnect(None);
                finish_app(app_task.take(), close_grace, conn.id);
                return Ok(CycleEnd::Close);
            }
        }
    }

    // ===== Cycle complete =====

    debug_assert!(matches!(write_phase, WritePhase::Done));
    btx.disconnect(None);
    finish_app(app_task.take(), close_grace, conn.id);
    access_log(conn, &method, &log_target, status_logged, body_written);

    if close_after {
        return Ok(CycleEnd::Close);
    }

    // surplus request body the application never consumed
    if matches!(reading, Reading::Body(_)) {
        let deadline = Instant::now() + config.idle_timeout;
        loop {
            match next_body_event(&mut reading, read_buf) {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(_) => return Ok(CycleEnd::Close),
            }
            if matches!(reading, Reading::Drained) {
                break;
            }
            match timeout_at(deadline, rd.read_buf(read_buf)).await {
                Ok(Ok(0)) | Err(_) => return Ok(CycleEnd::Close),
                Ok(Ok(_)) => {}
                Ok(Err(err)) => return Err(err),
            }
        }
    }

    Ok(CycleEnd::KeepAlive)
}

fn finish_app(
    task: Option<tokio::task::JoinHandle<Result<(), asgi::BoxError>>>,
    grace: Duration,
    conn_id: u64,
) {
    if let Some(task) = task {
        reap_app(task, grace, conn_id);
    }
}

fn access_log(conn: &Conn, method: &str, target: &str, status: u16, size: u64) {
    if let Some(access) = &conn.state.access {
        access.http_complete(conn.client.as_ref(), method, target, status, size);
    }
}

// ===== Body framing =====

fn parse_content_length(value: &[u8]) -> Option<u64> {
    std::str::from_utf8(value).ok()?.trim().parse().ok()
}

fn next_body_event(
    reading: &mut Reading,
    buffer: &mut BytesMut,
) -> Result<Option<ServerEvent>, ParseError> {
    match reading {
        Reading::Body(Framing::Length(remaining)) => {
            if buffer.is_empty() {
                return Ok(None);
            }
            let take = (*remaining).min(buffer.len() as u64) as usize;
            let body = buffer.split_to(take).freeze();
            *remaining -= take as u64;
            if *remaining == 0 {
                *reading = Reading::Drained;
                Ok(Some(ServerEvent::HttpRequest { body, more_body: false }))
            } else {
                Ok(Some(ServerEvent::HttpRequest { body, more_body: true }))
            }
        }
        Reading::Body(Framing::Chunked(decoder)) => match decoder.decode(buffer)? {
            Some(Chunk::Data(body)) => {
                Ok(Some(ServerEvent::HttpRequest { body, more_body: true }))
            }
            Some(Chunk::End) => {
                *reading = Reading::Drained;
                Ok(Some(ServerEvent::HttpRequest { body: Bytes::new(), more_body: false }))
            }
            None => Ok(None),
        },
        Reading::Drained => Ok(None),
    }
}

// ===== Scope construction =====

/// Splits a request target into raw path and query string.
pub(crate) fn split_target(target: &Bytes) -> (Bytes, Bytes) {
    match target.iter().position(|&b| b == b'?') {
        Some(mark) => (target.slice(..mark), target.slice(mark + 1..)),
        None => (target.clone(), Bytes::new()),
    }
}

/// Common scope fields assembled from a parsed head: filtered headers,
/// root path, decoded path, scheme and addresses.
pub(crate) struct ScopeParts {
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub path: String,
    pub root_path: String,
    pub headers: Vec<(Bytes, Bytes)>,
    pub scheme: String,
    pub client: Option<(String, u16)>,
    pub server: Option<(String, u16)>,
}

pub(crate) fn scope_parts(head: &RequestHead, conn: &Conn) -> ScopeParts {
    assemble_scope(&head.target, &head.headers, conn)
}

/// The shared assembly used by both HTTP versions: header filtering, root
/// path resolution, path decoding and proxy rewrites.
pub(crate) fn assemble_scope(
    target: &Bytes,
    raw_headers: &[(Bytes, Bytes)],
    conn: &Conn,
) -> ScopeParts {
    let config = conn.config();
    let (raw_path, query_string) = split_target(target);

    let mut root_path = config.root_path.clone();
    let mut headers = Vec::with_capacity(raw_headers.len());
    for (name, value) in raw_headers {
        // underscores in raw names are a smuggling vector for CGI-style
        // header mangling, drop them before the application sees anything
        if name.contains(&b'_') {
            continue;
        }
        // reserved for the server, never forwarded
        if name.as_ref() == b"daphne-root-path" {
            root_path = asgi::percent_decode_str(value);
            continue;
        }
        headers.push((name.clone(), value.clone()));
    }

    let path = asgi::strip_root_path(asgi::percent_decode_str(&raw_path), &root_path);

    let mut scheme = if conn.tls { "https" } else { "http" }.to_owned();
    let mut client = conn.client.clone();
    if let Some(proxy) = &config.proxy {
        proxy.rewrite(&headers, &mut client, &mut scheme);
    }

    ScopeParts {
        raw_path,
        query_string,
        path,
        root_path,
        headers,
        scheme,
        client,
        server: conn.server.clone(),
    }
}

fn http_scope(head: &RequestHead, conn: &Conn) -> HttpScope {
    let parts = scope_parts(head, conn);
    HttpScope {
        http_version: head.version.as_str(),
        method: head.method.to_ascii_uppercase(),
        scheme: parts.scheme,
        path: parts.path,
        raw_path: parts.raw_path,
        query_string: parts.query_string,
        root_path: parts.root_path,
        headers: parts.headers,
        client: parts.client,
        server: parts.server,
    }
}

// ===== Response encoding =====

struct HeadFraming {
    chunked: bool,
    close_after: bool,
    bodyless: bool,
}

fn encode_head(
    out: &mut BytesMut,
    version: Version,
    status: u16,
    headers: &[(Bytes, Bytes)],
    server_name: &str,
    peer_wants_close: bool,
) -> Result<HeadFraming, &'static str> {
    let bodyless = status < 200 || status == 204 || status == 304;

    out.put_slice(match version {
        Version::Http11 => b"HTTP/1.1 ",
        Version::Http10 => b"HTTP/1.0 ",
    });
    let mut digits = itoa::Buffer::new();
    out.put_slice(digits.format(status).as_bytes());
    out.put_slice(b" ");
    out.put_slice(reason_phrase(status).as_bytes());
    out.put_slice(b"\r\n");

    let mut has_length = false;
    let mut has_transfer_encoding = false;
    let mut has_connection = false;
    let mut close_after = false;

    for (name, value) in headers {
        if name.is_empty() || !name.iter().all(|&b| is_token(b)) {
            return Err("invalid response header name");
        }
        if value.iter().any(|&b| b == b'\r' || b == b'\n' || b == b'\0') {
            return Err("invalid bytes in response header value");
        }
        if name.eq_ignore_ascii_case(b"content-length") {
            has_length = true;
        } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
            has_transfer_encoding = true;
        } else if name.eq_ignore_ascii_case(b"connection") {
            has_connection = true;
            if value
                .split(|&b| b == b',')
                .any(|part| part.trim_ascii().eq_ignore_ascii_case(b"close"))
            {
                close_after = true;
            }
        }
        // case as supplied by the application
        out.put_slice(name);
        out.put_slice(b": ");
        out.put_slice(value);
        out.put_slice(b"\r\n");
    }

    if !server_name.is_empty() {
        out.put_slice(b"server: ");
        out.put_slice(server_name.as_bytes());
        out.put_slice(b"\r\n");
    }

    let mut chunked = false;
    if !bodyless && !has_length && !has_transfer_encoding {
        match version {
            Version::Http11 => {
                out.put_slice(b"transfer-encoding: chunked\r\n");
                chunked = true;
            }
            // no delimiter available, end of body is end of connection
            Version::Http10 => close_after = true,
        }
    }

    // HTTP/1.0 keep-alive is not offered
    if version == Version::Http10 {
        close_after = true;
    }
    if (peer_wants_close || close_after) && !has_connection {
        out.put_slice(b"connection: close\r\n");
    }

    out.put_slice(b"\r\n");
    Ok(HeadFraming { chunked, close_after, bodyless })
}

pub(crate) fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

// ===== Error responses =====

pub(crate) const ERROR_500_BODY: &str = "HTTP processing error";
pub(crate) const ERROR_503_BODY: &str =
    "Application failed to respond within time limit.";

/// Smallest valid error: status line, zero length, close.
pub(crate) async fn write_empty_error<W>(wr: &mut W, status: u16) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::with_capacity(96);
    let mut digits = itoa::Buffer::new();
    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(digits.format(status).as_bytes());
    out.put_slice(b" ");
    out.put_slice(reason_phrase(status).as_bytes());
    out.put_slice(b"\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
    wr.write_all(&out).await?;
    wr.flush().await
}

/// Server-level error page with a small HTML body.
pub(crate) async fn write_error_page<W>(
    wr: &mut W,
    status: u16,
    title: &str,
    body: &str,
    extra_headers: &[(&str, &str)],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let html = error_page_html(status, title, body);
    let mut out = BytesMut::with_capacity(256 + html.len());
    let mut digits = itoa::Buffer::new();
    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(digits.format(status).as_bytes());
    out.put_slice(b" ");
    out.put_slice(title.as_bytes());
    out.put_slice(b"\r\ncontent-type: text/html; charset=utf-8\r\ncontent-length: ");
    out.put_slice(digits.format(html.len()).as_bytes());
    out.put_slice(b"\r\n");
    for (name, value) in extra_headers {
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"connection: close\r\n\r\n");
    out.put_slice(html.as_bytes());
    wr.write_all(&out).await?;
    wr.flush().await
}

fn error_page_html(status: u16, title: &str, body: &str) -> String {
    format!(
        "<html><head><title>{status} {title}</title></head>\
         <body><h1>{status} {title}</h1><p>{body}</p>\
         <footer>Daphne</footer></body></html>",
    )
}

// ===== Test =====
