//! ASGI contract types.
//!
//! A connection is described to the application by an immutable [`Scope`];
//! events flow through the [`EventReceiver`] / [`EventSender`] pair built in
//! [`bridge`]. Event variants mirror the ASGI 3.0 vocabulary bit-exact; the
//! `type` strings are available through `kind()` for logging and errors.
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};

use bytes::Bytes;
use tokio::sync::Semaphore;

mod bridge;

pub use bridge::{EventReceiver, EventSender, SendError};
pub(crate) use bridge::{pair as bridge_pair, BridgeReceiver, BridgeSender, CycleKind};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// The ASGI protocol version reported in every scope.
pub const ASGI_VERSION: &str = "3.0";

// ===== Scope =====

/// Immutable description of one connection or request.
#[derive(Clone, Debug)]
pub enum Scope {
    Http(HttpScope),
    WebSocket(WebSocketScope),
}

impl Scope {
    /// Scope `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::Http(_) => "http",
            Scope::WebSocket(_) => "websocket",
        }
    }

    /// `asgi["version"]`, fixed at [`ASGI_VERSION`].
    pub fn asgi_version(&self) -> &'static str {
        ASGI_VERSION
    }

    /// Header list: lowercase names, values verbatim, received order.
    pub fn headers(&self) -> &[(Bytes, Bytes)] {
        match self {
            Scope::Http(scope) => &scope.headers,
            Scope::WebSocket(scope) => &scope.headers,
        }
    }

    /// Percent-decoded request path.
    pub fn path(&self) -> &str {
        match self {
            Scope::Http(scope) => &scope.path,
            Scope::WebSocket(scope) => &scope.path,
        }
    }
}

/// Scope of a single HTTP request cycle.
#[derive(Clone, Debug)]
pub struct HttpScope {
    /// `"1.0"`, `"1.1"` or `"2"`.
    pub http_version: &'static str,
    /// Upper-case ASCII method.
    pub method: String,
    /// `"http"` or `"https"`, after proxy rewrites.
    pub scheme: String,
    /// Percent-decoded UTF-8 path.
    pub path: String,
    /// Undecoded path bytes.
    pub raw_path: Bytes,
    /// Raw query string bytes, without the `?`.
    pub query_string: Bytes,
    /// Mount prefix the application is served under.
    pub root_path: String,
    /// Lowercase names, values verbatim, received order.
    pub headers: Vec<(Bytes, Bytes)>,
    /// Remote address, possibly rewritten from proxy headers.
    pub client: Option<(String, u16)>,
    /// Local address.
    pub server: Option<(String, u16)>,
}

/// Scope of a WebSocket conversation.
#[derive(Clone, Debug)]
pub struct WebSocketScope {
    pub http_version: &'static str,
    /// `"ws"` or `"wss"`.
    pub scheme: String,
    pub path: String,
    pub raw_path: Bytes,
    pub query_string: Bytes,
    pub root_path: String,
    pub headers: Vec<(Bytes, Bytes)>,
    /// Offers from `Sec-WebSocket-Protocol`, in header order.
    pub subprotocols: Vec<String>,
    pub client: Option<(String, u16)>,
    pub server: Option<(String, u16)>,
}

// ===== Events =====

/// A WebSocket message payload, text or binary, never both.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
}

/// Events the server delivers to the application.
#[derive(Clone, Debug)]
pub enum ServerEvent {
    /// `http.request`
    HttpRequest { body: Bytes, more_body: bool },
    /// `http.disconnect`
    HttpDisconnect,
    /// `websocket.connect`
    WebSocketConnect,
    /// `websocket.receive`
    WebSocketReceive(Message),
    /// `websocket.disconnect`
    WebSocketDisconnect { code: u16 },
}

impl ServerEvent {
    /// ASGI `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::HttpRequest { .. } => "http.request",
            ServerEvent::HttpDisconnect => "http.disconnect",
            ServerEvent::WebSocketConnect => "websocket.connect",
            ServerEvent::WebSocketReceive(_) => "websocket.receive",
            ServerEvent::WebSocketDisconnect { .. } => "websocket.disconnect",
        }
    }
}

/// Events the application sends to the server.
#[derive(Clone, Debug)]
pub enum AppEvent {
    /// `http.response.start`
    ResponseStart {
        status: u16,
        headers: Vec<(Bytes, Bytes)>,
        trailers: bool,
    },
    /// `http.response.body`
    ResponseBody { body: Bytes, more_body: bool },
    /// `websocket.accept`
    Accept {
        subprotocol: Option<String>,
        headers: Vec<(Bytes, Bytes)>,
    },
    /// `websocket.send`
    Send(Message),
    /// `websocket.close`
    Close { code: u16, reason: Option<String> },
}

impl AppEvent {
    /// ASGI `type` string.
    pub fn kind(&self) -> &'static str {
        match self {
            AppEvent::ResponseStart { .. } => "http.response.start",
            AppEvent::ResponseBody { .. } => "http.response.body",
            AppEvent::Accept { .. } => "websocket.accept",
            AppEvent::Send(_) => "websocket.send",
            AppEvent::Close { .. } => "websocket.close",
        }
    }
}

// ===== Application =====

/// An ASGI application: an asynchronous callable over scope, receive and
/// send. Implemented for async closures of that shape.
pub trait Application: Send + Sync + 'static {
    fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> BoxFuture<Result<(), BoxError>>;
}

impl<F, Fut> Application for F
where
    F: Fn(Scope, EventReceiver, EventSender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> BoxFuture<Result<(), BoxError>> {
        Box::pin((self)(scope, receive, send))
    }
}

// ===== Synchronous applications =====

/// Adapter running a blocking application on the worker pool.
///
/// The pool is the only place blocking work is tolerated; its size is capped
/// by the `ASGI_THREADS` environment variable, defaulting to
/// `min(32, cpus + 4)`.
pub struct SyncApplication<F> {
    inner: Arc<F>,
}

impl<F> SyncApplication<F> {
    pub fn new(inner: F) -> Self {
        Self { inner: Arc::new(inner) }
    }
}

impl<F> fmt::Debug for SyncApplication<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncApplication").finish_non_exhaustive()
    }
}

impl<F> Application for SyncApplication<F>
where
    F: Fn(Scope, SyncEventReceiver, SyncEventSender) -> Result<(), BoxError>
        + Send
        + Sync
        + 'static,
{
    fn call(
        &self,
        scope: Scope,
        receive: EventReceiver,
        send: EventSender,
    ) -> BoxFuture<Result<(), BoxError>> {
        let inner = Arc::clone(&self.inner);
        Box::pin(async move {
            let _permit = worker_permits().acquire().await;
            let handle = tokio::task::spawn_blocking(move || {
                inner(
                    scope,
                    SyncEventReceiver { inner: receive },
                    SyncEventSender { inner: send },
                )
            });
            match handle.await {
                Ok(result) => result,
                Err(join) => Err(join.into()),
            }
        })
    }
}

/// Blocking flavor of [`EventReceiver`], for use off the event loop only.
#[derive(Debug)]
pub struct SyncEventReceiver {
    inner: EventReceiver,
}

impl SyncEventReceiver {
    pub fn recv(&mut self) -> Option<ServerEvent> {
        self.inner.blocking_recv()
    }
}

/// Blocking flavor of [`EventSender`], for use off the event loop only.
#[derive(Debug)]
pub struct SyncEventSender {
    inner: EventSender,
}

impl SyncEventSender {
    pub fn send(&self, event: AppEvent) -> Result<(), SendError> {
        self.inner.blocking_send(event)
    }
}

fn worker_permits() -> &'static Semaphore {
    static WORKERS: OnceLock<Semaphore> = OnceLock::new();
    WORKERS.get_or_init(|| {
        let default = std::thread::available_parallelism()
            .map(|n| (n.get() + 4).min(32))
            .unwrap_or(8);
        let cap = std::env::var("ASGI_THREADS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or(default);
        Semaphore::new(cap)
    })
}

// ===== Application registry =====

type Registry = Mutex<HashMap<String, Arc<dyn Application>>>;

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

/// Registers an application under a `module:attribute` style reference so
/// the CLI front end can resolve it.
pub fn register_application(reference: impl Into<String>, app: Arc<dyn Application>) {
    registry().lock().unwrap().insert(reference.into(), app);
}

/// Resolves a registered application reference.
pub fn load_application(reference: &str) -> Result<Arc<dyn Application>, LoadError> {
    registry()
        .lock()
        .unwrap()
        .get(reference)
        .cloned()
        .ok_or_else(|| LoadError {
            reference: reference.to_owned(),
        })
}

/// Application reference that is not registered.
#[derive(Debug)]
pub struct LoadError {
    reference: String,
}

impl std::error::Error for LoadError {}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no application registered as {:?}", self.reference)
    }
}

// ===== Request target helpers =====

/// Percent-decodes, leaving malformed escapes in place.
pub(crate) fn percent_decode(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;
    while let [byte, tail @ ..] = rest {
        if *byte == b'%' {
            if let [hi, lo, tail @ ..] = tail {
                if let (Some(hi), Some(lo)) = (hex(*hi), hex(*lo)) {
                    out.push(hi << 4 | lo);
                    rest = tail;
                    continue;
                }
            }
        }
        out.push(*byte);
        rest = tail;
    }
    out
}

fn hex(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Percent-decodes into text, replacing invalid UTF-8.
pub(crate) fn percent_decode_str(raw: &[u8]) -> String {
    String::from_utf8_lossy(&percent_decode(raw)).into_owned()
}

/// Strips the root path prefix off a decoded path, per the root-path
/// contract: the application sees the mount point in `root_path` and the
/// remainder in `path`.
pub(crate) fn strip_root_path(path: String, root_path: &str) -> String {
    if root_path.is_empty() {
        return path;
    }
    match path.strip_prefix(root_path) {
        Some(rest) if rest.is_empty() => "/".to_owned(),
        Some(rest) if rest.starts_with('/') => rest.to_owned(),
        _ => path,
    }
}

// ===== Test =====
