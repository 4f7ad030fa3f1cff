//! Server configuration.
//!
//! All values are read-only once the server starts; the CLI front end builds
//! one [`Config`] and hands it over.
use std::time::Duration;

use crate::access::AccessLogConfig;
use crate::endpoint::Endpoint;
use crate::proxy::ProxyConfig;

/// Shared server configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Endpoints to listen on.
    pub endpoints: Vec<Endpoint>,
    /// Value of the `server` response header. An empty string disables the
    /// header entirely.
    pub server_name: String,
    /// Default ASGI `root_path`, overridable per request by the
    /// `Daphne-Root-Path` header.
    pub root_path: String,
    /// Deadline for the first `http.response.start` of a request cycle.
    /// Expiry answers 503. Disabled by default.
    pub http_timeout: Option<Duration>,
    /// Deadline for the first bytes from a freshly accepted transport.
    pub connect_timeout: Duration,
    /// Idle deadline between request cycles on a keep-alive connection.
    pub idle_timeout: Duration,
    /// Maximum lifetime of an established WebSocket, after which it is
    /// closed with code 1000 to accommodate channel-layer group expiry.
    /// `None` means unlimited.
    pub websocket_timeout: Option<Duration>,
    /// Deadline for the application to answer `websocket.connect`. Expiry
    /// rejects the handshake with a 403. `None` means unlimited.
    pub websocket_connect_timeout: Option<Duration>,
    /// Largest reassembled WebSocket message accepted before the connection
    /// is closed with code 1009.
    pub websocket_max_message_size: usize,
    /// Grace granted to an application task after its cycle disconnected,
    /// before the task is aborted.
    pub application_close_timeout: Duration,
    /// Quiet period without incoming WebSocket bytes before a keepalive
    /// ping is sent.
    pub ping_interval: Duration,
    /// Period without any incoming WebSocket data after which the
    /// connection is closed with code 1011.
    pub ping_timeout: Duration,
    /// How long shutdown waits for in-flight cycles to flush before
    /// aborting the remaining connection tasks.
    pub shutdown_grace: Duration,
    /// Global cap on concurrently served connections. Excess connections
    /// are accepted and immediately answered 503 / rejected.
    pub max_connections: Option<usize>,
    /// Proxy header rewriting, disabled when `None`.
    pub proxy: Option<ProxyConfig>,
    /// Access log destination.
    pub access_log: AccessLogConfig,
    /// Logging verbosity, 0 to 3.
    pub verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            server_name: "daphne".to_owned(),
            root_path: String::new(),
            http_timeout: None,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(720),
            websocket_timeout: Some(Duration::from_secs(86400)),
            websocket_connect_timeout: Some(Duration::from_secs(5)),
            websocket_max_message_size: 16 * 1024 * 1024,
            application_close_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(20),
            ping_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            max_connections: None,
            proxy: None,
            access_log: AccessLogConfig::Disabled,
            verbosity: 1,
        }
    }
}
