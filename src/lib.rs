//! HTTP/1.1, HTTP/2 and WebSocket protocol server for ASGI applications.
//!
//! The server terminates network connections and exposes each of them to an
//! application as the asynchronous three-part ASGI contract: an immutable
//! [`Scope`] describing the connection, a `receive` endpoint yielding events
//! from the network, and a `send` endpoint accepting events for the network.
#![warn(missing_debug_implementations)]

pub mod access;
pub mod asgi;
pub mod cli;
pub mod config;
pub mod endpoint;
pub mod testing;
pub mod tls;

mod h1;
mod h2;
mod listener;
mod proxy;
mod server;
mod ws;

// ===== Reexports =====

pub use asgi::{Application, Scope};
pub use config::Config;
pub use endpoint::Endpoint;
pub use proxy::{ProxyConfig, ProxyPolicy};
pub use server::{Lifecycle, Server, ServerHandle};
