//! HTTP/2 protocol, RFC 9113.
mod driver;
mod flow;
pub(crate) mod frame;
pub(crate) mod hpack;
mod settings;
mod stream;

pub(crate) use driver::{serve, serve_buffered};
