//! WebSocket protocol, RFC 6455.
mod driver;
pub(crate) mod frame;
pub(crate) mod handshake;

pub(crate) use driver::serve;
