//! HTTP/1.1 protocol.
mod chunked;
pub(crate) mod driver;
pub(crate) mod parser;

pub(crate) use driver::serve;
