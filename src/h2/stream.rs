//! Per-stream request cycle state.
use bytes::BytesMut;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::flow::Window;
use crate::asgi::{BoxError, BridgeSender};

/// Response progress of one stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum Phase {
    AwaitStart,
    Body,
}

/// One open stream and its application cycle.
pub(super) struct Stream {
    pub btx: BridgeSender,
    pub app_task: Option<JoinHandle<Result<(), BoxError>>>,
    /// Send-direction window, bounded additionally by the connection
    /// window.
    pub send_window: Window,
    /// Peer may still send DATA (no END_STREAM seen).
    pub inbound_open: bool,
    pub phase: Phase,
    /// Response body bytes admitted but not yet covered by flow control.
    pub pending_out: BytesMut,
    /// END_STREAM once `pending_out` drains.
    pub end_pending: bool,
    pub opened_at: Instant,
    // access log fields
    pub method: String,
    pub target: String,
    pub status: u16,
    pub written: u64,
}

impl Stream {
    pub(super) fn new(btx: BridgeSender, initial_window: u32, method: String, target: String) -> Self {
        Self {
            btx,
            app_task: None,
            send_window: Window::new(initial_window),
            inbound_open: true,
            phase: Phase::AwaitStart,
            pending_out: BytesMut::new(),
            end_pending: false,
            opened_at: Instant::now(),
            method,
            target,
            status: 0,
            written: 0,
        }
    }

}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("phase", &self.phase)
            .field("inbound_open", &self.inbound_open)
            .finish_non_exhaustive()
    }
}
