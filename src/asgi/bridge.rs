//! Scope/message bridge.
//!
//! One bridge per cycle: the protocol half holds a [`BridgeSender`] /
//! [`BridgeReceiver`] pair, the application task the matching
//! [`EventReceiver`] / [`EventSender`]. Channels are bounded in both
//! directions. The send side enforces the per-protocol event ordering; the
//! receive side yields the final `*.disconnect` exactly once after the
//! protocol half hangs up.
use std::fmt;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{AppEvent, ServerEvent};

/// Queue depth of either direction.
const EVENT_BUFFER: usize = 32;

/// Which cycle kind a bridge belongs to, fixing its ordering rules and its
/// disconnect event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CycleKind {
    Http,
    WebSocket,
}

/// Creates the two halves of a cycle bridge.
pub(crate) fn pair(kind: CycleKind) -> (BridgeSender, BridgeReceiver, EventReceiver, EventSender) {
    let (in_tx, in_rx) = mpsc::channel(EVENT_BUFFER);
    let (out_tx, out_rx) = mpsc::channel(EVENT_BUFFER);
    let shared = Arc::new(Shared {
        state: Mutex::new(match kind {
            CycleKind::Http => SendState::AwaitingStart,
            CycleKind::WebSocket => SendState::Connecting,
        }),
        close_code: Mutex::new(None),
    });

    (
        BridgeSender { tx: Some(in_tx), shared: Arc::clone(&shared) },
        BridgeReceiver { rx: out_rx },
        EventReceiver { rx: in_rx, kind, shared: Arc::clone(&shared), done: false },
        EventSender { tx: out_tx, kind, shared },
    )
}

struct Shared {
    state: Mutex<SendState>,
    close_code: Mutex<Option<u16>>,
}

// ===== Protocol half =====

/// Protocol-side inbound event producer.
pub(crate) struct BridgeSender {
    tx: Option<mpsc::Sender<ServerEvent>>,
    shared: Arc<Shared>,
}

impl BridgeSender {
    /// Queues an event for the application. Returns `false` when the
    /// application dropped its receiver.
    pub(crate) async fn send(&self, event: ServerEvent) -> bool {
        match &self.tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Reserves queue capacity, cancel-safe.
    pub(crate) async fn reserve(&self) -> Option<mpsc::OwnedPermit<ServerEvent>> {
        match &self.tx {
            Some(tx) => tx.clone().reserve_owned().await.ok(),
            None => None,
        }
    }

    /// Signals end of the cycle. Queued events still drain; afterwards the
    /// application's `receive` yields its disconnect event once. For
    /// WebSockets `code` is the close code observed or sent.
    pub(crate) fn disconnect(&mut self, code: Option<u16>) {
        if let Some(code) = code {
            *self.shared.close_code.lock().unwrap() = Some(code);
        }
        self.tx = None;
    }
}

impl fmt::Debug for BridgeSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeSender").finish_non_exhaustive()
    }
}

/// Protocol-side outbound event consumer.
#[derive(Debug)]
pub(crate) struct BridgeReceiver {
    rx: mpsc::Receiver<AppEvent>,
}

impl BridgeReceiver {
    /// Next event sent by the application, `None` once the application task
    /// dropped its sender.
    pub(crate) async fn recv(&mut self) -> Option<AppEvent> {
        self.rx.recv().await
    }
}

// ===== Application half =====

/// The application's `receive` endpoint.
pub struct EventReceiver {
    rx: mpsc::Receiver<ServerEvent>,
    kind: CycleKind,
    shared: Arc<Shared>,
    done: bool,
}

impl EventReceiver {
    /// Waits for the next inbound event.
    ///
    /// After the connection is over this yields the matching `*.disconnect`
    /// exactly once, then `None`.
    pub async fn recv(&mut self) -> Option<ServerEvent> {
        if self.done {
            return None;
        }
        match self.rx.recv().await {
            Some(event) => Some(event),
            None => {
                self.done = true;
                Some(self.disconnect_event())
            }
        }
    }

    /// Blocking flavor of [`recv`](Self::recv), for worker pool use.
    pub(super) fn blocking_recv(&mut self) -> Option<ServerEvent> {
        if self.done {
            return None;
        }
        match self.rx.blocking_recv() {
            Some(event) => Some(event),
            None => {
                self.done = true;
                Some(self.disconnect_event())
            }
        }
    }

    fn disconnect_event(&self) -> ServerEvent {
        match self.kind {
            CycleKind::Http => ServerEvent::HttpDisconnect,
            CycleKind::WebSocket => ServerEvent::WebSocketDisconnect {
                // 1006: transport lost without a close frame
                code: self.shared.close_code.lock().unwrap().unwrap_or(1006),
            },
        }
    }
}

impl fmt::Debug for EventReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventReceiver").finish_non_exhaustive()
    }
}

/// The application's `send` endpoint.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<AppEvent>,
    kind: CycleKind,
    shared: Arc<Shared>,
}

impl EventSender {
    /// Hands an event to the protocol state machine.
    ///
    /// Ordering violations error; events sent after the cycle closed are
    /// discarded silently.
    pub async fn send(&self, event: AppEvent) -> Result<(), SendError> {
        match self.advance(&event)? {
            Outcome::Forward => {
                // a closed channel means the connection is gone, late sends
                // are discarded silently
                let _ = self.tx.send(event).await;
                Ok(())
            }
            Outcome::Ignore => Ok(()),
        }
    }

    /// Blocking flavor of [`send`](Self::send), for worker pool use.
    pub(super) fn blocking_send(&self, event: AppEvent) -> Result<(), SendError> {
        match self.advance(&event)? {
            Outcome::Forward => {
                let _ = self.tx.blocking_send(event);
                Ok(())
            }
            Outcome::Ignore => Ok(()),
        }
    }

    fn advance(&self, event: &AppEvent) -> Result<Outcome, SendError> {
        if self.tx.is_closed() {
            // connection over, nothing to order against
            return Ok(Outcome::Ignore);
        }

        let mut state = self.shared.state.lock().unwrap();
        match self.kind {
            CycleKind::Http => state.advance_http(event),
            CycleKind::WebSocket => state.advance_websocket(event),
        }
    }
}

impl fmt::Debug for EventSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSender").finish_non_exhaustive()
    }
}

// ===== Ordering =====

enum Outcome {
    Forward,
    Ignore,
}

#[derive(Debug)]
enum SendState {
    // http
    AwaitingStart,
    StreamingBody,
    ResponseDone,
    // websocket
    Connecting,
    Connected,
    Closed,
}

impl SendState {
    fn advance_http(&mut self, event: &AppEvent) -> Result<Outcome, SendError> {
        match (&*self, event) {
            (SendState::AwaitingStart, AppEvent::ResponseStart { status, .. }) => {
                if !(100..=599).contains(status) {
                    return Err(SendError::InvalidStatus(*status));
                }
                *self = SendState::StreamingBody;
                Ok(Outcome::Forward)
            }
            (SendState::AwaitingStart, AppEvent::ResponseBody { .. }) => {
                Err(SendError::BodyBeforeStart)
            }
            (SendState::StreamingBody, AppEvent::ResponseBody { more_body, .. }) => {
                if !more_body {
                    *self = SendState::ResponseDone;
                }
                Ok(Outcome::Forward)
            }
            (SendState::StreamingBody, AppEvent::ResponseStart { .. }) => {
                Err(SendError::StartAfterStart)
            }
            (SendState::ResponseDone, _) => Err(SendError::AfterResponse),
            (_, event) => Err(SendError::Scope { event: event.kind() }),
        }
    }

    fn advance_websocket(&mut self, event: &AppEvent) -> Result<Outcome, SendError> {
        match (&*self, event) {
            (SendState::Connecting, AppEvent::Accept { .. }) => {
                *self = SendState::Connected;
                Ok(Outcome::Forward)
            }
            (SendState::Connecting, AppEvent::Close { .. }) => {
                *self = SendState::Closed;
                Ok(Outcome::Forward)
            }
            (SendState::Connecting, AppEvent::Send(_)) => Err(SendError::SendBeforeAccept),
            (SendState::Connected, AppEvent::Send(_)) => Ok(Outcome::Forward),
            (SendState::Connected, AppEvent::Close { .. }) => {
                *self = SendState::Closed;
                Ok(Outcome::Forward)
            }
            (SendState::Connected, AppEvent::Accept { .. }) => Err(SendError::AlreadyAccepted),
            // sends after close are ignored
            (SendState::Closed, AppEvent::Send(_) | AppEvent::Close { .. } | AppEvent::Accept { .. }) => {
                Ok(Outcome::Ignore)
            }
            (_, event) => Err(SendError::Scope { event: event.kind() }),
        }
    }
}

/// An event-order violation raised by [`EventSender::send`].
#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    /// Event does not belong to this scope type.
    Scope { event: &'static str },
    /// `http.response.body` before `http.response.start`.
    BodyBeforeStart,
    /// Second `http.response.start`.
    StartAfterStart,
    /// Event after the final `http.response.body`.
    AfterResponse,
    /// Status code outside 100..=599.
    InvalidStatus(u16),
    /// `websocket.send` before `websocket.accept`.
    SendBeforeAccept,
    /// Second `websocket.accept`.
    AlreadyAccepted,
}

impl SendError {
    fn message(&self) -> &'static str {
        match self {
            SendError::Scope { .. } => "event not valid for this scope type",
            SendError::BodyBeforeStart => "http.response.body before http.response.start",
            SendError::StartAfterStart => "multiple http.response.start events",
            SendError::AfterResponse => "event after the response was completed",
            SendError::InvalidStatus(_) => "response status outside 100..=599",
            SendError::SendBeforeAccept => "websocket.send before websocket.accept",
            SendError::AlreadyAccepted => "multiple websocket.accept events",
        }
    }
}

impl std::error::Error for SendError {}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Scope { event } => write!(f, "{} event {event}", self.message()),
            SendError::InvalidStatus(status) => write!(f, "{}: {status}", self.message()),
            _ => f.write_str(self.message()),
        }
    }
}

// ===== Test =====

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn start() -> AppEvent {
        AppEvent::ResponseStart { status: 200, headers: Vec::new(), trailers: false }
    }

    fn body(more: bool) -> AppEvent {
        AppEvent::ResponseBody { body: Bytes::from_static(b"x"), more_body: more }
    }

    #[tokio::test]
    async fn test_http_ordering() {
        let (_in, mut out, _rx, tx) = pair(CycleKind::Http);

        assert_eq!(tx.send(body(false)).await, Err(SendError::BodyBeforeStart));
        tx.send(start()).await.unwrap();
        assert_eq!(tx.send(start()).await, Err(SendError::StartAfterStart));
        tx.send(body(true)).await.unwrap();
        tx.send(body(false)).await.unwrap();
        assert_eq!(tx.send(body(false)).await, Err(SendError::AfterResponse));

        assert!(matches!(out.recv().await, Some(AppEvent::ResponseStart { .. })));
    }

    #[tokio::test]
    async fn test_invalid_status() {
        let (_in, _out, _rx, tx) = pair(CycleKind::Http);
        let event = AppEvent::ResponseStart { status: 99, headers: Vec::new(), trailers: false };
        assert_eq!(tx.send(event).await, Err(SendError::InvalidStatus(99)));
    }

    #[tokio::test]
    async fn test_websocket_ordering() {
        let (_in, _out, _rx, tx) = pair(CycleKind::WebSocket);

        let send = AppEvent::Send(crate::asgi::Message::Text("hi".into()));
        assert_eq!(tx.send(send.clone()).await, Err(SendError::SendBeforeAccept));

        tx.send(AppEvent::Accept { subprotocol: None, headers: Vec::new() }).await.unwrap();
        tx.send(send.clone()).await.unwrap();
        tx.send(AppEvent::Close { code: 1000, reason: None }).await.unwrap();
        // ignored, not an error
        tx.send(send).await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_exactly_once() {
        let (mut bridge_tx, _out, mut rx, _tx) = pair(CycleKind::Http);

        assert!(bridge_tx.send(ServerEvent::HttpRequest { body: Bytes::new(), more_body: false }).await);
        bridge_tx.disconnect(None);

        assert!(matches!(rx.recv().await, Some(ServerEvent::HttpRequest { .. })));
        assert!(matches!(rx.recv().await, Some(ServerEvent::HttpDisconnect)));
        assert!(rx.recv().await.is_none());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_websocket_disconnect_code() {
        let (mut bridge_tx, _out, mut rx, _tx) = pair(CycleKind::WebSocket);
        bridge_tx.disconnect(Some(1001));
        assert!(matches!(
            rx.recv().await,
            Some(ServerEvent::WebSocketDisconnect { code: 1001 }),
        ));
        assert!(rx.recv().await.is_none());
    }
}
