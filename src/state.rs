//! Connection state shared between the receive loop, handshake and call tasks.
//!
//! `trusted` and `fatal` are written by the handshake and error paths and read
//! by the dispatcher. They live behind one `parking_lot::Mutex` together with
//! the phase so transitions are observed atomically.
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─► Registering ─► Trusted
//!       ▲              │            │             │            │
//!       └──────────────┴────────────┴─────────────┴────────────┘  (socket lost)
//!
//! any ──► Fatal   (sticky)
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;

use crate::error::Result;
use crate::writer::WriterHandle;

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No socket.
    Disconnected,
    /// Socket connect in progress.
    Connecting,
    /// Socket up, registration not started.
    Connected,
    /// Challenge answered, waiting for confirmation.
    Registering,
    /// Registration confirmed; all handlers reachable.
    Trusted,
    /// Reconnection disabled until restart.
    Fatal,
}

impl Phase {
    /// Check if a socket is live in this phase.
    #[inline]
    pub fn is_connected(self) -> bool {
        matches!(self, Phase::Connected | Phase::Registering | Phase::Trusted)
    }
}

#[derive(Debug)]
struct Inner {
    phase: Phase,
    trusted: bool,
    fatal: bool,
    service_data: Option<Value>,
}

/// Trust and fatal flags plus the current phase.
#[derive(Debug)]
pub struct ConnectionState {
    inner: Mutex<Inner>,
}

impl ConnectionState {
    /// Fresh state: disconnected, untrusted, not fatal.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: Phase::Disconnected,
                trusted: false,
                fatal: false,
                service_data: None,
            }),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.lock().phase
    }

    /// Check whether registration has completed on the current socket.
    pub fn is_trusted(&self) -> bool {
        self.inner.lock().trusted
    }

    /// Check whether reconnection is disabled.
    pub fn is_fatal(&self) -> bool {
        self.inner.lock().fatal
    }

    /// Service data sent by the directory on confirmation.
    pub fn service_data(&self) -> Option<Value> {
        self.inner.lock().service_data.clone()
    }

    /// Enter `Connecting`. Refused once fatal.
    pub fn begin_connecting(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.fatal {
            inner.phase = Phase::Fatal;
            return false;
        }
        inner.phase = Phase::Connecting;
        true
    }

    /// Socket established.
    pub fn connected(&self) {
        let mut inner = self.inner.lock();
        if !inner.fatal {
            inner.phase = Phase::Connected;
        }
    }

    /// Challenge answered successfully.
    pub fn registering(&self) {
        let mut inner = self.inner.lock();
        if !inner.fatal && !inner.trusted {
            inner.phase = Phase::Registering;
        }
    }

    /// Mark the connection trusted.
    ///
    /// Returns `false`, leaving state untouched, when already trusted or fatal.
    pub fn trust(&self, service_data: Value) -> bool {
        let mut inner = self.inner.lock();
        if inner.trusted || inner.fatal {
            return false;
        }
        inner.trusted = true;
        inner.service_data = Some(service_data);
        inner.phase = Phase::Trusted;
        true
    }

    /// Disable reconnection for the life of this state.
    pub fn set_fatal(&self) {
        let mut inner = self.inner.lock();
        inner.fatal = true;
        inner.trusted = false;
        inner.phase = Phase::Fatal;
    }

    /// Socket closed or connect failed; trust does not survive.
    pub fn disconnected(&self) {
        let mut inner = self.inner.lock();
        inner.trusted = false;
        inner.service_data = None;
        inner.phase = if inner.fatal { Phase::Fatal } else { Phase::Disconnected };
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to the live socket: its writer and a close signal.
///
/// Cloned into every task that may answer on or close the socket. Closing is
/// observed by the receive loop, which tears the socket down.
#[derive(Clone)]
pub struct Link {
    writer: WriterHandle,
    close_tx: Arc<watch::Sender<bool>>,
}

impl Link {
    /// Create a link and the receiver the receive loop waits on.
    pub fn new(writer: WriterHandle) -> (Self, watch::Receiver<bool>) {
        let (close_tx, close_rx) = watch::channel(false);
        (
            Self {
                writer,
                close_tx: Arc::new(close_tx),
            },
            close_rx,
        )
    }

    /// Queue encoded frames.
    pub async fn send(&self, frames: Vec<Bytes>) -> Result<()> {
        self.writer.send(frames).await
    }

    /// Queue encoded frames and wait until they are on the socket.
    pub async fn send_and_flush(&self, frames: Vec<Bytes>) -> Result<()> {
        self.writer.send_and_flush(frames).await
    }

    /// Ask the receive loop to close the socket.
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    /// Check whether a close was requested.
    pub fn is_closing(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// Writer handle for this socket.
    pub fn writer(&self) -> &WriterHandle {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_initial_state() {
        let state = ConnectionState::new();
        assert_eq!(state.phase(), Phase::Disconnected);
        assert!(!state.is_trusted());
        assert!(!state.is_fatal());
        assert!(state.service_data().is_none());
    }

    #[test]
    fn test_happy_path_transitions() {
        let state = ConnectionState::new();
        assert!(state.begin_connecting());
        assert_eq!(state.phase(), Phase::Connecting);
        state.connected();
        assert!(state.phase().is_connected());
        state.registering();
        assert_eq!(state.phase(), Phase::Registering);
        assert!(state.trust(json!({"id": 1})));
        assert_eq!(state.phase(), Phase::Trusted);
        assert_eq!(state.service_data(), Some(json!({"id": 1})));
    }

    #[test]
    fn test_trust_is_not_reapplied() {
        let state = ConnectionState::new();
        assert!(state.trust(json!(1)));
        assert!(!state.trust(json!(2)));
        assert_eq!(state.service_data(), Some(json!(1)));
    }

    #[test]
    fn test_disconnect_resets_trust() {
        let state = ConnectionState::new();
        state.begin_connecting();
        state.connected();
        state.trust(json!(null));
        state.disconnected();
        assert!(!state.is_trusted());
        assert_eq!(state.phase(), Phase::Disconnected);
    }

    #[test]
    fn test_fatal_is_sticky() {
        let state = ConnectionState::new();
        state.begin_connecting();
        state.connected();
        state.set_fatal();
        state.disconnected();

        assert!(state.is_fatal());
        assert_eq!(state.phase(), Phase::Fatal);
        assert!(!state.begin_connecting());
        assert!(!state.trust(json!(null)));
        state.connected();
        assert_eq!(state.phase(), Phase::Fatal);
    }

    #[tokio::test]
    async fn test_link_close_signal() {
        let (client, _server) = tokio::io::duplex(64);
        let (writer, _task) = crate::writer::spawn_writer_task(client, &Default::default());
        let (link, mut close_rx) = Link::new(writer);

        assert!(!link.is_closing());
        link.clone().close();
        close_rx.changed().await.unwrap();
        assert!(*close_rx.borrow());
        assert!(link.is_closing());
    }
}
