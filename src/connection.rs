//! Connection state machine: connect, receive, back off, repeat.
//!
//! One [`Connection`] drives one directory socket at a time:
//!
//! 1. Refuse to connect once the state is fatal
//! 2. Open the socket through the [`Connector`]
//! 3. Spawn the writer task and read frames until EOF, error or close
//! 4. Drop trust, wait the reconnect delay, go to 1
//!
//! Connect failures, read errors and framing errors are transient and only
//! logged. Handshake failures set the fatal flag, which ends [`Connection::run`]
//! with [`ServiceError::Fatal`].

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;

use crate::dispatcher::Dispatcher;
use crate::error::{Result, ServiceError};
use crate::protocol::FrameBuffer;
use crate::state::{ConnectionState, Link};
use crate::transport::{BoxedStream, Connector, Target};
use crate::writer::{spawn_writer_task, WriterConfig};

/// Socket read buffer size.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Per-socket settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Pause between a lost socket and the next attempt.
    pub reconnect_delay: Duration,
    /// Largest accepted inbound frame.
    pub max_frame_length: u32,
    /// Outbound queue settings.
    pub writer: WriterConfig,
}

/// Reconnecting client connection to one target.
pub struct Connection {
    target: Target,
    connector: Arc<dyn Connector>,
    dispatcher: Dispatcher,
    state: Arc<ConnectionState>,
    settings: ConnectionSettings,
}

impl Connection {
    /// Create a connection; nothing happens until [`run`](Self::run).
    pub fn new(
        target: Target,
        connector: Arc<dyn Connector>,
        dispatcher: Dispatcher,
        state: Arc<ConnectionState>,
        settings: ConnectionSettings,
    ) -> Self {
        Self {
            target,
            connector,
            dispatcher,
            state,
            settings,
        }
    }

    /// Target this connection dials.
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Run until the state becomes fatal.
    ///
    /// # Errors
    ///
    /// Always ends with [`ServiceError::Fatal`]; transient failures are
    /// retried.
    pub async fn run(&self) -> Result<()> {
        loop {
            if !self.state.begin_connecting() {
                tracing::error!(addr = %self.target, "Connection is fatal, not reconnecting; restart required");
                return Err(ServiceError::Fatal);
            }

            match self.connector.connect(&self.target).await {
                Ok(stream) => {
                    self.state.connected();
                    tracing::info!(addr = %self.target, "Connected to {}", self.target);
                    match self.serve(stream).await {
                        Ok(()) => tracing::info!(addr = %self.target, "Connection closed"),
                        Err(e) => tracing::warn!(addr = %self.target, "Connection lost: {}", e),
                    }
                }
                Err(e) => {
                    tracing::warn!(addr = %self.target, "Connect failed: {}", e);
                }
            }

            self.state.disconnected();
            if self.state.is_fatal() {
                tracing::error!(addr = %self.target, "Connection is fatal, not reconnecting; restart required");
                return Err(ServiceError::Fatal);
            }

            tracing::debug!(
                addr = %self.target,
                "Reconnecting in {:?}",
                self.settings.reconnect_delay
            );
            tokio::time::sleep(self.settings.reconnect_delay).await;
        }
    }

    /// Read and dispatch frames until the socket ends or a close is requested.
    async fn serve(&self, stream: BoxedStream) -> Result<()> {
        let (mut reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, &self.settings.writer);
        let (link, mut close_rx) = Link::new(writer);

        let mut frame_buffer = FrameBuffer::with_max_length(self.settings.max_frame_length);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result = 'read: loop {
            tokio::select! {
                read = reader.read(&mut buf) => {
                    let n = match read {
                        Ok(0) => break 'read Ok(()),
                        Ok(n) => n,
                        Err(e) => break 'read Err(ServiceError::Io(e)),
                    };

                    let frames = match frame_buffer.push(&buf[..n]) {
                        Ok(frames) => frames,
                        Err(e) => break 'read Err(e),
                    };

                    for frame in frames {
                        self.dispatcher.dispatch(frame, &link).await;
                        if link.is_closing() {
                            break 'read Ok(());
                        }
                    }
                }
                _ = close_rx.changed() => break 'read Ok(()),
            }
        };

        writer_task.abort();
        result
    }
}
