//! Dedicated writer task for outbound frames.
//!
//! Every response on a socket goes through one writer task fed by an mpsc
//! channel. A message carries all frames of one response, so chunked bodies
//! are written back to back and never interleave with another call's frames.
//!
//! # Architecture
//!
//! ```text
//! Call task 1 ─┐
//! Call task 2 ─┼─► mpsc::Sender<OutboundMessage> ─► Writer Task ─► Socket
//! Handshake   ─┘
//! ```
//!
//! Ready messages are batched into a single `write_vectored` call, and a
//! pending count provides backpressure. Senders over the limit park on a
//! [`Notify`] until the writer drains a batch.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;

use crate::error::{Result, ServiceError};

/// Default maximum pending messages before backpressure kicks in.
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 1024;

/// Default channel capacity.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum messages to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Frames of one response, written contiguously.
#[derive(Debug)]
pub struct OutboundMessage {
    /// Fully encoded frames (prefix + header + context + body chunk).
    pub frames: Vec<Bytes>,
    /// Signalled once the frames have been flushed.
    ack: Option<oneshot::Sender<()>>,
}

impl OutboundMessage {
    /// Create a message from encoded frames.
    #[inline]
    pub fn new(frames: Vec<Bytes>) -> Self {
        Self { frames, ack: None }
    }

    /// Total size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.frames.iter().map(Bytes::len).sum()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Maximum pending messages before backpressure kicks in.
    pub max_pending_messages: usize,
    /// Channel capacity for the message queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    #[serde(with = "crate::config::duration_millis")]
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Messages queued but not yet written, shared by the handles and the task.
#[derive(Debug, Default)]
struct Backlog {
    pending: AtomicUsize,
    drained: Notify,
}

impl Backlog {
    fn count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    fn release(&self, n: usize) {
        self.pending.fetch_sub(n, Ordering::Release);
        self.drained.notify_waiters();
    }
}

/// Handle for sending messages to the writer task.
///
/// Cheaply cloneable; each dispatched call holds one.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundMessage>,
    backlog: Arc<Backlog>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    fn new(tx: mpsc::Sender<OutboundMessage>, backlog: Arc<Backlog>, max_pending: usize, timeout: Duration) -> Self {
        Self {
            tx,
            backlog,
            max_pending,
            timeout,
        }
    }

    /// Queue frames for writing.
    ///
    /// Waits while backpressure is active, timing out after the configured
    /// duration.
    pub async fn send(&self, frames: Vec<Bytes>) -> Result<()> {
        self.enqueue(OutboundMessage::new(frames)).await
    }

    /// Queue frames and wait until they have been flushed to the socket.
    ///
    /// Used before closing a socket so the last reply is not lost.
    pub async fn send_and_flush(&self, frames: Vec<Bytes>) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.enqueue(OutboundMessage {
            frames,
            ack: Some(ack_tx),
        })
        .await?;
        ack_rx.await.map_err(|_| ServiceError::ConnectionClosed)
    }

    async fn enqueue(&self, message: OutboundMessage) -> Result<()> {
        if self.backlog.count() >= self.max_pending {
            self.wait_for_backpressure().await?;
        }

        self.backlog.pending.fetch_add(1, Ordering::AcqRel);

        self.tx.send(message).await.map_err(|_| {
            self.backlog.release(1);
            ServiceError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.timeout;

        loop {
            // Register before checking so a release in between is not missed.
            let drained = self.backlog.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.backlog.count() < self.max_pending {
                return Ok(());
            }

            tokio::time::timeout_at(deadline, drained)
                .await
                .map_err(|_| ServiceError::BackpressureTimeout)?;
        }
    }

    /// Check if backpressure is currently active.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.backlog.count() >= self.max_pending
    }

    /// Get current pending message count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.backlog.count()
    }

    /// Check whether the writer task has gone away.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending messages.
///
/// # Arguments
///
/// * `writer` - The socket write half
/// * `config` - Writer configuration
///
/// # Returns
///
/// A tuple of `(WriterHandle, JoinHandle)`. The task ends cleanly when every
/// handle is dropped, or with an error when a write fails.
pub fn spawn_writer_task<W>(writer: W, config: &WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let backlog = Arc::new(Backlog::default());

    let handle = WriterHandle::new(tx, backlog.clone(), config.max_pending_messages, config.backpressure_timeout);

    let task = tokio::spawn(writer_loop(rx, writer, backlog));

    (handle, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundMessage>, mut writer: W, backlog: Arc<Backlog>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = match rx.recv().await {
            Some(m) => m,
            None => {
                // All handles dropped.
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let frames: Vec<&Bytes> = batch.iter().flat_map(|m| m.frames.iter()).collect();
        let outcome = write_batch(&mut writer, &frames).await;
        backlog.release(batch_size);
        outcome?;

        for message in batch {
            if let Some(ack) = message.ack {
                let _ = ack.send(());
            }
        }
    }
}

/// Write frames using scatter/gather I/O, resuming after partial writes.
async fn write_batch<W>(writer: &mut W, frames: &[&Bytes]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total_size: usize = frames.iter().map(|f| f.len()).sum();
    if total_size == 0 {
        return Ok(());
    }

    let mut total_written = 0;
    while total_written < total_size {
        let slices = build_remaining_slices(frames, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(ServiceError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }

        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for data remaining after `skip_bytes`.
fn build_remaining_slices<'a>(frames: &[&'a Bytes], skip_bytes: usize) -> Vec<IoSlice<'a>> {
    let mut slices = Vec::with_capacity(frames.len());
    let mut offset = 0;

    for frame in frames {
        let end = offset + frame.len();
        if skip_bytes < end && !frame.is_empty() {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame[start..]));
        }
        offset = end;
    }

    slices
}
