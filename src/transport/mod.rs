//! Transport module - how the directory socket is opened.
//!
//! The connection state machine only sees a [`Connector`], so it runs the
//! same way over TCP, TLS or an in-memory duplex in tests.

mod tcp;

pub use tcp::{TcpConnector, DEFAULT_CONNECT_TIMEOUT};

use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;
use crate::handler::BoxFuture;

/// Byte stream usable as a directory socket.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased socket.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Where to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Host name or address; also the TLS server name.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Wrap the socket in TLS.
    pub tls: bool,
}

impl Target {
    /// Create a target.
    pub fn new(host: impl Into<String>, port: u16, tls: bool) -> Self {
        Self {
            host: host.into(),
            port,
            tls,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Opens sockets to a [`Target`].
pub trait Connector: Send + Sync + 'static {
    /// Open one socket. Failures are treated as transient by the caller.
    fn connect(&self, target: &Target) -> BoxFuture<'static, Result<BoxedStream>>;
}
