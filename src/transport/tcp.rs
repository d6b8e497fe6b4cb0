//! TCP and TLS connector.
//!
//! TLS uses rustls with the ring provider and the webpki root store; the
//! target host doubles as the SNI server name.

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::{BoxedStream, Connector, Target};
use crate::error::{Result, ServiceError};
use crate::handler::BoxFuture;

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Connector over `tokio::net::TcpStream`, optionally wrapped in TLS.
#[derive(Clone)]
pub struct TcpConnector {
    timeout: Duration,
    tls: Arc<ClientConfig>,
}

impl TcpConnector {
    /// Create a connector with the given connect timeout.
    pub fn new(timeout: Duration) -> Self {
        // Another provider may already be installed; either is fine.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            timeout,
            tls: Arc::new(config),
        }
    }

    /// Connect timeout in use.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl Connector for TcpConnector {
    fn connect(&self, target: &Target) -> BoxFuture<'static, Result<BoxedStream>> {
        let target = target.clone();
        let timeout = self.timeout;
        let tls = self.tls.clone();

        Box::pin(async move {
            let addr = (target.host.as_str(), target.port);
            let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    ServiceError::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect to {} timed out after {:?}", target, timeout),
                    ))
                })??;
            stream.set_nodelay(true)?;

            if !target.tls {
                return Ok(Box::new(stream) as BoxedStream);
            }

            let server_name = ServerName::try_from(target.host.clone())
                .map_err(|e| ServiceError::Tls(format!("invalid server name {}: {}", target.host, e)))?;
            let stream = tokio::time::timeout(timeout, TlsConnector::from(tls).connect(server_name, stream))
                .await
                .map_err(|_| ServiceError::Tls(format!("TLS handshake with {} timed out", target)))??;

            Ok(Box::new(stream) as BoxedStream)
        })
    }
}
