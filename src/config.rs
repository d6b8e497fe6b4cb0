//! Service configuration and directory environments.
//!
//! [`ServiceConfig`] is plain serde data so it can be loaded from whatever
//! format the embedding application uses. Durations are written as whole
//! milliseconds.
//!
//! # Example
//!
//! ```
//! use servicereg_client::config::{Environment, ServiceConfig};
//!
//! let config: ServiceConfig = serde_json::from_str(
//!     r#"{"app": "demo", "service": "test", "key": "123456", "environment": "production"}"#,
//! )
//! .unwrap();
//!
//! assert_eq!(config.version, "1.0");
//! assert_eq!(config.target().to_string(), "service-prod.xdapp.com:8900");
//! assert_eq!(config.environment, Environment::Production);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::DEFAULT_MAX_CONCURRENT_HANDLERS;
use crate::handshake::{Credentials, DEFAULT_IP_LOOKUP_URL};
use crate::protocol::DEFAULT_MAX_FRAME_LENGTH;
use crate::transport::{Target, DEFAULT_CONNECT_TIMEOUT};
use crate::writer::WriterConfig;

/// Default declared client version.
pub const DEFAULT_VERSION: &str = "1.0";

/// Default pause between a lost socket and the next connect attempt.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Directory deployment to connect to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    /// Local directory on `127.0.0.1:8061`, plain TCP.
    #[default]
    LocalDev,
    /// Development directory.
    Dev,
    /// Production, default region.
    Production,
    /// Production, Asia region.
    ProductionAsia,
    /// Production, Europe region.
    ProductionEurope,
}

impl Environment {
    /// Socket target of this environment.
    pub fn target(self) -> Target {
        match self {
            Environment::LocalDev => Target::new("127.0.0.1", 8061, false),
            Environment::Dev => Target::new("service-dev.xdapp.com", 8100, true),
            Environment::Production => Target::new("service-prod.xdapp.com", 8900, true),
            Environment::ProductionAsia => Target::new("service-asia.xdapp.com", 8900, true),
            Environment::ProductionEurope => Target::new("service-eu.xdapp.com", 8900, true),
        }
    }
}

/// Everything needed to run one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Application name.
    pub app: String,
    /// Service name; also the web-callable prefix.
    pub service: String,
    /// Pre-shared registration key.
    pub key: String,
    /// Declared client version.
    pub version: String,
    /// Directory deployment.
    pub environment: Environment,
    /// Overrides the environment's host.
    pub host: Option<String>,
    /// Overrides the environment's port.
    pub port: Option<u16>,
    /// Overrides the environment's TLS setting.
    pub tls: Option<bool>,
    /// Socket connect timeout.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Pause before reconnecting.
    #[serde(with = "duration_millis")]
    pub reconnect_delay: Duration,
    /// Largest accepted inbound frame.
    pub max_frame_length: u32,
    /// Cap on concurrently running request frames.
    pub max_concurrent_handlers: usize,
    /// Outbound queue settings.
    pub writer: WriterConfig,
    /// Base URL of the public address lookup.
    pub ip_lookup_url: String,
}

impl ServiceConfig {
    /// Configuration with defaults for everything but the identity.
    pub fn new(app: impl Into<String>, service: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            service: service.into(),
            key: key.into(),
            ..Self::default()
        }
    }

    /// Target after applying the host, port and TLS overrides.
    pub fn target(&self) -> Target {
        let base = self.environment.target();
        Target::new(
            self.host.clone().unwrap_or(base.host),
            self.port.unwrap_or(base.port),
            self.tls.unwrap_or(base.tls),
        )
    }

    /// Identity presented during registration.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            app: self.app.clone(),
            service: self.service.clone(),
            key: self.key.clone(),
            version: self.version.clone(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            app: String::new(),
            service: String::new(),
            key: String::new(),
            version: DEFAULT_VERSION.to_string(),
            environment: Environment::default(),
            host: None,
            port: None,
            tls: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            max_concurrent_handlers: DEFAULT_MAX_CONCURRENT_HANDLERS,
            writer: WriterConfig::default(),
            ip_lookup_url: DEFAULT_IP_LOOKUP_URL.to_string(),
        }
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_environment_targets() {
        assert_eq!(Environment::LocalDev.target(), Target::new("127.0.0.1", 8061, false));
        assert_eq!(Environment::Dev.target().to_string(), "service-dev.xdapp.com:8100");
        assert!(Environment::Dev.target().tls);
        assert_eq!(Environment::ProductionAsia.target().host, "service-asia.xdapp.com");
        assert_eq!(Environment::ProductionEurope.target().host, "service-eu.xdapp.com");
    }

    #[test]
    fn test_defaults() {
        let config = ServiceConfig::new("demo", "test", "123456");
        assert_eq!(config.version, "1.0");
        assert_eq!(config.environment, Environment::LocalDev);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert_eq!(config.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.max_frame_length, 0x21000);
        assert_eq!(config.max_concurrent_handlers, 256);
    }

    #[test]
    fn test_overrides_apply_to_target() {
        let mut config = ServiceConfig::new("demo", "test", "123456");
        config.environment = Environment::Production;
        config.port = Some(9000);
        config.tls = Some(false);

        assert_eq!(config.target(), Target::new("service-prod.xdapp.com", 9000, false));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ServiceConfig = serde_json::from_value(json!({
            "app": "demo",
            "service": "test",
            "key": "k",
            "environment": "production_europe",
            "reconnect_delay": 2500,
            "writer": { "channel_capacity": 8 }
        }))
        .unwrap();

        assert_eq!(config.environment, Environment::ProductionEurope);
        assert_eq!(config.reconnect_delay, Duration::from_millis(2500));
        assert_eq!(config.writer.channel_capacity, 8);
        assert_eq!(config.writer.max_pending_messages, 1024);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));

        let back = serde_json::to_value(&config).unwrap();
        assert_eq!(back["reconnect_delay"], json!(2500));
    }

    #[test]
    fn test_credentials() {
        let config = ServiceConfig::new("demo", "test", "123456");
        let credentials = config.credentials();
        assert_eq!(credentials.app, "demo");
        assert_eq!(credentials.version, "1.0");
    }
}
