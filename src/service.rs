//! Public entry point: build a service, register endpoints, connect.
//!
//! # Example
//!
//! ```ignore
//! use servicereg_client::Service;
//!
//! #[tokio::main]
//! async fn main() {
//!     let service = Service::builder("demo", "test", "123456")
//!         .web_function("hello", |(name,): (String,), _ctx| async move {
//!             Ok(format!("hello {}", name))
//!         })
//!         .build();
//!
//!     // Returns only when registration fails for good.
//!     let _ = service.connect_to_production().await;
//! }
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::config::{Environment, ServiceConfig};
use crate::connection::{Connection, ConnectionSettings};
use crate::dispatcher::{Dispatcher, ResultSink};
use crate::error::{Result, ServiceError};
use crate::handler::{Context, Endpoint, HandlerRegistry};
use crate::handshake::{Handshake, IpLookup};
use crate::state::{ConnectionState, Phase};
use crate::transport::{Connector, TcpConnector, Target};

/// Prefix reserved for built-in calls.
const SYSTEM_PREFIX: &str = "sys_";

/// Builder for a [`Service`].
pub struct ServiceBuilder {
    config: ServiceConfig,
    registry: HandlerRegistry,
    result_sink: Option<Arc<dyn ResultSink>>,
    connector: Option<Arc<dyn Connector>>,
}

impl ServiceBuilder {
    /// Start from an identity and default settings.
    pub fn new(app: impl Into<String>, service: impl Into<String>, key: impl Into<String>) -> Self {
        Self::from_config(ServiceConfig::new(app, service, key))
    }

    /// Start from a full configuration.
    pub fn from_config(config: ServiceConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            result_sink: None,
            connector: None,
        }
    }

    /// Set the declared client version.
    ///
    /// Default: "1.0"
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.config.version = version.into();
        self
    }

    /// Select the directory deployment used by [`Service::run`].
    pub fn environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    /// Override the directory host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = Some(host.into());
        self
    }

    /// Override the directory port.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Override TLS on or off.
    pub fn tls(mut self, tls: bool) -> Self {
        self.config.tls = Some(tls);
        self
    }

    /// Set the connect timeout.
    ///
    /// Default: 1 second
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the pause before reconnecting.
    ///
    /// Default: 1 second
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.reconnect_delay = delay;
        self
    }

    /// Set the largest accepted inbound frame.
    ///
    /// Default: 0x21000
    pub fn max_frame_length(mut self, length: u32) -> Self {
        self.config.max_frame_length = length;
        self
    }

    /// Set the maximum number of concurrently running request frames.
    ///
    /// When this limit is reached, new requests are dropped with a warning.
    /// Default: 256
    pub fn max_concurrent_handlers(mut self, limit: usize) -> Self {
        self.config.max_concurrent_handlers = limit;
        self
    }

    /// Set the maximum pending responses for backpressure.
    ///
    /// Default: 1024
    pub fn max_pending_messages(mut self, limit: usize) -> Self {
        self.config.writer.max_pending_messages = limit;
        self
    }

    /// Set the writer channel capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.writer.channel_capacity = capacity;
        self
    }

    /// Set the backpressure timeout.
    ///
    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.writer.backpressure_timeout = timeout;
        self
    }

    /// Set the base URL of the public address lookup.
    pub fn ip_lookup_url(mut self, url: impl Into<String>) -> Self {
        self.config.ip_lookup_url = url.into();
        self
    }

    /// Register an endpoint under `name`.
    ///
    /// Names starting with `sys_` are reserved and ignored.
    pub fn endpoint(mut self, name: &str, endpoint: Endpoint) -> Self {
        if name.to_lowercase().starts_with(SYSTEM_PREFIX) {
            tracing::warn!(endpoint = %name, "Names starting with `sys_` are reserved, ignored");
            return self;
        }
        self.registry.add(name, endpoint);
        self
    }

    /// Register a typed closure under `name`.
    ///
    /// Only names under the service's own prefix are callable from the web;
    /// see [`web_function`](Self::web_function).
    pub fn function<F, T, R, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(T, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        self.endpoint(name, Endpoint::function(handler))
    }

    /// Register a typed closure as `{service}_{name}`.
    pub fn web_function<F, T, R, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(T, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let full = format!("{}_{}", self.config.service, name);
        self.endpoint(&full, Endpoint::function(handler))
    }

    /// Receive result frames for calls this side initiates.
    pub fn result_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.result_sink = Some(sink);
        self
    }

    /// Replace the TCP/TLS connector.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Finish building. No socket is opened until the service is run.
    pub fn build(self) -> Service {
        let state = Arc::new(ConnectionState::new());
        let registry = Arc::new(self.registry);
        let handshake = Arc::new(Handshake::new(
            self.config.credentials(),
            state.clone(),
            registry.clone(),
            IpLookup::new(self.config.ip_lookup_url.clone()),
        ));
        let dispatcher = Dispatcher::new(
            registry,
            handshake,
            state.clone(),
            self.config.max_concurrent_handlers,
            self.result_sink,
        );
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TcpConnector::new(self.config.connect_timeout)) as Arc<dyn Connector>);

        Service {
            config: self.config,
            state,
            dispatcher,
            connector,
            running: AtomicBool::new(false),
        }
    }
}

/// A registered service and its directory connection.
pub struct Service {
    config: ServiceConfig,
    state: Arc<ConnectionState>,
    dispatcher: Dispatcher,
    connector: Arc<dyn Connector>,
    running: AtomicBool,
}

/// Clears the running flag when a run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Service {
    /// Create a new service builder.
    pub fn builder(app: impl Into<String>, service: impl Into<String>, key: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder::new(app, service, key)
    }

    /// Connect to the configured target and serve until registration fails.
    ///
    /// # Errors
    ///
    /// [`ServiceError::AlreadyRunning`] if another run is active,
    /// [`ServiceError::Fatal`] once reconnection is disabled.
    pub async fn run(&self) -> Result<()> {
        self.run_with(self.config.target()).await
    }

    /// Connect to a local directory over plain TCP.
    pub async fn connect_to_local_dev(&self, host: &str, port: u16) -> Result<()> {
        self.run_with(Target::new(host, port, false)).await
    }

    /// Connect to the development directory.
    pub async fn connect_to_dev(&self) -> Result<()> {
        self.run_with(Environment::Dev.target()).await
    }

    /// Connect to the production directory.
    pub async fn connect_to_production(&self) -> Result<()> {
        self.run_with(Environment::Production.target()).await
    }

    /// Connect to the Asia production directory.
    pub async fn connect_to_production_asia(&self) -> Result<()> {
        self.run_with(Environment::ProductionAsia.target()).await
    }

    /// Connect to the Europe production directory.
    pub async fn connect_to_production_europe(&self) -> Result<()> {
        self.run_with(Environment::ProductionEurope.target()).await
    }

    /// Serve against an explicit target.
    pub async fn run_with(&self, target: Target) -> Result<()> {
        if self.state.is_fatal() {
            tracing::error!("Service is in fatal state, restart required");
            return Err(ServiceError::Fatal);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(ServiceError::AlreadyRunning);
        }
        let _guard = RunGuard(&self.running);

        tracing::info!(
            app = %self.config.app,
            service = %self.config.service,
            "Connecting to {}",
            target
        );

        let settings = ConnectionSettings {
            reconnect_delay: self.config.reconnect_delay,
            max_frame_length: self.config.max_frame_length,
            writer: self.config.writer.clone(),
        };
        let connection = Connection::new(
            target,
            self.connector.clone(),
            self.dispatcher.clone(),
            self.state.clone(),
            settings,
        );
        connection.run().await
    }

    /// Configuration in use.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Every name the directory may call.
    pub fn names(&self) -> Vec<String> {
        self.dispatcher.function_names()
    }

    /// Check whether the current socket completed registration.
    pub fn is_trusted(&self) -> bool {
        self.state.is_trusted()
    }

    /// Check whether reconnection is disabled.
    pub fn is_fatal(&self) -> bool {
        self.state.is_fatal()
    }

    /// Current connection phase.
    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Service data received with the registration confirmation.
    pub fn service_data(&self) -> Option<Value> {
        self.state.service_data()
    }
}
