//! # servicereg-client
//!
//! Worker-side client for the XDApp service registration and RPC protocol.
//!
//! A service dials the directory, proves it holds the shared key through a
//! three-step handshake, then answers Hprose calls relayed by the directory
//! until the socket drops. Lost sockets are re-dialed after a short delay;
//! handshake failures stop the service for good.
//!
//! ## Architecture
//!
//! - **Frame codec** ([`protocol`]): 6-byte prefix, 17-byte header, opaque
//!   context, chunked bodies
//! - **Call scanner** ([`codec`]): splits a body into named calls with raw
//!   argument spans
//! - **Connection** ([`connection`]): connect, receive, back off, repeat
//! - **Handshake** ([`handshake`]): `sys_reg` / `sys_regOk` / `sys_regErr`
//! - **Dispatcher** ([`dispatcher`]): trust gating and routing to handlers
//!
//! ## Example
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
//!     service.connect_to_local_dev("127.0.0.1", 8061).await.unwrap_err();
//! }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod handshake;
pub mod protocol;
pub mod state;
pub mod transport;
pub mod writer;

mod service;

pub use config::{Environment, ServiceConfig};
pub use dispatcher::ResultSink;
pub use error::{Result, ServiceError};
pub use handler::{Context, Endpoint, ServiceObject};
pub use service::{Service, ServiceBuilder};
pub use state::Phase;
