//! Handler module - endpoints callable by the directory.
//!
//! Provides:
//! - [`HandlerRegistry`] - flat table of lowercase names to handlers
//! - [`Endpoint`] - function, object or table registration shapes
//! - [`Context`] - per-call ids and echoed header
//! - [`SystemCall`] - the built-in `sys_*` calls
//!
//! # Example
//!
//! ```ignore
//! use servicereg_client::handler::{Context, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.add_function("demo_echo", |(text,): (String,), _ctx: Context| async move {
//!     Ok(text)
//! });
//! ```

mod context;
mod registry;
mod system;

pub use context::Context;
pub use registry::{BoxFuture, Endpoint, Handler, HandlerRegistry, HandlerResult, ServiceObject, TypedHandler};
pub use system::{relay_log, system_names, SystemCall};
