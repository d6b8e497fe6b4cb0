//! Handler registry mapping lowercase endpoint names to handlers.
//!
//! Endpoints are registered as one of three shapes and flattened into a
//! single name → handler table:
//!
//! - [`Endpoint::Function`] under its own name
//! - [`Endpoint::Object`] as `{name}_{method}` for each method it exposes
//! - [`Endpoint::Table`] as `{name}_{key}` for each entry
//!
//! Names are lowercased. A name registered twice keeps its first handler.
//!
//! # Example
//!
//! ```ignore
//! use servicereg_client::handler::HandlerRegistry;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.add_function("test_hello", |(name,): (String,), _ctx| async move {
//!     Ok(format!("hi: {}", name))
//! });
//!
//! assert!(registry.get("TEST_HELLO").is_some());
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::Context;
use crate::error::{Result, ServiceError};

/// Result type for handler functions.
pub type HandlerResult = Result<Value>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a call with decoded arguments.
    fn call(&self, args: Vec<Value>, ctx: Context) -> BoxFuture<'static, HandlerResult>;
}

/// Object exposing a set of named methods.
pub trait ServiceObject: Send + Sync + 'static {
    /// Method names this object answers to.
    fn methods(&self) -> Vec<String>;

    /// Invoke `method`.
    fn call(&self, method: &str, args: Vec<Value>, ctx: Context) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes arguments and serializes the result.
///
/// The argument list is handed to serde as a JSON array, so `T` is usually a
/// tuple (`(String, u32)`), a `Vec`, or `()` for no arguments.
pub struct TypedHandler<F, T, R, Fut>
where
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> (Fut, R)>,
}

impl<F, T, R, Fut> TypedHandler<F, T, R, Fut>
where
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, R, Fut> Handler for TypedHandler<F, T, R, Fut>
where
    F: Fn(T, Context) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
{
    fn call(&self, args: Vec<Value>, ctx: Context) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match decode_args(args) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.handler)(parsed, ctx);
        Box::pin(async move {
            let value = fut.await?;
            Ok(serde_json::to_value(value)?)
        })
    }
}

/// `()` accepts any argument list, so zero-argument handlers ignore extras.
fn decode_args<T: DeserializeOwned>(args: Vec<Value>) -> Result<T> {
    match serde_json::from_value::<T>(Value::Array(args)) {
        Ok(v) => Ok(v),
        Err(e) => serde_json::from_value::<T>(Value::Null).map_err(|_| ServiceError::Json(e)),
    }
}

/// Bound method of a [`ServiceObject`].
struct ObjectMethod {
    object: Arc<dyn ServiceObject>,
    method: String,
}

impl Handler for ObjectMethod {
    fn call(&self, args: Vec<Value>, ctx: Context) -> BoxFuture<'static, HandlerResult> {
        self.object.call(&self.method, args, ctx)
    }
}

/// Capability-tagged endpoint accepted by [`HandlerRegistry::add`].
pub enum Endpoint {
    /// A single callable.
    Function(Arc<dyn Handler>),
    /// An object exposing named methods.
    Object(Arc<dyn ServiceObject>),
    /// Explicit name → handler entries.
    Table(Vec<(String, Arc<dyn Handler>)>),
}

impl Endpoint {
    /// Wrap a typed closure.
    pub fn function<F, T, R, Fut>(handler: F) -> Self
    where
        F: Fn(T, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        Endpoint::Function(Arc::new(TypedHandler::new(handler)))
    }
}

/// Registry mapping endpoint names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    /// Registration order, for the function list.
    names: Vec<String>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint under `name`.
    ///
    /// Returns the flattened names actually added.
    pub fn add(&mut self, name: &str, endpoint: Endpoint) -> Vec<String> {
        let mut added = Vec::new();
        match endpoint {
            Endpoint::Function(handler) => {
                if self.insert(name.to_string(), handler) {
                    added.push(name.to_lowercase());
                }
            }
            Endpoint::Object(object) => {
                for method in object.methods() {
                    let handler = Arc::new(ObjectMethod {
                        object: object.clone(),
                        method: method.clone(),
                    });
                    let full = join(name, &method);
                    if self.insert(full.clone(), handler) {
                        added.push(full.to_lowercase());
                    }
                }
            }
            Endpoint::Table(entries) => {
                for (key, handler) in entries {
                    let full = join(name, &key);
                    if self.insert(full.clone(), handler) {
                        added.push(full.to_lowercase());
                    }
                }
            }
        }
        added
    }

    /// Register a typed closure under `name`.
    pub fn add_function<F, T, R, Fut>(&mut self, name: &str, handler: F) -> bool
    where
        F: Fn(T, Context) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        !self.add(name, Endpoint::function(handler)).is_empty()
    }

    fn insert(&mut self, name: String, handler: Arc<dyn Handler>) -> bool {
        let name = name.to_lowercase();
        if self.handlers.contains_key(&name) {
            tracing::debug!(endpoint = %name, "Endpoint already registered, ignored");
            return false;
        }
        self.handlers.insert(name.clone(), handler);
        self.names.push(name);
        true
    }

    /// Look up a handler, ignoring case.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(&name.to_lowercase()).cloned()
    }

    /// Check if `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(&name.to_lowercase())
    }

    /// Registered names in registration order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Invoke `name` with `args`.
    ///
    /// # Errors
    ///
    /// [`ServiceError::HandlerNotFound`] when nothing is registered under
    /// `name`, otherwise whatever the handler returns.
    pub async fn dispatch(&self, name: &str, args: Vec<Value>, ctx: Context) -> HandlerResult {
        let handler = self
            .get(name)
            .ok_or_else(|| ServiceError::HandlerNotFound(name.to_string()))?;

        handler.call(args, ctx).await
    }
}

fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}_{}", prefix, name)
    }
}
