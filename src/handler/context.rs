//! Per-call context.
//!
//! A [`Context`] is built from the inbound frame right before dispatch and
//! handed to the handler by value. It carries the request ids and the raw
//! header+context bytes that every response must echo.
//!
//! # Example
//!
//! ```ignore
//! registry.add_function("whoami", |_: (), ctx: Context| async move {
//!     ctx.set_user_data("seen", true);
//!     Ok(json!({ "admin": ctx.admin_id(), "app": ctx.app_id() }))
//! });
//! ```

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::protocol::{build_frames, flags, Frame};

/// Context passed to handlers.
///
/// Cheap to clone; clones share the same user data. A context never outlives
/// the frame it was built from.
#[derive(Debug, Clone)]
pub struct Context {
    app_id: u32,
    service_id: u32,
    request_id: u32,
    admin_id: u32,
    flag: u8,
    version: u8,
    header_and_context: Bytes,
    user_data: Arc<Mutex<Map<String, Value>>>,
}

impl Context {
    /// Build the context for an inbound request frame.
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            app_id: frame.header.app_id,
            service_id: frame.header.service_id,
            request_id: frame.header.request_id,
            admin_id: frame.header.admin_id,
            flag: frame.flag,
            version: frame.version,
            header_and_context: frame.header_and_context(),
            user_data: Arc::new(Mutex::new(Map::new())),
        }
    }

    /// Application id of the caller.
    #[inline]
    pub fn app_id(&self) -> u32 {
        self.app_id
    }

    /// Service id the request was addressed to.
    #[inline]
    pub fn service_id(&self) -> u32 {
        self.service_id
    }

    /// Request id, echoed in the response header.
    #[inline]
    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    /// Administrator on whose behalf the call was made.
    #[inline]
    pub fn admin_id(&self) -> u32 {
        self.admin_id
    }

    /// Flags of the request frame.
    #[inline]
    pub fn flag(&self) -> u8 {
        self.flag
    }

    /// Check if the call was issued by the directory itself.
    #[inline]
    pub fn is_sys_msg(&self) -> bool {
        flags::has_flag(self.flag, flags::SYS_MSG)
    }

    /// Check if the call was forwarded from a browser.
    #[inline]
    pub fn is_transport(&self) -> bool {
        flags::has_flag(self.flag, flags::TRANSPORT)
    }

    /// Raw header and context of the request.
    #[inline]
    pub fn header_and_context(&self) -> &Bytes {
        &self.header_and_context
    }

    /// Read a user data entry.
    pub fn user_data(&self, key: &str) -> Option<Value> {
        self.user_data.lock().get(key).cloned()
    }

    /// Store a user data entry.
    pub fn set_user_data(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.user_data.lock().insert(key.into(), value.into());
    }

    /// Frames carrying `body` back to the caller.
    ///
    /// The request flag gains `RESULT_MODE`, the version and the raw
    /// header+context are reused as received.
    pub fn response_frames(&self, body: &[u8]) -> Vec<Bytes> {
        build_frames(
            self.flag | flags::RESULT_MODE,
            self.version,
            &self.header_and_context,
            body,
        )
    }
}
