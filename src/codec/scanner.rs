//! Call scanner.
//!
//! Splits a request body into its calls. Argument lists are walked tag by
//! tag to find where each call ends, and kept as raw bytes until a handler
//! asks for them.
//!
//! ```text
//! body  := 'z' | call+ 'z'
//! call  := 'C' name [ list [ 't' ] ]
//! ```

use bytes::Bytes;
use serde_json::Value;

use super::reader::Reader;
use super::tags;
use crate::error::{Result, ServiceError};

/// One call parsed out of a request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    /// Function name as sent by the peer.
    pub name: String,
    /// Raw argument list, including its `a` tag. Empty when no list was sent.
    pub args: Bytes,
    /// Number of arguments announced by the list.
    pub arg_count: usize,
    /// Peer asked for arguments to be passed by reference.
    pub by_ref: bool,
}

impl Call {
    /// Decode the argument list.
    pub fn arguments(&self) -> Result<Vec<Value>> {
        if self.args.is_empty() {
            return Ok(Vec::new());
        }
        match Reader::new(&self.args).read_value()? {
            Value::Array(values) => Ok(values),
            other => Err(ServiceError::Codec(format!("argument list decoded to {}", other))),
        }
    }

    /// Check the name against `other`, ignoring ASCII case.
    #[inline]
    pub fn is(&self, other: &str) -> bool {
        self.name.eq_ignore_ascii_case(other)
    }
}

/// Scan `body` into its calls.
///
/// An empty body, or one holding only the end tag, has no calls. Any tag
/// other than call or end at a call boundary fails with
/// [`ServiceError::MalformedPayload`].
pub fn scan(body: &[u8]) -> Result<Vec<Call>> {
    let mut reader = Reader::new(body);
    let first = match reader.peek_byte() {
        None => return Ok(Vec::new()),
        Some(_) => reader.read_byte()?,
    };

    match first {
        tags::END => return Ok(Vec::new()),
        tags::CALL => {}
        other => {
            return Err(ServiceError::MalformedPayload {
                tag: other,
                remaining: reader.remaining().to_vec(),
            })
        }
    }

    let mut calls = Vec::new();
    loop {
        reader.reset();
        let name = match reader.read_value()? {
            Value::String(name) => name,
            other => return Err(ServiceError::Codec(format!("call name must be a string, got {}", other))),
        };

        let mut args = Bytes::new();
        let mut arg_count = 0;
        let mut by_ref = false;

        if reader.peek_byte() == Some(tags::LIST) {
            let start = reader.position();
            arg_count = list_count(&body[start + 1..])?;
            reader.skip_value()?;
            args = Bytes::copy_from_slice(&body[start..reader.position()]);
            if reader.peek_byte() == Some(tags::TRUE) {
                by_ref = true;
                reader.read_byte()?;
            }
        }

        let tag = reader.read_byte()?;
        calls.push(Call {
            name,
            args,
            arg_count,
            by_ref,
        });

        match tag {
            tags::CALL => continue,
            tags::END => return Ok(calls),
            other => {
                return Err(ServiceError::MalformedPayload {
                    tag: other,
                    remaining: reader.remaining().to_vec(),
                })
            }
        }
    }
}

/// Count in `a<count>{`; `rest` starts right after the `a`.
fn list_count(rest: &[u8]) -> Result<usize> {
    let end = rest
        .iter()
        .position(|&b| b == tags::OPENBRACE)
        .ok_or_else(|| ServiceError::Codec("unterminated argument list".to_string()))?;
    if end == 0 {
        return Ok(0);
    }
    std::str::from_utf8(&rest[..end])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ServiceError::Codec(format!("invalid list count {:?}", String::from_utf8_lossy(&rest[..end]))))
}
