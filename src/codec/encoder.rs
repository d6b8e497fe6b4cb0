//! Hprose writer for `serde_json::Value`, plus reply and call bodies.

use serde_json::{Number, Value};

use super::tags;

/// Appends Hprose-encoded values to a buffer.
///
/// References are never emitted; repeated strings are written out in full.
#[derive(Debug, Default)]
pub struct ValueWriter {
    buf: Vec<u8>,
}

impl ValueWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw tag byte.
    #[inline]
    pub fn write_tag(&mut self, tag: u8) {
        self.buf.push(tag);
    }

    /// Append one value.
    pub fn write_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.buf.push(tags::NULL),
            Value::Bool(true) => self.buf.push(tags::TRUE),
            Value::Bool(false) => self.buf.push(tags::FALSE),
            Value::Number(n) => self.write_number(n),
            Value::String(s) => self.write_str(s),
            Value::Array(items) => self.write_list(items),
            Value::Object(map) => {
                self.write_counted(tags::MAP, map.len());
                for (key, value) in map {
                    self.write_str(key);
                    self.write_value(value);
                }
                self.buf.push(tags::CLOSEBRACE);
            }
        }
    }

    /// Append a string, choosing the shortest form.
    pub fn write_str(&mut self, s: &str) {
        let units = s.encode_utf16().count();
        match units {
            0 => self.buf.push(tags::EMPTY),
            1 => {
                self.buf.push(tags::UTF8_CHAR);
                self.buf.extend_from_slice(s.as_bytes());
            }
            _ => {
                self.buf.push(tags::STRING);
                self.buf.extend_from_slice(units.to_string().as_bytes());
                self.buf.push(tags::QUOTE);
                self.buf.extend_from_slice(s.as_bytes());
                self.buf.push(tags::QUOTE);
            }
        }
    }

    /// Append a list.
    pub fn write_list(&mut self, items: &[Value]) {
        self.write_counted(tags::LIST, items.len());
        for item in items {
            self.write_value(item);
        }
        self.buf.push(tags::CLOSEBRACE);
    }

    fn write_counted(&mut self, tag: u8, count: usize) {
        self.buf.push(tag);
        if count > 0 {
            self.buf.extend_from_slice(count.to_string().as_bytes());
        }
        self.buf.push(tags::OPENBRACE);
    }

    fn write_number(&mut self, n: &Number) {
        if let Some(i) = n.as_i64() {
            if (0..=9).contains(&i) {
                self.buf.push(b'0' + i as u8);
            } else if i32::try_from(i).is_ok() {
                self.write_terminated(tags::INTEGER, &i.to_string());
            } else {
                self.write_terminated(tags::LONG, &i.to_string());
            }
        } else if let Some(u) = n.as_u64() {
            self.write_terminated(tags::LONG, &u.to_string());
        } else if let Some(f) = n.as_f64() {
            self.write_terminated(tags::DOUBLE, &f.to_string());
        }
    }

    fn write_terminated(&mut self, tag: u8, digits: &str) {
        self.buf.push(tag);
        self.buf.extend_from_slice(digits.as_bytes());
        self.buf.push(tags::SEMICOLON);
    }

    /// Bytes written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Finish and take the buffer.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Body of a single call.
pub fn encode_call(name: &str, args: &[Value]) -> Vec<u8> {
    encode_batch(&[(name, args)])
}

/// Body of chained calls sharing one end tag.
///
/// Calls without arguments carry no argument list.
pub fn encode_batch(calls: &[(&str, &[Value])]) -> Vec<u8> {
    let mut writer = ValueWriter::new();
    for (name, args) in calls {
        writer.write_tag(tags::CALL);
        writer.write_str(name);
        if !args.is_empty() {
            writer.write_list(args);
        }
    }
    writer.write_tag(tags::END);
    writer.into_bytes()
}

/// Reply bodies.
pub mod reply {
    use serde_json::Value;

    use super::ValueWriter;
    use crate::codec::tags;

    /// One `R<value>` or `E<message>` per call, then the end tag.
    pub fn results(outcomes: &[Result<Value, String>]) -> Vec<u8> {
        let mut writer = ValueWriter::new();
        for outcome in outcomes {
            match outcome {
                Ok(value) => {
                    writer.write_tag(tags::RESULT);
                    writer.write_value(value);
                }
                Err(message) => {
                    writer.write_tag(tags::ERROR);
                    writer.write_str(message);
                }
            }
        }
        writer.write_tag(tags::END);
        writer.into_bytes()
    }

    /// Single result.
    pub fn result(value: &Value) -> Vec<u8> {
        results(&[Ok(value.clone())])
    }

    /// Single error.
    pub fn error(message: &str) -> Vec<u8> {
        results(&[Err(message.to_string())])
    }

    /// Function list sent in answer to an empty request.
    pub fn function_list<S: AsRef<str>>(names: &[S]) -> Vec<u8> {
        let names: Vec<Value> = names.iter().map(|n| Value::String(n.as_ref().to_string())).collect();
        let mut writer = ValueWriter::new();
        writer.write_tag(tags::FUNCTIONS);
        writer.write_list(&names);
        writer.write_tag(tags::END);
        writer.into_bytes()
    }
}
