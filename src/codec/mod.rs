//! Codec module - the Hprose call encoding carried in frame bodies.
//!
//! - [`scan`] walks a request body and returns its calls without decoding
//!   argument values.
//! - [`HproseCodec`] converts between Hprose bytes and `serde_json::Value`
//!   when a handler actually needs its arguments, and writes result values.
//! - [`reply`] builds response bodies (results, errors, function lists).
//!
//! # Example
//!
//! ```
//! use servicereg_client::codec::{encode_call, scan, HproseCodec};
//! use serde_json::json;
//!
//! let body = encode_call("sys_ping", &[]);
//! let calls = scan(&body).unwrap();
//! assert_eq!(calls[0].name, "sys_ping");
//!
//! let encoded = HproseCodec::encode(&json!({"status": true}));
//! assert_eq!(HproseCodec::decode(&encoded).unwrap(), json!({"status": true}));
//! ```

mod encoder;
mod reader;
mod scanner;

pub use encoder::{encode_batch, encode_call, reply, ValueWriter};
pub use reader::Reader;
pub use scanner::{scan, Call};

use serde_json::Value;

use crate::error::Result;

/// Tag bytes of the Hprose 2.0 encoding.
pub mod tags {
    /// Integer `i<digits>;`.
    pub const INTEGER: u8 = b'i';
    /// Long `l<digits>;`.
    pub const LONG: u8 = b'l';
    /// Double `d<digits>;`.
    pub const DOUBLE: u8 = b'd';
    /// Null.
    pub const NULL: u8 = b'n';
    /// Empty string.
    pub const EMPTY: u8 = b'e';
    /// Boolean true (also the by-reference marker after an argument list).
    pub const TRUE: u8 = b't';
    /// Boolean false.
    pub const FALSE: u8 = b'f';
    /// Not a number.
    pub const NAN: u8 = b'N';
    /// Infinity, followed by `+` or `-`.
    pub const INFINITY: u8 = b'I';
    /// Date `D<yyyyMMdd>[T...]` terminated by `Z` or `;`.
    pub const DATE: u8 = b'D';
    /// Time `T<hhmmss[.fff]>` terminated by `Z` or `;`.
    pub const TIME: u8 = b'T';
    /// UTC terminator for dates and times.
    pub const UTC: u8 = b'Z';
    /// Bytes `b<len>"..."`.
    pub const BYTES: u8 = b'b';
    /// Single UTF-8 character.
    pub const UTF8_CHAR: u8 = b'u';
    /// String `s<utf16-len>"..."`.
    pub const STRING: u8 = b's';
    /// GUID `g{...}`.
    pub const GUID: u8 = b'g';
    /// List `a[count]{...}`.
    pub const LIST: u8 = b'a';
    /// Map `m[count]{...}`.
    pub const MAP: u8 = b'm';
    /// Class definition `c<len>"name"<count>{fields}`.
    pub const CLASS: u8 = b'c';
    /// Object `o<class>{values}`.
    pub const OBJECT: u8 = b'o';
    /// Reference `r<index>;`.
    pub const REF: u8 = b'r';

    /// Positive sign.
    pub const POS: u8 = b'+';
    /// Negative sign.
    pub const NEG: u8 = b'-';
    /// Number terminator.
    pub const SEMICOLON: u8 = b';';
    /// Container open.
    pub const OPENBRACE: u8 = b'{';
    /// Container close.
    pub const CLOSEBRACE: u8 = b'}';
    /// String delimiter.
    pub const QUOTE: u8 = b'"';

    /// Function list reply.
    pub const FUNCTIONS: u8 = b'F';
    /// Call.
    pub const CALL: u8 = b'C';
    /// Result.
    pub const RESULT: u8 = b'R';
    /// By-reference arguments echoed with a result.
    pub const ARGUMENT: u8 = b'A';
    /// Error.
    pub const ERROR: u8 = b'E';
    /// End of stream.
    pub const END: u8 = b'z';
}

/// Hprose value codec over `serde_json::Value`.
pub struct HproseCodec;

impl HproseCodec {
    /// Encode a value.
    pub fn encode(value: &Value) -> Vec<u8> {
        let mut writer = ValueWriter::new();
        writer.write_value(value);
        writer.into_bytes()
    }

    /// Decode a single value.
    pub fn decode(bytes: &[u8]) -> Result<Value> {
        Reader::new(bytes).read_value()
    }
}
