//! Hprose reader.
//!
//! Two ways through a buffer:
//! - [`Reader::skip_value`] walks past one value by its tags alone. It keeps
//!   only class field counts and never allocates values. The call scanner uses
//!   it to find call boundaries.
//! - [`Reader::read_value`] materialises a value as `serde_json::Value`,
//!   resolving `r` references.
//!
//! String lengths are counted in UTF-16 code units, as the encoding demands.

use serde_json::{Map, Number, Value};

use super::tags;
use crate::error::{Result, ServiceError};

/// Deepest nesting of lists, maps and objects accepted in one value.
pub const MAX_NESTING_DEPTH: usize = 128;

/// Class definition seen in the stream.
#[derive(Debug, Clone)]
struct ClassDef {
    fields: Vec<String>,
}

/// Cursor over Hprose-encoded bytes.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    refs: Vec<Value>,
    classes: Vec<ClassDef>,
    depth: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            refs: Vec::new(),
            classes: Vec::new(),
            depth: 0,
        }
    }

    /// Current offset into the buffer.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> &'a [u8] {
        &self.buf[self.pos.min(self.buf.len())..]
    }

    /// Forget references and class definitions.
    pub fn reset(&mut self) {
        self.refs.clear();
        self.classes.clear();
    }

    /// Consume one byte.
    pub fn read_byte(&mut self) -> Result<u8> {
        let byte = *self.buf.get(self.pos).ok_or_else(eof)?;
        self.pos += 1;
        Ok(byte)
    }

    /// Look at the next byte without consuming it.
    #[inline]
    pub fn peek_byte(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn expect(&mut self, expected: u8) -> Result<()> {
        let byte = self.read_byte()?;
        if byte != expected {
            return Err(self.malformed(byte));
        }
        Ok(())
    }

    /// Error for `tag`, which has just been consumed.
    fn malformed(&self, tag: u8) -> ServiceError {
        ServiceError::MalformedPayload {
            tag,
            remaining: self.remaining().to_vec(),
        }
    }

    /// Bytes up to (not including) `tag`; the tag itself is consumed.
    fn read_until(&mut self, tag: u8) -> Result<&'a [u8]> {
        let rest = self.remaining();
        let idx = rest.iter().position(|&b| b == tag).ok_or_else(eof)?;
        self.pos += idx + 1;
        Ok(&rest[..idx])
    }

    /// Bytes up to the first of `Z` or `;`, which is consumed.
    fn read_until_terminator(&mut self) -> Result<&'a [u8]> {
        let rest = self.remaining();
        let idx = rest
            .iter()
            .position(|&b| b == tags::UTC || b == tags::SEMICOLON)
            .ok_or_else(eof)?;
        self.pos += idx + 1;
        Ok(&rest[..idx])
    }

    /// Integer terminated by `tag`. An empty run means zero.
    fn read_int_until(&mut self, tag: u8) -> Result<i64> {
        let digits = self.read_until(tag)?;
        if digits.is_empty() {
            return Ok(0);
        }
        let text = std::str::from_utf8(digits).map_err(|_| bad_number(digits))?;
        text.parse::<i64>().map_err(|_| bad_number(digits))
    }

    fn read_count_until(&mut self, tag: u8) -> Result<usize> {
        let count = self.read_int_until(tag)?;
        usize::try_from(count).map_err(|_| ServiceError::Codec(format!("negative count {}", count)))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or_else(eof)?;
        let slice = self.buf.get(self.pos..end).ok_or_else(eof)?;
        self.pos = end;
        Ok(slice)
    }

    /// Consume UTF-8 bytes covering `units` UTF-16 code units.
    fn take_utf16_units(&mut self, units: usize) -> Result<&'a str> {
        let start = self.pos;
        let mut seen = 0;
        while seen < units {
            let lead = *self.buf.get(self.pos).ok_or_else(eof)?;
            let (len, width) = match lead {
                0x00..=0x7F => (1, 1),
                0xC0..=0xDF => (2, 1),
                0xE0..=0xEF => (3, 1),
                0xF0..=0xF7 => (4, 2),
                _ => return Err(ServiceError::Codec(format!("invalid UTF-8 lead byte {:#04x}", lead))),
            };
            if self.pos + len > self.buf.len() {
                return Err(eof());
            }
            self.pos += len;
            seen += width;
        }
        std::str::from_utf8(&self.buf[start..self.pos])
            .map_err(|e| ServiceError::Codec(format!("invalid UTF-8 string: {}", e)))
    }

    /// Body of an `s` string after its tag.
    pub fn read_string_without_tag(&mut self) -> Result<&'a str> {
        let units = self.read_count_until(tags::QUOTE)?;
        let text = self.take_utf16_units(units)?;
        self.expect(tags::QUOTE)?;
        Ok(text)
    }

    fn read_bytes_without_tag(&mut self) -> Result<&'a [u8]> {
        let len = self.read_count_until(tags::QUOTE)?;
        let bytes = self.take(len)?;
        self.expect(tags::QUOTE)?;
        Ok(bytes)
    }

    fn read_class_without_tag(&mut self, materialize: bool) -> Result<()> {
        self.read_string_without_tag()?;
        let count = self.read_count_until(tags::OPENBRACE)?;
        let mut fields = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let field = if materialize {
                self.read_value()?
            } else {
                self.skip_value()?;
                Value::Null
            };
            fields.push(match field {
                Value::String(s) => s,
                other => other.to_string(),
            });
        }
        self.expect(tags::CLOSEBRACE)?;
        self.classes.push(ClassDef { fields });
        Ok(())
    }

    fn class_fields(&self, index: usize) -> Result<Vec<String>> {
        self.classes
            .get(index)
            .map(|c| c.fields.clone())
            .ok_or_else(|| ServiceError::Codec(format!("unknown class reference {}", index)))
    }

    fn descend(&mut self) -> Result<()> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(ServiceError::Codec(format!(
                "value nested deeper than {} levels",
                MAX_NESTING_DEPTH
            )));
        }
        self.depth += 1;
        Ok(())
    }

    /// Walk past one value without materialising it.
    pub fn skip_value(&mut self) -> Result<()> {
        self.descend()?;
        let result = self.skip_tagged();
        self.depth -= 1;
        result
    }

    fn skip_tagged(&mut self) -> Result<()> {
        let tag = self.read_byte()?;
        match tag {
            b'0'..=b'9' | tags::NULL | tags::EMPTY | tags::TRUE | tags::FALSE | tags::NAN => {}
            tags::INTEGER | tags::LONG | tags::DOUBLE | tags::REF => {
                self.read_until(tags::SEMICOLON)?;
            }
            tags::INFINITY => {
                let sign = self.read_byte()?;
                if sign != tags::POS && sign != tags::NEG {
                    return Err(self.malformed(sign));
                }
            }
            tags::UTF8_CHAR => {
                self.take_utf16_units(1)?;
            }
            tags::STRING => {
                self.read_string_without_tag()?;
            }
            tags::BYTES => {
                self.read_bytes_without_tag()?;
            }
            tags::GUID => {
                self.expect(tags::OPENBRACE)?;
                self.read_until(tags::CLOSEBRACE)?;
            }
            tags::DATE | tags::TIME => {
                self.read_until_terminator()?;
            }
            tags::LIST => {
                let count = self.read_count_until(tags::OPENBRACE)?;
                for _ in 0..count {
                    self.skip_value()?;
                }
                self.expect(tags::CLOSEBRACE)?;
            }
            tags::MAP => {
                let count = self.read_count_until(tags::OPENBRACE)?;
                for _ in 0..count {
                    self.skip_value()?;
                    self.skip_value()?;
                }
                self.expect(tags::CLOSEBRACE)?;
            }
            tags::CLASS => {
                self.read_class_without_tag(false)?;
                self.skip_value()?;
            }
            tags::OBJECT => {
                let index = self.read_count_until(tags::OPENBRACE)?;
                let count = self.classes.get(index).map(|c| c.fields.len()).ok_or_else(|| {
                    ServiceError::Codec(format!("unknown class reference {}", index))
                })?;
                for _ in 0..count {
                    self.skip_value()?;
                }
                self.expect(tags::CLOSEBRACE)?;
            }
            other => return Err(self.malformed(other)),
        }
        Ok(())
    }

    /// Decode one value.
    pub fn read_value(&mut self) -> Result<Value> {
        self.descend()?;
        let result = self.read_tagged();
        self.depth -= 1;
        result
    }

    fn read_tagged(&mut self) -> Result<Value> {
        let tag = self.read_byte()?;
        match tag {
            b'0'..=b'9' => Ok(Value::from(tag - b'0')),
            tags::INTEGER => Ok(Value::from(self.read_int_until(tags::SEMICOLON)?)),
            tags::LONG => {
                let digits = self.read_until(tags::SEMICOLON)?;
                parse_long(digits)
            }
            tags::DOUBLE => {
                let digits = self.read_until(tags::SEMICOLON)?;
                let text = std::str::from_utf8(digits).map_err(|_| bad_number(digits))?;
                let value: f64 = text.parse().map_err(|_| bad_number(digits))?;
                Ok(Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null))
            }
            // NaN and infinities have no JSON form.
            tags::NAN => Ok(Value::Null),
            tags::INFINITY => {
                let sign = self.read_byte()?;
                if sign != tags::POS && sign != tags::NEG {
                    return Err(self.malformed(sign));
                }
                Ok(Value::Null)
            }
            tags::NULL => Ok(Value::Null),
            tags::EMPTY => Ok(Value::String(String::new())),
            tags::TRUE => Ok(Value::Bool(true)),
            tags::FALSE => Ok(Value::Bool(false)),
            tags::UTF8_CHAR => Ok(Value::String(self.take_utf16_units(1)?.to_string())),
            tags::STRING => {
                let value = Value::String(self.read_string_without_tag()?.to_string());
                self.refs.push(value.clone());
                Ok(value)
            }
            tags::BYTES => {
                let bytes = self.read_bytes_without_tag()?;
                let value = Value::String(String::from_utf8_lossy(bytes).into_owned());
                self.refs.push(value.clone());
                Ok(value)
            }
            tags::GUID => {
                self.expect(tags::OPENBRACE)?;
                let raw = self.read_until(tags::CLOSEBRACE)?;
                let value = Value::String(String::from_utf8_lossy(raw).into_owned());
                self.refs.push(value.clone());
                Ok(value)
            }
            tags::DATE | tags::TIME => {
                let raw = self.read_until_terminator()?;
                let mut text = String::with_capacity(raw.len() + 1);
                text.push(char::from(tag));
                text.push_str(&String::from_utf8_lossy(raw));
                let value = Value::String(text);
                self.refs.push(value.clone());
                Ok(value)
            }
            tags::LIST => {
                let count = self.read_count_until(tags::OPENBRACE)?;
                let slot = self.refs.len();
                self.refs.push(Value::Null);
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    items.push(self.read_value()?);
                }
                self.expect(tags::CLOSEBRACE)?;
                let value = Value::Array(items);
                self.refs[slot] = value.clone();
                Ok(value)
            }
            tags::MAP => {
                let count = self.read_count_until(tags::OPENBRACE)?;
                let slot = self.refs.len();
                self.refs.push(Value::Null);
                let mut map = Map::new();
                for _ in 0..count {
                    let key = match self.read_value()? {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    let value = self.read_value()?;
                    map.insert(key, value);
                }
                self.expect(tags::CLOSEBRACE)?;
                let value = Value::Object(map);
                self.refs[slot] = value.clone();
                Ok(value)
            }
            tags::CLASS => {
                self.read_class_without_tag(true)?;
                self.read_value()
            }
            tags::OBJECT => {
                let index = self.read_count_until(tags::OPENBRACE)?;
                let fields = self.class_fields(index)?;
                let slot = self.refs.len();
                self.refs.push(Value::Null);
                let mut map = Map::new();
                for field in fields {
                    let value = self.read_value()?;
                    map.insert(field, value);
                }
                self.expect(tags::CLOSEBRACE)?;
                let value = Value::Object(map);
                self.refs[slot] = value.clone();
                Ok(value)
            }
            tags::REF => {
                let index = self.read_count_until(tags::SEMICOLON)?;
                self.refs
                    .get(index)
                    .cloned()
                    .ok_or_else(|| ServiceError::Codec(format!("unknown reference {}", index)))
            }
            other => Err(self.malformed(other)),
        }
    }
}

fn parse_long(digits: &[u8]) -> Result<Value> {
    let text = std::str::from_utf8(digits).map_err(|_| bad_number(digits))?;
    if let Ok(v) = text.parse::<i64>() {
        return Ok(Value::from(v));
    }
    if let Ok(v) = text.parse::<u64>() {
        return Ok(Value::from(v));
    }
    // Arbitrary precision; keep the digits.
    Ok(Value::String(text.to_string()))
}

fn eof() -> ServiceError {
    ServiceError::Codec("unexpected end of input".to_string())
}

fn bad_number(digits: &[u8]) -> ServiceError {
    ServiceError::Codec(format!("invalid number {:?}", String::from_utf8_lossy(digits)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(bytes: &[u8]) -> Value {
        Reader::new(bytes).read_value().unwrap()
    }

    fn skip_len(bytes: &[u8]) -> usize {
        let mut reader = Reader::new(bytes);
        reader.skip_value().unwrap();
        reader.position()
    }

    #[test]
    fn test_scalars() {
        assert_eq!(decode(b"7"), json!(7));
        assert_eq!(decode(b"i-123;"), json!(-123));
        assert_eq!(decode(b"l9876543210;"), json!(9876543210i64));
        assert_eq!(decode(b"d1.5;"), json!(1.5));
        assert_eq!(decode(b"n"), Value::Null);
        assert_eq!(decode(b"t"), json!(true));
        assert_eq!(decode(b"f"), json!(false));
        assert_eq!(decode(b"e"), json!(""));
        assert_eq!(decode(b"N"), Value::Null);
        assert_eq!(decode(b"I+"), Value::Null);
    }

    #[test]
    fn test_huge_long_kept_as_digits() {
        assert_eq!(
            decode(b"l123456789012345678901234567890;"),
            json!("123456789012345678901234567890")
        );
    }

    #[test]
    fn test_strings_count_utf16_units() {
        assert_eq!(decode(b"s5\"hello\""), json!("hello"));
        // Three CJK characters: 9 UTF-8 bytes, 3 UTF-16 units.
        assert_eq!(decode("s3\"你好吗\"".as_bytes()), json!("你好吗"));
        // One astral character: 4 UTF-8 bytes, 2 UTF-16 units.
        assert_eq!(decode("s2\"😀\"".as_bytes()), json!("😀"));
        assert_eq!(decode("u中".as_bytes()), json!("中"));
    }

    #[test]
    fn test_bytes_guid_date() {
        assert_eq!(decode(b"b3\"a\"b\""), json!("a\"b"));
        assert_eq!(
            decode(b"g{AFA7F4B1-A64D-46FA-886F-ED7FBCE569B6}"),
            json!("AFA7F4B1-A64D-46FA-886F-ED7FBCE569B6")
        );
        assert_eq!(decode(b"D20240102T030405Z"), json!("D20240102T030405"));
        assert_eq!(decode(b"T101010.123;"), json!("T101010.123"));
    }

    #[test]
    fn test_list_and_map() {
        assert_eq!(decode(b"a{}"), json!([]));
        assert_eq!(decode(b"a3{12s1\"x\"}"), json!([1, 2, "x"]));
        assert_eq!(
            decode(b"m2{s1\"a\"1s1\"b\"a1{t}}"),
            json!({"a": 1, "b": [true]})
        );
    }

    #[test]
    fn test_references() {
        // List is ref 0, "ab" is ref 1.
        assert_eq!(decode(b"a2{s2\"ab\"r1;}"), json!(["ab", "ab"]));
    }

    #[test]
    fn test_class_and_object() {
        let bytes = b"c4\"User\"2{s4\"name\"s3\"age\"}o0{s3\"bob\"i42;}";
        assert_eq!(decode(bytes), json!({"name": "bob", "age": 42}));
        assert_eq!(skip_len(bytes), bytes.len());
    }

    #[test]
    fn test_skip_matches_decode_extent() {
        let samples: &[&[u8]] = &[
            b"5",
            b"i-1;",
            b"s3\"abc\"",
            b"b2\"\x00\xff\"",
            b"a2{m1{s1\"k\"n}D20200101Z}",
            b"g{00000000-0000-0000-0000-000000000000}",
            b"I-",
            b"r0;",
        ];
        for sample in samples {
            let mut with_tail = sample.to_vec();
            with_tail.push(b'z');
            assert_eq!(skip_len(&with_tail), sample.len(), "sample {:?}", sample);
        }
    }

    #[test]
    fn test_unknown_tag() {
        let err = Reader::new(b"?rest").read_value().unwrap_err();
        match err {
            ServiceError::MalformedPayload { tag, remaining } => {
                assert_eq!(tag, b'?');
                assert_eq!(remaining, b"rest");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_truncated_input() {
        assert!(Reader::new(b"s5\"hel").read_value().is_err());
        assert!(Reader::new(b"a2{1").skip_value().is_err());
        assert!(Reader::new(b"i12").skip_value().is_err());
    }

    #[test]
    fn test_bad_reference() {
        assert!(Reader::new(b"r3;").read_value().is_err());
    }
}
