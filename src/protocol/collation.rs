//! Order-preserving binary encoding of JSON-like keys.
//!
//! Sorting the encoded byte strings sorts the original values in collation
//! order: null < false < true < numbers < strings < arrays < objects, with
//! containers compared element-wise. Strings compare as plain UTF-8 rather
//! than full ICU collation.

use crate::error::{Error, Result};
use serde_json::{Map, Number, Value};

// tag bytes; their numeric order is the collation order
const END: u8 = 0;
const NULL: u8 = 1;
const FALSE: u8 = 2;
const TRUE: u8 = 3;
const NEGATIVE_NUMBER: u8 = 4;
const ZERO: u8 = 5;
const POSITIVE_NUMBER: u8 = 6;
const EMPTY_STRING: u8 = 7;
const STRING: u8 = 8;
const EMPTY_ARRAY: u8 = 9;
const ARRAY: u8 = 10;
const EMPTY_OBJECT: u8 = 11;
const OBJECT: u8 = 12;

/// Encodes `value` such that byte-wise ordering of the results matches
/// collation ordering of the values.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(NULL),
        Value::Bool(false) => out.push(FALSE),
        Value::Bool(true) => out.push(TRUE),
        Value::Number(number) => encode_number(number, out),
        Value::String(s) if s.is_empty() => out.push(EMPTY_STRING),
        Value::String(s) => {
            out.push(STRING);
            out.extend_from_slice(s.as_bytes());
            out.push(0);
        }
        Value::Array(items) if items.is_empty() => out.push(EMPTY_ARRAY),
        Value::Array(items) => {
            out.push(ARRAY);
            for item in items {
                encode_into(item, out);
            }
            out.push(END);
        }
        Value::Object(map) if map.is_empty() => out.push(EMPTY_OBJECT),
        Value::Object(map) => {
            out.push(OBJECT);
            for (key, item) in map {
                encode_into(&Value::String(key.clone()), out);
                encode_into(item, out);
            }
            out.push(END);
        }
    }
}

fn encode_number(number: &Number, out: &mut Vec<u8>) {
    let float = number.as_f64().unwrap_or(0.0);
    if float == 0.0 {
        out.push(ZERO);
    } else if float < 0.0 {
        // flipping makes more negative numbers sort first
        out.push(NEGATIVE_NUMBER);
        out.extend(float.to_be_bytes().map(|b| b ^ 0xff));
    } else {
        out.push(POSITIVE_NUMBER);
        out.extend(float.to_be_bytes());
    }
}

/// Decodes a value previously produced by [`encode`].
pub fn decode(input: &[u8]) -> Result<Value> {
    let mut cursor = Cursor { input, pos: 0 };
    let value = cursor.parse_value()?;
    if cursor.pos != input.len() {
        return Err(Error::MalformedData);
    }
    Ok(value)
}

struct Cursor<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn next_tag(&mut self) -> Result<u8> {
        let tag = *self.input.get(self.pos).ok_or(Error::MalformedData)?;
        self.pos += 1;
        Ok(tag)
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.next_tag()? {
            NULL => Ok(Value::Null),
            FALSE => Ok(Value::Bool(false)),
            TRUE => Ok(Value::Bool(true)),
            ZERO => Ok(number(0.0)),
            NEGATIVE_NUMBER => {
                let raw = self.take(8)?;
                let mut bytes = [0u8; 8];
                for (b, raw) in bytes.iter_mut().zip(raw) {
                    *b = raw ^ 0xff;
                }
                Ok(number(f64::from_be_bytes(bytes)))
            }
            POSITIVE_NUMBER => {
                let raw = self.take(8)?;
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(raw);
                Ok(number(f64::from_be_bytes(bytes)))
            }
            EMPTY_STRING => Ok(Value::String(String::new())),
            STRING => Ok(Value::String(self.parse_string()?)),
            EMPTY_ARRAY => Ok(Value::Array(Vec::new())),
            ARRAY => {
                let mut items = Vec::new();
                while self.peek()? != END {
                    items.push(self.parse_value()?);
                }
                self.pos += 1;
                Ok(Value::Array(items))
            }
            EMPTY_OBJECT => Ok(Value::Object(Map::new())),
            OBJECT => {
                let mut map = Map::new();
                while self.peek()? != END {
                    let key = match self.parse_value()? {
                        Value::String(key) => key,
                        _ => return Err(Error::MalformedData),
                    };
                    map.insert(key, self.parse_value()?);
                }
                self.pos += 1;
                Ok(Value::Object(map))
            }
            _ => Err(Error::MalformedData),
        }
    }

    fn parse_string(&mut self) -> Result<String> {
        let rest = &self.input[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(Error::MalformedData)?;
        let s = std::str::from_utf8(&rest[..end])
            .map_err(|_| Error::MalformedData)?
            .to_owned();
        self.pos += end + 1;
        Ok(s)
    }

    fn peek(&self) -> Result<u8> {
        self.input.get(self.pos).copied().ok_or(Error::MalformedData)
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        if self.pos + n > self.input.len() {
            return Err(Error::MalformedData);
        }
        let slice = &self.input[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
}

fn number(float: f64) -> Value {
    Number::from_f64(float).map(Value::Number).unwrap_or(Value::Null)
}
