//! CJSON: a compact tag-prefixed binary JSON form. Each item is a ctag
//! `(name_tag << 3) | type`, with names assigned by the namespace's
//! [`TagsMatcher`]. Decoding against a matcher that does not know a name
//! tag fails with `TagsMismatch`, which callers recover from by
//! re-encoding against the current matcher generation.

pub mod tags_matcher;

pub use tags_matcher::TagsMatcher;

use serde_json::{Map, Number, Value};

use crate::core::error::{Error, ErrorKind, Result};
use crate::wire::serializer::{Serializer, WrSerializer};

const TAG_END: u64 = 0;
const TAG_VARINT: u64 = 1;
const TAG_DOUBLE: u64 = 2;
const TAG_STRING: u64 = 3;
const TAG_BOOL: u64 = 4;
const TAG_NULL: u64 = 5;
const TAG_ARRAY: u64 = 6;
const TAG_OBJECT: u64 = 7;

fn ctag(name: u32, typ: u64) -> u64 {
    ((name as u64) << 3) | typ
}

/// Encode a JSON value tree, registering new field names in `tm`.
pub fn encode(value: &Value, tm: &mut TagsMatcher) -> Vec<u8> {
    let mut ser = WrSerializer::new();
    encode_value(value, 0, tm, &mut ser);
    ser.into_bytes()
}

fn encode_value(value: &Value, name: u32, tm: &mut TagsMatcher, ser: &mut WrSerializer) {
    match value {
        Value::Null => ser.put_varuint(ctag(name, TAG_NULL)),
        Value::Bool(b) => {
            ser.put_varuint(ctag(name, TAG_BOOL));
            ser.put_varuint(*b as u64);
        }
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                ser.put_varuint(ctag(name, TAG_VARINT));
                ser.put_varint(i);
            } else {
                ser.put_varuint(ctag(name, TAG_DOUBLE));
                ser.put_double(n.as_f64().unwrap_or(0.0));
            }
        }
        Value::String(s) => {
            ser.put_varuint(ctag(name, TAG_STRING));
            ser.put_vstring(s);
        }
        Value::Array(items) => {
            ser.put_varuint(ctag(name, TAG_ARRAY));
            ser.put_varuint(items.len() as u64);
            for item in items {
                encode_value(item, 0, tm, ser);
            }
        }
        Value::Object(fields) => {
            ser.put_varuint(ctag(name, TAG_OBJECT));
            for (key, item) in fields {
                let tag = tm.name2tag_or_add(key);
                encode_value(item, tag, tm, ser);
            }
            ser.put_varuint(ctag(0, TAG_END));
        }
    }
}

/// Decode a CJSON buffer against a read-only matcher.
pub fn decode(buf: &[u8], tm: &TagsMatcher) -> Result<Value> {
    let mut rd = Serializer::new(buf);
    let value = decode_value(&mut rd, tm)?.1;
    if !rd.eof() {
        return Err(Error::new(ErrorKind::ParseBin, "trailing data after CJSON root"));
    }
    Ok(value)
}

fn decode_value<'a>(rd: &mut Serializer<'a>, tm: &TagsMatcher) -> Result<(u32, Value)> {
    let tag = rd.get_varuint()?;
    let name = (tag >> 3) as u32;
    let value = match tag & 7 {
        TAG_NULL => Value::Null,
        TAG_BOOL => Value::Bool(rd.get_varuint()? != 0),
        TAG_VARINT => Value::Number(Number::from(rd.get_varint()?)),
        TAG_DOUBLE => Number::from_f64(rd.get_double()?)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        TAG_STRING => Value::String(rd.get_vstring()?.to_string()),
        TAG_ARRAY => {
            let count = rd.get_varuint()? as usize;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_value(rd, tm)?.1);
            }
            Value::Array(items)
        }
        TAG_OBJECT => {
            let mut fields = Map::new();
            loop {
                let pos = rd.pos();
                let peek = rd.get_varuint()?;
                if peek & 7 == TAG_END {
                    break;
                }
                rd.set_pos(pos);
                let (item_name, item) = decode_value(rd, tm)?;
                fields.insert(tm.tag2name(item_name)?.to_string(), item);
            }
            Value::Object(fields)
        }
        other => {
            return Err(Error::new(
                ErrorKind::ParseBin,
                format!("unknown CJSON type tag {}", other),
            ))
        }
    };
    Ok((name, value))
}
