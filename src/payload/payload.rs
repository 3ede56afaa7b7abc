use serde_json::Value;
use uuid::Uuid;

use crate::cjson;
use crate::cjson::TagsMatcher;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::{KeyValueType, Point, Variant, VariantArray, VariantString};
use crate::payload::payload_type::{PayloadField, PayloadType, TUPLE_FIELD};
use crate::payload::value::PayloadValue;

/// Typed read access to one payload value under its type descriptor.
pub struct Payload<'a> {
    t: &'a PayloadType,
    v: &'a PayloadValue,
}

impl<'a> Payload<'a> {
    pub fn new(t: &'a PayloadType, v: &'a PayloadValue) -> Self {
        Payload { t, v }
    }

    pub fn payload_type(&self) -> &PayloadType {
        self.t
    }

    /// Typed values of an indexed field. String variants reference the
    /// payload region and hold a refcount on it.
    pub fn get(&self, field: usize) -> Result<VariantArray> {
        if field >= self.t.num_fields() {
            return Err(Error::new(
                ErrorKind::Logic,
                format!("field index {} out of range ({})", field, self.t.num_fields()),
            ));
        }
        let f = self.t.field(field);
        if f.key_type == KeyValueType::Composite {
            let set = self.t.fields_set_of(field);
            let mut tuple = Vec::with_capacity(set.fields().len());
            for &idx in set.fields() {
                let vals = self.get(idx)?;
                tuple.push(vals.values.into_iter().next().unwrap_or(Variant::Null));
            }
            return Ok(VariantArray::single(Variant::Tuple(tuple)));
        }
        if f.is_array {
            let (off, count) = self.read_off_pair(f.offset)?;
            let width = f.element_width();
            let mut out = VariantArray::new();
            for i in 0..count {
                out.push(self.read_scalar(f, off + i * width)?);
            }
            out.set_array_flag(true);
            Ok(out)
        } else {
            Ok(VariantArray::single(self.read_scalar(f, f.offset)?))
        }
    }

    /// Values addressed by JSON path: an indexed field when one covers the
    /// path, otherwise a walk of the document tuple.
    pub fn get_by_json_path(&self, path: &str, tm: &TagsMatcher) -> Result<VariantArray> {
        if let Some(field) = self.t.field_by_json_path(path).or_else(|| self.t.field_by_name(path)) {
            if field != TUPLE_FIELD {
                return self.get(field);
            }
        }
        let doc = self.document(tm)?;
        let mut node = &doc;
        for seg in path.split('.') {
            match node {
                Value::Object(map) => match map.get(seg) {
                    Some(next) => node = next,
                    None => return Ok(VariantArray::new()),
                },
                _ => return Ok(VariantArray::new()),
            }
        }
        Ok(json_to_variants(node))
    }

    /// The whole document, decoded from the tuple field.
    pub fn document(&self, tm: &TagsMatcher) -> Result<Value> {
        let tuple = self.t.field(TUPLE_FIELD);
        let (off, len) = self.read_off_pair(tuple.offset)?;
        if len == 0 {
            return Ok(Value::Object(Default::default()));
        }
        cjson::decode(&self.v.bytes()[off..off + len], tm)
    }

    fn read_off_pair(&self, slot: usize) -> Result<(usize, usize)> {
        let b = self.slot_bytes(slot, 8)?;
        let off = u32::from_le_bytes(b[0..4].try_into().unwrap()) as usize;
        let len = u32::from_le_bytes(b[4..8].try_into().unwrap()) as usize;
        Ok((off, len))
    }

    fn slot_bytes(&self, offset: usize, width: usize) -> Result<&'a [u8]> {
        let bytes = self.v.bytes();
        if offset + width > bytes.len() {
            return Err(Error::new(
                ErrorKind::Logic,
                format!("payload truncated: slot {}+{} over {}", offset, width, bytes.len()),
            ));
        }
        Ok(&bytes[offset..offset + width])
    }

    fn read_scalar(&self, f: &PayloadField, offset: usize) -> Result<Variant> {
        Ok(match f.key_type {
            KeyValueType::Int => {
                Variant::Int(i64::from_le_bytes(self.slot_bytes(offset, 8)?.try_into().unwrap()) as i32)
            }
            KeyValueType::Int64 => {
                Variant::Int64(i64::from_le_bytes(self.slot_bytes(offset, 8)?.try_into().unwrap()))
            }
            KeyValueType::Double => {
                Variant::Double(f64::from_le_bytes(self.slot_bytes(offset, 8)?.try_into().unwrap()))
            }
            KeyValueType::Bool => Variant::Bool(self.slot_bytes(offset, 1)?[0] != 0),
            KeyValueType::String => {
                let (off, len) = self.read_off_pair(offset)?;
                self.slot_bytes(off, len)?; // bounds check
                Variant::String(VariantString::Payload { value: self.v.clone(), offset: off, len })
            }
            KeyValueType::Uuid => {
                Variant::Uuid(Uuid::from_bytes(self.slot_bytes(offset, 16)?.try_into().unwrap()))
            }
            KeyValueType::Point => {
                let b = self.slot_bytes(offset, 16)?;
                Variant::Point(Point::new(
                    f64::from_le_bytes(b[0..8].try_into().unwrap()),
                    f64::from_le_bytes(b[8..16].try_into().unwrap()),
                ))
            }
            other => {
                return Err(Error::new(
                    ErrorKind::Logic,
                    format!("field '{}' of type '{}' has no scalar representation", f.name, other.name()),
                ))
            }
        })
    }
}

/// In-place mutation of fixed-width scalar slots. Callers get exclusive
/// ownership via copy-on-write before any byte is written.
pub struct PayloadMut<'a> {
    t: &'a PayloadType,
    v: &'a mut PayloadValue,
}

impl<'a> PayloadMut<'a> {
    pub fn new(t: &'a PayloadType, v: &'a mut PayloadValue) -> Self {
        PayloadMut { t, v }
    }

    pub fn set_scalar(&mut self, field: usize, value: &Variant) -> Result<()> {
        let f = self.t.field(field).clone();
        if f.is_array {
            return Err(Error::new(
                ErrorKind::Params,
                format!("in-place set is not supported for array field '{}'", f.name),
            ));
        }
        let size = self.v.size();
        self.v.clone_into_unique(size);
        let bytes = self.v.bytes_mut();
        match f.key_type {
            KeyValueType::Int | KeyValueType::Int64 => {
                let n = match value {
                    Variant::Int(n) => *n as i64,
                    Variant::Int64(n) => *n,
                    Variant::Double(d) => *d as i64,
                    other => {
                        return Err(Error::new(
                            ErrorKind::Params,
                            format!("can not assign '{}' to numeric field '{}'", other.dump(), f.name),
                        ))
                    }
                };
                bytes[f.offset..f.offset + 8].copy_from_slice(&n.to_le_bytes());
            }
            KeyValueType::Double => {
                let d = value.as_double().map_err(|_| {
                    Error::new(ErrorKind::Params, format!("can not assign to double field '{}'", f.name))
                })?;
                bytes[f.offset..f.offset + 8].copy_from_slice(&d.to_le_bytes());
            }
            KeyValueType::Bool => {
                let b = matches!(value, Variant::Bool(true));
                bytes[f.offset] = b as u8;
            }
            other => {
                return Err(Error::new(
                    ErrorKind::Params,
                    format!("in-place set is not supported for '{}' field '{}'", other.name(), f.name),
                ))
            }
        }
        Ok(())
    }
}

/// Build a payload from a JSON document: indexed fields get typed slots,
/// the whole document goes into the tuple field as CJSON.
pub fn build_payload(t: &PayloadType, doc: &Value, tm: &mut TagsMatcher) -> Result<PayloadValue> {
    let mut fixed = vec![0u8; t.fixed_size()];
    let mut tail: Vec<u8> = Vec::new();
    let base = t.fixed_size();

    let cjson_bytes = cjson::encode(doc, tm);
    write_blob(&mut fixed, &mut tail, base, t.field(TUPLE_FIELD).offset, &cjson_bytes);

    for (idx, f) in t.fields().iter().enumerate().skip(1) {
        if f.key_type == KeyValueType::Composite {
            continue;
        }
        let node = f
            .json_paths
            .first()
            .map(|p| lookup_path(doc, p))
            .unwrap_or(Some(&Value::Null))
            .unwrap_or(&Value::Null);
        if f.is_array {
            let items: Vec<&Value> = match node {
                Value::Array(items) => items.iter().collect(),
                Value::Null => Vec::new(),
                single => vec![single],
            };
            let width = f.element_width();
            let arr_off = base + tail.len();
            tail.resize(tail.len() + items.len() * width, 0);
            for (i, item) in items.iter().enumerate() {
                let rec = arr_off - base + i * width;
                write_element(&mut tail, rec, base, f, item, idx)?;
            }
            let slot = &mut fixed[f.offset..f.offset + 8];
            slot[0..4].copy_from_slice(&(arr_off as u32).to_le_bytes());
            slot[4..8].copy_from_slice(&(items.len() as u32).to_le_bytes());
        } else {
            let mut rec = vec![0u8; f.slot_width()];
            write_element_fixed(&mut rec, 0, &mut tail, base, f, node, idx)?;
            fixed[f.offset..f.offset + f.slot_width()].copy_from_slice(&rec);
        }
    }

    let mut bytes = fixed;
    bytes.extend_from_slice(&tail);
    Ok(PayloadValue::new(bytes.len(), Some(&bytes), 0))
}

fn write_blob(fixed: &mut [u8], tail: &mut Vec<u8>, base: usize, slot: usize, data: &[u8]) {
    let off = base + tail.len();
    tail.extend_from_slice(data);
    fixed[slot..slot + 4].copy_from_slice(&(off as u32).to_le_bytes());
    fixed[slot + 4..slot + 8].copy_from_slice(&(data.len() as u32).to_le_bytes());
}

// Element record inside the tail (array member): strings append their
// bytes after the record region, so offsets are patched in place.
fn write_element(
    tail: &mut Vec<u8>,
    rec: usize,
    base: usize,
    f: &PayloadField,
    node: &Value,
    field_idx: usize,
) -> Result<()> {
    match f.key_type {
        KeyValueType::String => {
            let s = match node {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let off = base + tail.len();
            tail.extend_from_slice(s.as_bytes());
            tail[rec..rec + 4].copy_from_slice(&(off as u32).to_le_bytes());
            tail[rec + 4..rec + 8].copy_from_slice(&(s.len() as u32).to_le_bytes());
            Ok(())
        }
        _ => {
            let mut scratch = vec![0u8; f.element_width()];
            write_numeric(&mut scratch, 0, f, node, field_idx)?;
            tail[rec..rec + scratch.len()].copy_from_slice(&scratch);
            Ok(())
        }
    }
}

fn write_element_fixed(
    rec: &mut [u8],
    at: usize,
    tail: &mut Vec<u8>,
    base: usize,
    f: &PayloadField,
    node: &Value,
    field_idx: usize,
) -> Result<()> {
    match f.key_type {
        KeyValueType::String => {
            let s = match node {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            let off = base + tail.len();
            tail.extend_from_slice(s.as_bytes());
            rec[at..at + 4].copy_from_slice(&(off as u32).to_le_bytes());
            rec[at + 4..at + 8].copy_from_slice(&(s.len() as u32).to_le_bytes());
            Ok(())
        }
        _ => write_numeric(rec, at, f, node, field_idx),
    }
}

fn write_numeric(rec: &mut [u8], at: usize, f: &PayloadField, node: &Value, field_idx: usize) -> Result<()> {
    let type_err = || {
        Error::new(
            ErrorKind::ParseJson,
            format!("value {} does not fit field #{} '{}' ({})", node, field_idx, f.name, f.key_type.name()),
        )
    };
    match f.key_type {
        KeyValueType::Int | KeyValueType::Int64 => {
            let n = match node {
                Value::Number(n) => n.as_i64().ok_or_else(type_err)?,
                Value::Null => 0,
                Value::Bool(b) => *b as i64,
                _ => return Err(type_err()),
            };
            rec[at..at + 8].copy_from_slice(&n.to_le_bytes());
        }
        KeyValueType::Double => {
            let d = match node {
                Value::Number(n) => n.as_f64().ok_or_else(type_err)?,
                Value::Null => 0.0,
                _ => return Err(type_err()),
            };
            rec[at..at + 8].copy_from_slice(&d.to_le_bytes());
        }
        KeyValueType::Bool => {
            rec[at] = matches!(node, Value::Bool(true)) as u8;
        }
        KeyValueType::Uuid => {
            let u = match node {
                Value::String(s) => Uuid::parse_str(s).map_err(|_| type_err())?,
                Value::Null => Uuid::nil(),
                _ => return Err(type_err()),
            };
            rec[at..at + 16].copy_from_slice(u.as_bytes());
        }
        KeyValueType::Point => {
            let (x, y) = match node {
                Value::Array(xy) if xy.len() == 2 => (
                    xy[0].as_f64().ok_or_else(type_err)?,
                    xy[1].as_f64().ok_or_else(type_err)?,
                ),
                Value::Null => (0.0, 0.0),
                _ => return Err(type_err()),
            };
            rec[at..at + 8].copy_from_slice(&x.to_le_bytes());
            rec[at + 8..at + 16].copy_from_slice(&y.to_le_bytes());
        }
        _ => return Err(type_err()),
    }
    Ok(())
}

fn lookup_path<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    let mut node = doc;
    for seg in path.split('.') {
        node = node.as_object()?.get(seg)?;
    }
    Some(node)
}

pub fn json_to_variants(node: &Value) -> VariantArray {
    match node {
        Value::Array(items) => {
            let mut out = VariantArray::from_values(items.iter().map(json_to_variant).collect());
            out.set_array_flag(true);
            out
        }
        Value::Null => VariantArray::new(),
        other => VariantArray::single(json_to_variant(other)),
    }
}

pub fn json_to_variant(node: &Value) -> Variant {
    match node {
        Value::Null => Variant::Null,
        Value::Bool(b) => Variant::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                if i >= i32::MIN as i64 && i <= i32::MAX as i64 {
                    Variant::Int(i as i32)
                } else {
                    Variant::Int64(i)
                }
            } else {
                Variant::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Variant::str(s.clone()),
        Value::Array(items) => Variant::Tuple(items.iter().map(json_to_variant).collect()),
        Value::Object(_) => Variant::str(node.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_type() -> PayloadType {
        PayloadType::builder("items")
            .field("id", KeyValueType::Int, false)
            .field("score", KeyValueType::Double, false)
            .field("name", KeyValueType::String, false)
            .field("tags", KeyValueType::String, true)
            .field("nums", KeyValueType::Int64, true)
            .build()
            .unwrap()
    }

    #[test]
    fn typed_get_over_built_payload() {
        let t = sample_type();
        let mut tm = TagsMatcher::new();
        let doc = json!({
            "id": 42, "score": 0.5, "name": "rook",
            "tags": ["a", "b"], "nums": [10, 20, 30],
            "extra": "c"
        });
        let pv = build_payload(&t, &doc, &mut tm).unwrap();
        let pl = Payload::new(&t, &pv);

        assert_eq!(pl.get(1).unwrap().values, vec![Variant::Int(42)]);
        assert_eq!(pl.get(2).unwrap().values, vec![Variant::Double(0.5)]);
        assert_eq!(pl.get(3).unwrap().values[0].as_str(), Some("rook"));

        let tags = pl.get(4).unwrap();
        assert!(tags.is_array_value());
        assert_eq!(tags.values[0].as_str(), Some("a"));
        assert_eq!(tags.values[1].as_str(), Some("b"));

        let nums = pl.get(5).unwrap();
        assert_eq!(nums.values, vec![Variant::Int64(10), Variant::Int64(20), Variant::Int64(30)]);
    }

    #[test]
    fn string_get_references_payload_region() {
        let t = sample_type();
        let mut tm = TagsMatcher::new();
        let pv = build_payload(&t, &json!({"id": 1, "name": "zed"}), &mut tm).unwrap();
        let name = {
            let pl = Payload::new(&t, &pv);
            let mut vals = pl.get(3).unwrap();
            vals.values.remove(0)
        };
        // The variant holds its own reference.
        assert_eq!(pv.refcount(), 2);
        assert_eq!(name.as_str(), Some("zed"));
        let held = name.ensure_hold();
        assert_eq!(pv.refcount(), 1);
        assert_eq!(held.as_str(), Some("zed"));
    }

    #[test]
    fn json_path_falls_back_to_document() {
        let t = sample_type();
        let mut tm = TagsMatcher::new();
        let doc = json!({"id": 1, "nested": {"deep": [1, 2]}, "extra": "c"});
        let pv = build_payload(&t, &doc, &mut tm).unwrap();
        let pl = Payload::new(&t, &pv);

        let extra = pl.get_by_json_path("extra", &tm).unwrap();
        assert_eq!(extra.values[0].as_str(), Some("c"));

        let deep = pl.get_by_json_path("nested.deep", &tm).unwrap();
        assert_eq!(deep.values, vec![Variant::Int(1), Variant::Int(2)]);

        assert!(pl.get_by_json_path("missing.path", &tm).unwrap().is_empty());
    }

    #[test]
    fn composite_field_reads_as_tuple() {
        let t = PayloadType::builder("items")
            .field("a", KeyValueType::Int, false)
            .field("b", KeyValueType::String, false)
            .composite("a+b", vec!["a".to_string(), "b".to_string()])
            .build()
            .unwrap();
        let mut tm = TagsMatcher::new();
        let pv = build_payload(&t, &json!({"a": 3, "b": "x"}), &mut tm).unwrap();
        let idx = t.field_by_name("a+b").unwrap();
        let vals = Payload::new(&t, &pv).get(idx).unwrap();
        match &vals.values[0] {
            Variant::Tuple(items) => {
                assert_eq!(items[0], Variant::Int(3));
                assert_eq!(items[1].as_str(), Some("x"));
            }
            other => panic!("expected tuple, got {:?}", other),
        }
        assert_eq!(t.fields_set_of(idx).fields().len(), 2);
    }

    #[test]
    fn scalar_set_is_copy_on_write() {
        let t = sample_type();
        let mut tm = TagsMatcher::new();
        let pv = build_payload(&t, &json!({"id": 1}), &mut tm).unwrap();
        let mut copy = pv.clone();
        PayloadMut::new(&t, &mut copy).set_scalar(1, &Variant::Int(9)).unwrap();
        assert_eq!(Payload::new(&t, &pv).get(1).unwrap().values, vec![Variant::Int(1)]);
        assert_eq!(Payload::new(&t, &copy).get(1).unwrap().values, vec![Variant::Int(9)]);
        assert_eq!(pv.refcount(), 1);
    }
}
