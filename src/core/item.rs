use serde_json::Value;

use crate::cjson;
use crate::cjson::TagsMatcher;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::Variant;
use crate::payload::payload::{build_payload, json_to_variant};
use crate::payload::payload_type::PayloadType;
use crate::payload::value::PayloadValue;
use crate::query::expression::{ExpressionEvaluator, FunctionExecutor};

/// One document being ingested or modified, bound to the payload type and
/// tags matcher generation it was created from.
#[derive(Debug, Clone)]
pub struct Item {
    pub payload_type: PayloadType,
    pub tags_matcher: TagsMatcher,
    pub payload: PayloadValue,
    pub precepts: Vec<String>,
    doc: Value,
    tags_updated: bool,
}

impl Item {
    pub fn new(payload_type: PayloadType, tags_matcher: TagsMatcher) -> Self {
        Item {
            payload_type,
            tags_matcher,
            payload: PayloadValue::empty(),
            precepts: Vec::new(),
            doc: Value::Object(Default::default()),
            tags_updated: false,
        }
    }

    /// State token of the matcher generation this item encodes against.
    pub fn get_state_token(&self) -> i32 {
        self.tags_matcher.state_token()
    }

    pub fn is_tags_updated(&self) -> bool {
        self.tags_updated
    }

    pub fn document(&self) -> &Value {
        &self.doc
    }

    pub fn set_precepts(&mut self, precepts: Vec<String>) {
        self.precepts = precepts;
    }

    pub fn from_json(&mut self, data: &[u8]) -> Result<()> {
        let doc: Value = serde_json::from_slice(data)?;
        if !doc.is_object() {
            return Err(Error::new(ErrorKind::ParseJson, "document root must be an object"));
        }
        self.set_document(doc)
    }

    /// Decodes CJSON against the item's matcher generation. A tag the
    /// matcher does not know fails with `TagsMismatch`; callers recover by
    /// retrying with a freshly issued item.
    pub fn from_cjson(&mut self, data: &[u8]) -> Result<()> {
        let doc = cjson::decode(data, &self.tags_matcher)?;
        if !doc.is_object() {
            return Err(Error::new(ErrorKind::ParseBin, "document root must be an object"));
        }
        self.set_document(doc)
    }

    pub fn set_document(&mut self, doc: Value) -> Result<()> {
        let version_before = self.tags_matcher.version();
        self.payload = build_payload(&self.payload_type, &doc, &mut self.tags_matcher)?;
        self.tags_updated = self.tags_matcher.version() != version_before;
        self.doc = doc;
        Ok(())
    }

    /// Applies precepts of the form `field=function(...)`, e.g.
    /// `id=serial()`, through the expression evaluator.
    pub fn apply_precepts(&mut self, functions: &mut dyn FunctionExecutor) -> Result<()> {
        if self.precepts.is_empty() {
            return Ok(());
        }
        let precepts = std::mem::take(&mut self.precepts);
        for precept in &precepts {
            let (field, expr) = precept.split_once('=').ok_or_else(|| {
                Error::new(ErrorKind::Params, format!("malformed precept '{}'", precept))
            })?;
            let mut eval = ExpressionEvaluator::new(&self.payload_type, &self.tags_matcher, functions);
            let values = eval.evaluate(expr.trim(), &self.payload, field.trim())?;
            let value = values
                .values
                .first()
                .cloned()
                .unwrap_or(Variant::Null);
            set_json_field(&mut self.doc, field.trim(), variant_to_json_value(&value));
        }
        let doc = self.doc.clone();
        self.set_document(doc)?;
        self.precepts = precepts;
        Ok(())
    }

    /// Key of this item, taken from its `id` field.
    pub fn id(&self) -> Option<i64> {
        match self.doc.get("id").map(|v| json_to_variant(v)) {
            Some(Variant::Int(v)) => Some(v as i64),
            Some(Variant::Int64(v)) => Some(v),
            Some(Variant::Double(v)) => Some(v as i64),
            _ => None,
        }
    }

    pub fn set_id(&mut self, id: i64) -> Result<()> {
        set_json_field(&mut self.doc, "id", Value::from(id));
        let doc = self.doc.clone();
        self.set_document(doc)
    }
}

fn variant_to_json_value(v: &Variant) -> Value {
    match v {
        Variant::Null => Value::Null,
        Variant::Int(i) => Value::from(*i),
        Variant::Int64(i) => Value::from(*i),
        Variant::Double(d) => {
            // precepts produce doubles; keep integral results integral
            if d.fract() == 0.0 && d.abs() < i64::MAX as f64 {
                Value::from(*d as i64)
            } else {
                Value::from(*d)
            }
        }
        Variant::Bool(b) => Value::from(*b),
        Variant::String(s) => Value::from(s.as_str()),
        _ => Value::Null,
    }
}

pub(crate) fn set_json_field(doc: &mut Value, path: &str, value: Value) {
    let mut node = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, seg) in segments.iter().enumerate() {
        let map = match node {
            Value::Object(map) => map,
            _ => return,
        };
        if i + 1 == segments.len() {
            map.insert(seg.to_string(), value);
            return;
        }
        node = map
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
    }
}

pub(crate) fn drop_json_field(doc: &mut Value, path: &str) {
    let mut node = doc;
    let segments: Vec<&str> = path.split('.').collect();
    for (i, seg) in segments.iter().enumerate() {
        let map = match node {
            Value::Object(map) => map,
            _ => return,
        };
        if i + 1 == segments.len() {
            map.remove(*seg);
            return;
        }
        match map.get_mut(*seg) {
            Some(next) => node = next,
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variant::KeyValueType;
    use serde_json::json;

    fn fixture() -> (PayloadType, TagsMatcher) {
        let pt = PayloadType::builder("items")
            .field("id", KeyValueType::Int64, false)
            .field("name", KeyValueType::String, false)
            .build()
            .unwrap();
        (pt, TagsMatcher::new())
    }

    #[test]
    fn json_ingest_builds_payload() {
        let (pt, tm) = fixture();
        let mut item = Item::new(pt, tm);
        item.from_json(br#"{"id": 7, "name": "seven"}"#).unwrap();
        assert_eq!(item.id(), Some(7));
        assert!(item.is_tags_updated());
    }

    #[test]
    fn cjson_ingest_against_stale_matcher_is_tags_mismatch() {
        let (pt, tm) = fixture();
        // writer's matcher knows the tags
        let mut writer_tm = TagsMatcher::new();
        let bytes = cjson::encode(&json!({"id": 1, "brand_new": true}), &mut writer_tm);

        let mut stale = Item::new(pt.clone(), tm);
        let err = stale.from_cjson(&bytes).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TagsMismatch);

        // a fresh item carrying the writer's matcher decodes fine
        let mut fresh = Item::new(pt, writer_tm);
        fresh.from_cjson(&bytes).unwrap();
        assert_eq!(fresh.id(), Some(1));
    }

    #[test]
    fn precepts_update_fields() {
        struct Serial(i64);
        impl FunctionExecutor for Serial {
            fn execute(&mut self, name: &str, _a: &[String], _f: &str) -> Result<Variant> {
                assert_eq!(name, "serial");
                self.0 += 1;
                Ok(Variant::Int64(self.0))
            }
        }
        let (pt, tm) = fixture();
        let mut item = Item::new(pt, tm);
        item.from_json(br#"{"name": "x"}"#).unwrap();
        item.set_precepts(vec!["id=serial()".to_string()]);
        let mut funcs = Serial(41);
        item.apply_precepts(&mut funcs).unwrap();
        assert_eq!(item.id(), Some(42));
    }

    #[test]
    fn nested_field_helpers() {
        let mut doc = json!({"a": {"b": 1}});
        set_json_field(&mut doc, "a.c", Value::from(2));
        assert_eq!(doc, json!({"a": {"b": 1, "c": 2}}));
        drop_json_field(&mut doc, "a.b");
        assert_eq!(doc, json!({"a": {"c": 2}}));
    }
}
