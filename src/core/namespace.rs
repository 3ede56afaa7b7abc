use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cjson::TagsMatcher;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::item::Item;
use crate::core::variant::KeyValueType;
use crate::ft::config::FtFastConfig;
use crate::ft::dataholder::{AnyDataHolder, FtIndex};
use crate::payload::payload::Payload;
use crate::payload::payload_type::PayloadType;
use crate::payload::value::PayloadValue;

/// Index definition as it arrives from the binding (JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    #[serde(default)]
    pub json_paths: Vec<String>,
    /// Value type: "int", "int64", "double", "string", "bool", "uuid", "point".
    pub field_type: String,
    /// Index flavor: "hash", "tree", "text", "packed_text", "-".
    #[serde(default)]
    pub index_type: String,
    #[serde(default)]
    pub is_array: bool,
    #[serde(default)]
    pub config: Value,
}

impl IndexDef {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::new(ErrorKind::ParseJson, e.to_string()))
    }

    pub fn key_type(&self) -> Result<KeyValueType> {
        Ok(match self.field_type.as_str() {
            "int" => KeyValueType::Int,
            "int64" => KeyValueType::Int64,
            "double" => KeyValueType::Double,
            "string" => KeyValueType::String,
            "bool" => KeyValueType::Bool,
            "uuid" => KeyValueType::Uuid,
            "point" => KeyValueType::Point,
            "composite" => KeyValueType::Composite,
            other => {
                return Err(Error::new(
                    ErrorKind::Params,
                    format!("unknown field type '{}'", other),
                ))
            }
        })
    }

    pub fn is_fulltext(&self) -> bool {
        matches!(self.index_type.as_str(), "text" | "packed_text")
    }
}

/// One namespace: schema, items, indexes, meta and the full-text feed.
/// Readers go through the RwLocks; writers additionally serialize on
/// `write_lock`.
pub struct Namespace {
    pub name: RwLock<String>,
    payload_type: RwLock<PayloadType>,
    tags_matcher: RwLock<TagsMatcher>,
    items: RwLock<BTreeMap<i64, PayloadValue>>,
    indexes: RwLock<Vec<IndexDef>>,
    meta: RwLock<HashMap<String, String>>,
    schema: RwLock<Option<Value>>,
    ft: Mutex<Option<AnyDataHolder>>,
    serial_counters: Mutex<HashMap<String, i64>>,
    next_auto_id: AtomicI64,
    write_lock: Mutex<()>,
}

impl Namespace {
    pub fn new(name: &str) -> Result<Self> {
        Ok(Namespace {
            name: RwLock::new(name.to_string()),
            payload_type: RwLock::new(PayloadType::builder(name).build()?),
            tags_matcher: RwLock::new(TagsMatcher::new()),
            items: RwLock::new(BTreeMap::new()),
            indexes: RwLock::new(Vec::new()),
            meta: RwLock::new(HashMap::new()),
            schema: RwLock::new(None),
            ft: Mutex::new(None),
            serial_counters: Mutex::new(HashMap::new()),
            next_auto_id: AtomicI64::new(1),
            write_lock: Mutex::new(()),
        })
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload_type.read().clone()
    }

    pub fn tags_matcher(&self) -> TagsMatcher {
        self.tags_matcher.read().clone()
    }

    pub fn item_count(&self) -> usize {
        self.items.read().len()
    }

    /// Snapshot of (id, payload) pairs; payload handles share the stored
    /// cells by refcount.
    pub fn snapshot(&self) -> Vec<(i64, PayloadValue)> {
        self.items.read().iter().map(|(id, v)| (*id, v.clone())).collect()
    }

    pub fn new_item(&self) -> Item {
        Item::new(self.payload_type(), self.tags_matcher())
    }

    pub fn add_index(&self, def: IndexDef) -> Result<()> {
        let _w = self.write_lock.lock();
        def.key_type()?;
        {
            let mut indexes = self.indexes.write();
            if indexes.iter().any(|d| d.name == def.name) {
                return Err(Error::new(
                    ErrorKind::Conflict,
                    format!("index '{}' already exists", def.name),
                ));
            }
            indexes.push(def.clone());
        }
        if def.is_fulltext() {
            let cfg = if def.config.is_null() {
                FtFastConfig::default()
            } else {
                let cfg: FtFastConfig = serde_json::from_value(def.config.clone())?;
                cfg.validate()?;
                cfg
            };
            *self.ft.lock() = Some(AnyDataHolder::new(cfg, def.index_type == "packed_text"));
        }
        self.rebuild_payload_type()
    }

    pub fn update_index(&self, def: IndexDef) -> Result<()> {
        let _w = self.write_lock.lock();
        {
            let mut indexes = self.indexes.write();
            let slot = indexes
                .iter_mut()
                .find(|d| d.name == def.name)
                .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("index '{}' not found", def.name)))?;
            *slot = def;
        }
        self.rebuild_payload_type()
    }

    pub fn drop_index(&self, name: &str) -> Result<()> {
        let _w = self.write_lock.lock();
        {
            let mut indexes = self.indexes.write();
            let before = indexes.len();
            indexes.retain(|d| d.name != name);
            if indexes.len() == before {
                return Err(Error::new(ErrorKind::NotFound, format!("index '{}' not found", name)));
            }
        }
        self.rebuild_payload_type()
    }

    pub fn set_schema(&self, schema: Value) {
        *self.schema.write() = Some(schema);
    }

    pub fn indexes(&self) -> Vec<IndexDef> {
        self.indexes.read().clone()
    }

    // Recomputes the payload layout from the index list and re-encodes
    // stored items into it.
    fn rebuild_payload_type(&self) -> Result<()> {
        let name = self.name.read().clone();
        let mut builder = PayloadType::builder(&name);
        for def in self.indexes.read().iter() {
            let kt = def.key_type()?;
            if kt == KeyValueType::Composite {
                builder = builder.composite(def.name.clone(), def.json_paths.clone());
                continue;
            }
            let paths = if def.json_paths.is_empty() {
                vec![def.name.clone()]
            } else {
                def.json_paths.clone()
            };
            builder = builder.field_with_paths(def.name.clone(), kt, def.is_array, paths);
        }
        let new_type = builder.build()?;

        let mut tm = self.tags_matcher.write();
        let mut items = self.items.write();
        let old_type = self.payload_type.read().clone();
        let mut reencoded = BTreeMap::new();
        for (id, value) in items.iter() {
            let doc = Payload::new(&old_type, value).document(&tm)?;
            let new_value = crate::payload::payload::build_payload(&new_type, &doc, &mut tm)?;
            new_value.set_lsn(value.get_lsn());
            reencoded.insert(*id, new_value);
        }
        *items = reencoded;
        *self.payload_type.write() = new_type;
        Ok(())
    }

    /// Stores the item under `id` and feeds text indexes. The caller
    /// already holds the namespace writer lock.
    pub(crate) fn store(&self, id: i64, value: PayloadValue, doc: &Value, lsn: i64) {
        value.set_lsn(lsn);
        self.items.write().insert(id, value);
        self.feed_ft(id, doc);
    }

    pub(crate) fn remove(&self, id: i64) -> bool {
        self.items.write().remove(&id).is_some()
    }

    pub fn writer_lock(&self) -> parking_lot::MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// Adopts tags an item's matcher generation learned during ingest.
    pub(crate) fn adopt_tags(&self, tm: &TagsMatcher) -> Result<()> {
        self.tags_matcher.write().merge(tm)
    }

    pub fn next_auto_id(&self) -> i64 {
        self.next_auto_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_serial(&self, field: &str) -> i64 {
        let mut counters = self.serial_counters.lock();
        let counter = counters.entry(field.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn feed_ft(&self, id: i64, doc: &Value) {
        let mut guard = self.ft.lock();
        let holder = match guard.as_mut() {
            Some(h) => h,
            None => return,
        };
        let text_fields: Vec<(String, u32)> = self
            .indexes
            .read()
            .iter()
            .filter(|d| d.is_fulltext())
            .flat_map(|d| {
                let paths = if d.json_paths.is_empty() {
                    std::slice::from_ref(&d.name).to_vec()
                } else {
                    d.json_paths.clone()
                };
                paths
            })
            .enumerate()
            .filter_map(|(field, path)| {
                doc.get(&path)
                    .and_then(Value::as_str)
                    .map(|text| (text.to_string(), field as u32))
            })
            .collect();
        if !text_fields.is_empty() {
            holder.add_document(id.max(0) as usize, id.max(0) as usize, text_fields);
        }
    }

    /// Commits pending full-text updates: decides the step strategy and
    /// rebuilds the active step.
    pub fn commit_ft(&self, multithread: bool) {
        let field_count = self
            .indexes
            .read()
            .iter()
            .filter(|d| d.is_fulltext())
            .map(|d| d.json_paths.len().max(1))
            .sum::<usize>()
            .max(1);
        if let Some(holder) = self.ft.lock().as_mut() {
            holder.start_commit(false);
            holder.process(field_count, multithread);
        }
    }

    pub fn with_ft<R>(&self, f: impl FnOnce(&AnyDataHolder) -> R) -> Option<R> {
        self.ft.lock().as_ref().map(f)
    }

    pub fn ft_mem_stat(&self) -> usize {
        self.ft.lock().as_ref().map(|h| h.mem_stat()).unwrap_or(0)
    }

    pub fn put_meta(&self, key: &str, data: &str) {
        self.meta.write().insert(key.to_string(), data.to_string());
    }

    pub fn get_meta(&self, key: &str) -> Option<String> {
        self.meta.read().get(key).cloned()
    }

    pub fn truncate(&self) {
        let _w = self.write_lock.lock();
        self.items.write().clear();
        if let Some(ft) = self.ft.lock().as_mut() {
            ft.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ns_with_indexes() -> Namespace {
        let ns = Namespace::new("items").unwrap();
        ns.add_index(IndexDef {
            name: "id".into(),
            json_paths: vec![],
            field_type: "int64".into(),
            index_type: "hash".into(),
            is_array: false,
            config: Value::Null,
        })
        .unwrap();
        ns.add_index(IndexDef {
            name: "name".into(),
            json_paths: vec![],
            field_type: "string".into(),
            index_type: "hash".into(),
            is_array: false,
            config: Value::Null,
        })
        .unwrap();
        ns
    }

    #[test]
    fn add_index_rebuilds_payload_type() {
        let ns = ns_with_indexes();
        assert_eq!(ns.payload_type().num_fields(), 3); // tuple + id + name
        assert!(ns.payload_type().field_by_name("name").is_some());
    }

    #[test]
    fn duplicate_index_conflicts() {
        let ns = ns_with_indexes();
        let err = ns
            .add_index(IndexDef {
                name: "id".into(),
                json_paths: vec![],
                field_type: "int64".into(),
                index_type: "hash".into(),
                is_array: false,
                config: Value::Null,
            })
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Conflict);
    }

    #[test]
    fn items_survive_index_addition() {
        let ns = ns_with_indexes();
        let mut item = ns.new_item();
        item.from_json(br#"{"id": 1, "name": "a", "extra": 5}"#).unwrap();
        {
            let _w = ns.writer_lock();
            ns.adopt_tags(&item.tags_matcher).unwrap();
            ns.store(1, item.payload.clone(), item.document(), 1);
        }
        ns.add_index(IndexDef {
            name: "extra".into(),
            json_paths: vec![],
            field_type: "int".into(),
            index_type: "tree".into(),
            is_array: false,
            config: Value::Null,
        })
        .unwrap();
        let snapshot = ns.snapshot();
        assert_eq!(snapshot.len(), 1);
        let pt = ns.payload_type();
        let field = pt.field_by_name("extra").unwrap();
        let pl = Payload::new(&pt, &snapshot[0].1);
        assert_eq!(
            pl.get(field).unwrap().values,
            vec![crate::core::variant::Variant::Int(5)]
        );
    }

    #[test]
    fn fulltext_index_feeds_on_store() {
        let ns = ns_with_indexes();
        ns.add_index(IndexDef {
            name: "descr".into(),
            json_paths: vec![],
            field_type: "string".into(),
            index_type: "text".into(),
            is_array: false,
            config: Value::Null,
        })
        .unwrap();
        let doc = json!({"id": 1, "name": "x", "descr": "quick brown fox"});
        let mut item = ns.new_item();
        item.set_document(doc.clone()).unwrap();
        {
            let _w = ns.writer_lock();
            ns.store(1, item.payload.clone(), &doc, 1);
        }
        ns.commit_ft(false);
        let found = ns
            .with_ft(|h| {
                h.select(
                    &crate::ft::select::FtDslQuery::parse("quick"),
                    false,
                    0,
                    None,
                    &crate::core::ctx::RdxContext::empty(),
                )
                .unwrap()
                .infos
                .len()
            })
            .unwrap();
        assert_eq!(found, 1);
    }

    #[test]
    fn meta_round_trip() {
        let ns = ns_with_indexes();
        ns.put_meta("k", "v");
        assert_eq!(ns.get_meta("k").as_deref(), Some("v"));
        assert_eq!(ns.get_meta("missing"), None);
    }
}
