use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::debug;

use crate::cjson::TagsMatcher;
use crate::core::ctx::RdxContext;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::item::{drop_json_field, set_json_field, Item};
use crate::core::namespace::{IndexDef, Namespace};
use crate::core::transaction::{Transaction, TransactionStep};
use crate::core::variant::Variant;
use crate::payload::payload::{build_payload, Payload};
use crate::payload::value::PayloadValue;
use crate::query::entries::EntryPayload;
use crate::query::expression::{ExpressionEvaluator, FunctionExecutor};
use crate::query::query::Query;
use crate::query::sql::get_sql;
use crate::query::types::{
    AggType, CalcTotalMode, FieldModifyMode, ItemModifyMode, JoinType, QueryType,
};
use crate::results::{aggregate_items, QueryResults};

const TOTALS_CACHE_SIZE: usize = 256;
const CANCEL_CHECK_PERIOD: usize = 64;

/// The embeddable engine: named namespaces plus the minimal in-process
/// executor behind the binding. Join execution belongs to an external
/// executor; merge queries and everything else run here.
pub struct Database {
    namespaces: RwLock<HashMap<String, Arc<Namespace>>>,
    totals_cache: Mutex<LruCache<String, usize>>,
    lsn_counter: std::sync::atomic::AtomicI64,
}

impl Default for Database {
    fn default() -> Self {
        Database::new()
    }
}

/// Select functions and precepts available to expressions.
struct NsFunctions<'a> {
    ns: &'a Namespace,
}

impl FunctionExecutor for NsFunctions<'_> {
    fn execute(&mut self, name: &str, _args: &[String], for_field: &str) -> Result<Variant> {
        match name {
            "serial" => Ok(Variant::Int64(self.ns.next_serial(for_field))),
            "now" => Ok(Variant::Int64(
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as i64)
                    .unwrap_or(0),
            )),
            other => Err(Error::new(
                ErrorKind::Params,
                format!("unknown function '{}'", other),
            )),
        }
    }
}

impl Database {
    pub fn new() -> Self {
        Database {
            namespaces: RwLock::new(HashMap::new()),
            totals_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(TOTALS_CACHE_SIZE).expect("cache size is non-zero"),
            )),
            lsn_counter: std::sync::atomic::AtomicI64::new(1),
        }
    }

    /// The engine is in-memory; connect only records intent and succeeds.
    pub fn connect(&self, dsn: &str) -> Result<()> {
        debug!(dsn, "connect");
        Ok(())
    }

    pub fn open_namespace(&self, name: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write();
        if !namespaces.contains_key(name) {
            namespaces.insert(name.to_string(), Arc::new(Namespace::new(name)?));
        }
        Ok(())
    }

    pub fn get_ns(&self, name: &str) -> Result<Arc<Namespace>> {
        self.namespaces
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("namespace '{}' does not exist", name)))
    }

    pub fn close_namespace(&self, name: &str) -> Result<()> {
        self.drop_namespace(name)
    }

    pub fn drop_namespace(&self, name: &str) -> Result<()> {
        self.namespaces
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("namespace '{}' does not exist", name)))
    }

    pub fn truncate_namespace(&self, name: &str) -> Result<()> {
        self.get_ns(name)?.truncate();
        Ok(())
    }

    pub fn rename_namespace(&self, src: &str, dst: &str) -> Result<()> {
        let mut namespaces = self.namespaces.write();
        if namespaces.contains_key(dst) {
            return Err(Error::new(
                ErrorKind::Conflict,
                format!("namespace '{}' already exists", dst),
            ));
        }
        let ns = namespaces
            .remove(src)
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("namespace '{}' does not exist", src)))?;
        *ns.name.write() = dst.to_string();
        namespaces.insert(dst.to_string(), ns);
        Ok(())
    }

    pub fn add_index(&self, ns: &str, def: IndexDef) -> Result<()> {
        self.get_ns(ns)?.add_index(def)
    }

    pub fn update_index(&self, ns: &str, def: IndexDef) -> Result<()> {
        self.get_ns(ns)?.update_index(def)
    }

    pub fn drop_index(&self, ns: &str, index: &str) -> Result<()> {
        self.get_ns(ns)?.drop_index(index)
    }

    pub fn set_schema(&self, ns: &str, schema: Value) -> Result<()> {
        self.get_ns(ns)?.set_schema(schema);
        Ok(())
    }

    pub fn new_item(&self, ns: &str) -> Result<Item> {
        Ok(self.get_ns(ns)?.new_item())
    }

    /// Applies one item modification; returns the stored item id for
    /// non-delete modes.
    pub fn modify_item(
        &self,
        ns_name: &str,
        item: &mut Item,
        mode: ItemModifyMode,
        ctx: &RdxContext,
    ) -> Result<Option<i64>> {
        ctx.check()?;
        let ns = self.get_ns(ns_name)?;
        let _w = ns.writer_lock();
        self.modify_item_locked(&ns, item, mode)
    }

    fn modify_item_locked(
        &self,
        ns: &Namespace,
        item: &mut Item,
        mode: ItemModifyMode,
    ) -> Result<Option<i64>> {
        let mut funcs = NsFunctions { ns };
        item.apply_precepts(&mut funcs)?;
        let existing = item.id().map(|id| self.item_exists(ns, id)).unwrap_or(false);
        match mode {
            ItemModifyMode::Insert if existing => {
                return Err(Error::new(
                    ErrorKind::Conflict,
                    format!("item with id {} already exists", item.id().unwrap_or(-1)),
                ))
            }
            ItemModifyMode::Update if !existing => {
                return Err(Error::new(
                    ErrorKind::NotFound,
                    "item to update does not exist",
                ))
            }
            ItemModifyMode::Delete => {
                if let Some(id) = item.id() {
                    ns.remove(id);
                }
                return Ok(None);
            }
            _ => {}
        }
        let id = match item.id() {
            Some(id) => id,
            None => {
                let id = ns.next_auto_id();
                item.set_id(id)?;
                id
            }
        };
        ns.adopt_tags(&item.tags_matcher)?;
        let lsn = self.lsn_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        ns.store(id, item.payload.clone(), item.document(), lsn);
        Ok(Some(id))
    }

    fn item_exists(&self, ns: &Namespace, id: i64) -> bool {
        ns.snapshot().iter().any(|(i, _)| *i == id)
    }

    /// Dispatches by query type.
    pub fn execute_query(&self, q: &Query, qr: &mut QueryResults, ctx: &RdxContext) -> Result<()> {
        match q.query_type {
            QueryType::Select => self.select(q, qr, ctx),
            QueryType::Update => self.update(q, qr, ctx),
            QueryType::Delete => self.delete(q, qr, ctx),
            QueryType::Truncate => self.truncate_namespace(&q.namespace),
        }
    }

    pub fn select_sql(&self, sql: &str, qr: &mut QueryResults, ctx: &RdxContext) -> Result<()> {
        let q = crate::query::sql::parse_sql(sql)?;
        self.select(&q, qr, ctx)
    }

    pub fn select(&self, q: &Query, qr: &mut QueryResults, ctx: &RdxContext) -> Result<()> {
        self.validate_joins(q)?;
        let ns = self.get_ns(&q.namespace)?;
        let pt = ns.payload_type();
        let tm = ns.tags_matcher();
        let ns_id = qr.add_namespace(&q.namespace, pt.clone(), tm.clone());

        let matched = self.matched_items(q, &ns, ctx)?;

        // totals before the window is applied
        match q.calc_total {
            CalcTotalMode::NoTotal => {}
            CalcTotalMode::AccurateTotal => qr.total_count = matched.len(),
            CalcTotalMode::CachedTotal => {
                let mut filter_only = q.clone();
                filter_only.start = crate::query::types::DEFAULT_OFFSET;
                filter_only.count = crate::query::types::DEFAULT_LIMIT;
                let key = get_sql(&filter_only, false);
                let mut cache = self.totals_cache.lock();
                match cache.get(&key) {
                    Some(total) => qr.total_count = *total,
                    None => {
                        cache.put(key, matched.len());
                        qr.total_count = matched.len();
                    }
                }
            }
        }

        // aggregations run over the full matched set
        for agg in &q.aggregations {
            ctx.check()?;
            let rows = matched.iter().map(|(_, value)| {
                let pl = Payload::new(&pt, value);
                agg.fields
                    .iter()
                    .flat_map(|f| self.field_values(&pl, &tm, f))
                    .collect::<Vec<Variant>>()
            });
            let mut result = aggregate_items(agg.agg_type, &agg.fields, rows);
            if agg.agg_type == AggType::Facet {
                let offset = agg.offset as usize;
                let limit = agg.limit as usize;
                if offset > 0 || limit != crate::query::types::DEFAULT_LIMIT as usize {
                    result.facets = result
                        .facets
                        .into_iter()
                        .skip(offset)
                        .take(limit)
                        .collect();
                }
            }
            qr.aggregation_results.push(result);
        }

        // a query whose only aggregation is distinct still returns items
        let keep_items = q.aggregations.iter().all(|a| a.agg_type == AggType::Distinct);
        let windowed = if keep_items {
            self.sort_and_window(q, &ns, matched)?
        } else {
            Vec::new()
        };

        if q.select_filter.is_empty() {
            for (id, value) in windowed {
                qr.add_item(id, ns_id, value);
            }
        } else {
            // final projection: re-encode items with the filtered document
            let mut proj_tm = tm.clone();
            for (id, value) in windowed {
                let doc = Payload::new(&pt, &value).document(&tm)?;
                let mut filtered = serde_json::Map::new();
                if let Value::Object(map) = doc {
                    for field in &q.select_filter {
                        if let Some(v) = map.get(field) {
                            filtered.insert(field.clone(), v.clone());
                        }
                    }
                }
                let filtered = Value::Object(filtered);
                let projected = build_payload(&pt, &filtered, &mut proj_tm)?;
                projected.set_lsn(value.get_lsn());
                qr.add_item(id, ns_id, projected);
            }
        }

        if q.explain {
            qr.explain_results = format!(
                "{{\"namespace\":\"{}\",\"method\":\"scan\",\"matched\":{},\"sort_by\":\"{}\"}}",
                q.namespace,
                qr.count(),
                q.sorting_entries.first().map(|s| s.expression.as_str()).unwrap_or(""),
            );
        }

        // merge queries concatenate their results after the primary set
        for mq in &q.merge_queries {
            if mq.join_type == JoinType::Merge {
                self.select(&mq.query, qr, ctx)?;
            }
        }
        Ok(())
    }

    pub fn update(&self, q: &Query, qr: &mut QueryResults, ctx: &RdxContext) -> Result<()> {
        let ns = self.get_ns(&q.namespace)?;
        let _w = ns.writer_lock();
        self.update_inner(&ns, q, qr, ctx)
    }

    fn update_inner(
        &self,
        ns: &Arc<Namespace>,
        q: &Query,
        qr: &mut QueryResults,
        ctx: &RdxContext,
    ) -> Result<()> {
        self.validate_joins(q)?;
        let pt = ns.payload_type();
        let tm = ns.tags_matcher();
        let ns_id = qr.add_namespace(&q.namespace, pt.clone(), tm.clone());

        let matched = self.matched_items(q, ns, ctx)?;
        for (id, value) in matched {
            ctx.check()?;
            let mut doc = Payload::new(&pt, &value).document(&tm)?;
            for entry in &q.update_fields {
                match entry.mode {
                    FieldModifyMode::Drop => drop_json_field(&mut doc, &entry.column),
                    FieldModifyMode::SetJson => {
                        for v in &entry.values {
                            let json_text = v.as_str().ok_or_else(|| {
                                Error::new(
                                    ErrorKind::Logic,
                                    "SetObject expects string values carrying JSON",
                                )
                            })?;
                            let parsed: Value = serde_json::from_str(json_text)?;
                            set_json_field(&mut doc, &entry.column, parsed);
                        }
                    }
                    FieldModifyMode::Set => {
                        let values = if entry.is_expression {
                            let mut out = Vec::new();
                            for v in &entry.values {
                                let expr = v.as_str().ok_or_else(|| {
                                    Error::new(ErrorKind::Params, "expression value must be a string")
                                })?;
                                let mut funcs = NsFunctions { ns: ns.as_ref() };
                                let mut eval = ExpressionEvaluator::new(&pt, &tm, &mut funcs);
                                out.extend(eval.evaluate(expr, &value, &entry.column)?);
                            }
                            out
                        } else {
                            entry.values.values.clone()
                        };
                        let json_value = if entry.values.is_array_value() || values.len() > 1 {
                            Value::Array(values.iter().map(variant_json).collect())
                        } else {
                            values.first().map(variant_json).unwrap_or(Value::Null)
                        };
                        set_json_field(&mut doc, &entry.column, json_value);
                    }
                }
            }
            let mut ns_tm = ns.tags_matcher();
            let new_value = build_payload(&pt, &doc, &mut ns_tm)?;
            ns.adopt_tags(&ns_tm)?;
            let lsn = self.lsn_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            ns.store(id, new_value.clone(), &doc, lsn);
            qr.add_item(id, ns_id, new_value);
        }
        Ok(())
    }

    pub fn delete(&self, q: &Query, qr: &mut QueryResults, ctx: &RdxContext) -> Result<()> {
        let ns = self.get_ns(&q.namespace)?;
        let _w = ns.writer_lock();
        self.delete_inner(&ns, q, qr, ctx)
    }

    fn delete_inner(
        &self,
        ns: &Arc<Namespace>,
        q: &Query,
        qr: &mut QueryResults,
        ctx: &RdxContext,
    ) -> Result<()> {
        self.validate_joins(q)?;
        let ns_id = qr.add_namespace(&q.namespace, ns.payload_type(), ns.tags_matcher());
        let matched = self.matched_items(q, ns, ctx)?;
        for (id, value) in matched {
            ns.remove(id);
            qr.add_item(id, ns_id, value);
        }
        Ok(())
    }

    fn validate_joins(&self, q: &Query) -> Result<()> {
        let has_join_entries = q
            .entries
            .nodes()
            .iter()
            .any(|n| matches!(n.payload, EntryPayload::Join(_)));
        if has_join_entries {
            return Err(Error::new(
                ErrorKind::Logic,
                "join execution requires the external executor",
            ));
        }
        Ok(())
    }

    fn matched_items(
        &self,
        q: &Query,
        ns: &Namespace,
        ctx: &RdxContext,
    ) -> Result<Vec<(i64, PayloadValue)>> {
        let pt = ns.payload_type();
        let tm = ns.tags_matcher();
        let mut matched = Vec::new();
        for (scanned, (id, value)) in ns.snapshot().into_iter().enumerate() {
            if scanned % CANCEL_CHECK_PERIOD == 0 {
                ctx.check()?;
            }
            let pl = Payload::new(&pt, &value);
            if q.entries.is_empty() || q.entries.check_if_satisfy(&pl, &tm)? {
                matched.push((id, value));
            }
        }
        Ok(matched)
    }

    fn sort_and_window(
        &self,
        q: &Query,
        ns: &Namespace,
        mut matched: Vec<(i64, PayloadValue)>,
    ) -> Result<Vec<(i64, PayloadValue)>> {
        if let Some(sort) = q.sorting_entries.first() {
            let pt = ns.payload_type();
            let tm = ns.tags_matcher();
            let key_of = |value: &PayloadValue| -> Variant {
                let pl = Payload::new(&pt, value);
                self.field_values(&pl, &tm, &sort.expression)
                    .into_iter()
                    .next()
                    .unwrap_or(Variant::Null)
            };
            let forced = &q.forced_sort_order;
            let forced_pos = |v: &Variant| -> usize {
                forced
                    .iter()
                    .position(|f| f.relax_compare_with_string(v) == std::cmp::Ordering::Equal)
                    .unwrap_or(usize::MAX)
            };
            matched.sort_by(|a, b| {
                let ka = key_of(&a.1);
                let kb = key_of(&b.1);
                let ord = if forced.is_empty() {
                    ka.compare(&kb).unwrap_or(std::cmp::Ordering::Equal)
                } else {
                    // forced keys go first, in forced order
                    forced_pos(&ka)
                        .cmp(&forced_pos(&kb))
                        .then_with(|| ka.compare(&kb).unwrap_or(std::cmp::Ordering::Equal))
                };
                if sort.desc {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        let start = q.start as usize;
        let out: Vec<(i64, PayloadValue)> = matched
            .into_iter()
            .skip(start)
            .take(q.count as usize)
            .collect();
        Ok(out)
    }

    fn field_values(&self, pl: &Payload, tm: &TagsMatcher, field: &str) -> Vec<Variant> {
        match pl.payload_type().field_by_name(field) {
            Some(idx) => pl.get(idx).map(|v| v.values).unwrap_or_default(),
            None => pl
                .get_by_json_path(field, tm)
                .map(|v| v.values)
                .unwrap_or_default(),
        }
    }

    // --- transactions ---

    pub fn new_transaction(&self, ns_name: &str) -> Result<Transaction> {
        let ns = self.get_ns(ns_name)?;
        Ok(Transaction::new(ns_name, ns.payload_type(), ns.tags_matcher()))
    }

    /// Applies the batch atomically from the caller's point of view: the
    /// namespace writer lock is held across all steps. The transaction's
    /// tags matcher is reconciled with the namespace's here, not earlier.
    pub fn commit_transaction(
        &self,
        tx: &mut Transaction,
        qr: &mut QueryResults,
        ctx: &RdxContext,
    ) -> Result<()> {
        tx.check_active()?;
        let ns = self.get_ns(&tx.ns_name)?;
        {
            let _w = ns.writer_lock();
            ns.adopt_tags(&tx.tags_matcher)?;
            for step in tx.take_steps() {
                ctx.check()?;
                match step {
                    TransactionStep::ModifyItem { mut item, mode } => {
                        if let Some(id) = self.modify_item_locked(&ns, &mut item, mode)? {
                            let ns_id = qr.add_namespace(&tx.ns_name, ns.payload_type(), ns.tags_matcher());
                            qr.add_item(id, ns_id, item.payload.clone());
                        }
                    }
                    TransactionStep::Query(q) => match q.query_type {
                        QueryType::Update => self.update_inner(&ns, &q, qr, ctx)?,
                        QueryType::Delete => self.delete_inner(&ns, &q, qr, ctx)?,
                        _ => {
                            return Err(Error::new(
                                ErrorKind::Params,
                                "only update and delete queries can join a transaction",
                            ))
                        }
                    },
                }
            }
        }
        tx.mark_committed();
        ns.commit_ft(false);
        Ok(())
    }

    pub fn rollback_transaction(&self, tx: &mut Transaction) -> Result<()> {
        tx.rollback()
    }

    // --- meta ---

    pub fn put_meta(&self, ns: &str, key: &str, data: &str) -> Result<()> {
        self.get_ns(ns)?.put_meta(key, data);
        Ok(())
    }

    pub fn get_meta(&self, ns: &str, key: &str) -> Result<String> {
        Ok(self.get_ns(ns)?.get_meta(key).unwrap_or_default())
    }

    pub fn commit(&self, ns: &str) -> Result<()> {
        self.get_ns(ns)?.commit_ft(true);
        Ok(())
    }
}

fn variant_json(v: &Variant) -> Value {
    match v {
        Variant::Null => Value::Null,
        Variant::Int(i) => Value::from(*i),
        Variant::Int64(i) => Value::from(*i),
        Variant::Double(d) => Value::from(*d),
        Variant::Bool(b) => Value::from(*b),
        Variant::String(s) => Value::from(s.as_str()),
        Variant::Uuid(u) => Value::from(u.to_string()),
        Variant::Point(p) => Value::from(vec![p.x, p.y]),
        Variant::Tuple(items) => Value::Array(items.iter().map(variant_json).collect()),
        Variant::Composite(_) => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variant::VariantArray;
    use crate::query::types::CondType;
    use serde_json::json;

    fn seeded_db() -> Database {
        let db = Database::new();
        db.open_namespace("users").unwrap();
        db.add_index(
            "users",
            IndexDef {
                name: "id".into(),
                json_paths: vec![],
                field_type: "int64".into(),
                index_type: "hash".into(),
                is_array: false,
                config: Value::Null,
            },
        )
        .unwrap();
        db.add_index(
            "users",
            IndexDef {
                name: "age".into(),
                json_paths: vec![],
                field_type: "int".into(),
                index_type: "tree".into(),
                is_array: false,
                config: Value::Null,
            },
        )
        .unwrap();
        db.add_index(
            "users",
            IndexDef {
                name: "city".into(),
                json_paths: vec![],
                field_type: "string".into(),
                index_type: "hash".into(),
                is_array: false,
                config: Value::Null,
            },
        )
        .unwrap();
        for (id, age, city) in [(1, 17, "Kyiv"), (2, 25, "Kyiv"), (3, 30, "Lviv"), (4, 40, "Odesa")] {
            let mut item = db.new_item("users").unwrap();
            item.set_document(json!({"id": id, "age": age, "city": city})).unwrap();
            db.modify_item("users", &mut item, ItemModifyMode::Upsert, &RdxContext::empty())
                .unwrap();
        }
        db
    }

    #[test]
    fn select_with_filter_sort_and_window() {
        let db = seeded_db();
        let q = Query::new("users")
            .where_cond("age", CondType::Ge, VariantArray::single(Variant::Int(18)))
            .unwrap()
            .sort("age", true)
            .limit(2)
            .req_total();
        let mut qr = QueryResults::new();
        db.select(&q, &mut qr, &RdxContext::empty()).unwrap();
        assert_eq!(qr.total_count, 3);
        assert_eq!(qr.count(), 2);
        let first = qr.get_item_json(0).unwrap();
        assert_eq!(first["age"], json!(40));
    }

    #[test]
    fn select_bracketed_or() {
        let db = seeded_db();
        let q = Query::new("users")
            .where_cond("age", CondType::Gt, VariantArray::single(Variant::Int(18)))
            .unwrap()
            .open_bracket()
            .where_cond("city", CondType::Eq, VariantArray::single(Variant::str("Kyiv")))
            .unwrap()
            .or()
            .where_cond("city", CondType::Eq, VariantArray::single(Variant::str("Lviv")))
            .unwrap()
            .close_bracket()
            .unwrap();
        let mut qr = QueryResults::new();
        db.select(&q, &mut qr, &RdxContext::empty()).unwrap();
        assert_eq!(qr.count(), 2); // ids 2, 3
    }

    #[test]
    fn aggregation_sum() {
        let db = seeded_db();
        let q = Query::new("users")
            .aggregate(
                AggType::Sum,
                vec!["age".into()],
                vec![],
                crate::query::types::DEFAULT_LIMIT,
                crate::query::types::DEFAULT_OFFSET,
            )
            .unwrap();
        let mut qr = QueryResults::new();
        db.select(&q, &mut qr, &RdxContext::empty()).unwrap();
        assert_eq!(qr.aggregation_results[0].value, Some(112.0));
        assert_eq!(qr.count(), 0); // pure aggregation keeps no items
    }

    #[test]
    fn update_with_expression() {
        let db = seeded_db();
        let mut q = Query::new("users")
            .where_cond("id", CondType::Eq, VariantArray::single(Variant::Int(2)))
            .unwrap()
            .set("age", VariantArray::single(Variant::str("age + 5")), true)
            .unwrap();
        q.query_type = QueryType::Update;
        let mut qr = QueryResults::new();
        db.update(&q, &mut qr, &RdxContext::empty()).unwrap();
        assert_eq!(qr.count(), 1);
        assert_eq!(qr.get_item_json(0).unwrap()["age"], json!(30.0));
    }

    #[test]
    fn delete_query_removes_items() {
        let db = seeded_db();
        let mut q = Query::new("users")
            .where_cond("city", CondType::Eq, VariantArray::single(Variant::str("Kyiv")))
            .unwrap();
        q.query_type = QueryType::Delete;
        let mut qr = QueryResults::new();
        db.delete(&q, &mut qr, &RdxContext::empty()).unwrap();
        assert_eq!(qr.count(), 2);
        assert_eq!(db.get_ns("users").unwrap().item_count(), 2);
    }

    #[test]
    fn forced_sort_order_prefixes_results() {
        let db = seeded_db();
        let q = Query::new("users")
            .sort_forced("city", false, vec![Variant::str("Lviv"), Variant::str("Odesa")])
            .unwrap();
        let mut qr = QueryResults::new();
        db.select(&q, &mut qr, &RdxContext::empty()).unwrap();
        assert_eq!(qr.get_item_json(0).unwrap()["city"], json!("Lviv"));
        assert_eq!(qr.get_item_json(1).unwrap()["city"], json!("Odesa"));
    }

    #[test]
    fn merge_queries_concatenate() {
        let db = seeded_db();
        db.open_namespace("users_archive").unwrap();
        let mut old = db.new_item("users_archive").unwrap();
        old.set_document(json!({"id": 100, "age": 99})).unwrap();
        db.modify_item("users_archive", &mut old, ItemModifyMode::Upsert, &RdxContext::empty())
            .unwrap();

        let q = Query::new("users").merge(Query::new("users_archive"));
        let mut qr = QueryResults::new();
        db.select(&q, &mut qr, &RdxContext::empty()).unwrap();
        assert_eq!(qr.count(), 5);
        assert_eq!(qr.namespaces().len(), 2);
    }

    #[test]
    fn join_entries_are_rejected_by_the_core_executor() {
        let db = seeded_db();
        let q = Query::new("users").inner_join("id", "user_id", CondType::Eq, Query::new("orders"));
        let mut qr = QueryResults::new();
        let err = db.select(&q, &mut qr, &RdxContext::empty()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Logic);
    }

    #[test]
    fn canceled_select_returns_no_partial_results() {
        let db = seeded_db();
        let ctx = RdxContext::cancellable();
        ctx.cancel(crate::core::ctx::CancelType::Explicit);
        let mut qr = QueryResults::new();
        let err = db.select(&Query::new("users"), &mut qr, &ctx).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Canceled);
        assert_eq!(qr.count(), 0);
    }

    #[test]
    fn transaction_commit_applies_batch() {
        let db = seeded_db();
        let mut tx = db.new_transaction("users").unwrap();
        let mut item = tx.new_item();
        item.set_document(json!({"id": 10, "age": 50, "city": "Dnipro"})).unwrap();
        tx.modify_item(item, ItemModifyMode::Upsert).unwrap();

        let mut dq = Query::new("users")
            .where_cond("id", CondType::Eq, VariantArray::single(Variant::Int(1)))
            .unwrap();
        dq.query_type = QueryType::Delete;
        tx.modify_query(dq).unwrap();

        let mut qr = QueryResults::new();
        db.commit_transaction(&mut tx, &mut qr, &RdxContext::empty()).unwrap();
        let ns = db.get_ns("users").unwrap();
        assert_eq!(ns.item_count(), 4); // +1 insert, -1 delete
        // committing twice is an error
        let mut qr2 = QueryResults::new();
        assert!(db.commit_transaction(&mut tx, &mut qr2, &RdxContext::empty()).is_err());
    }

    #[test]
    fn rollback_discards_steps() {
        let db = seeded_db();
        let mut tx = db.new_transaction("users").unwrap();
        let mut item = tx.new_item();
        item.set_document(json!({"id": 11, "age": 60})).unwrap();
        tx.modify_item(item, ItemModifyMode::Upsert).unwrap();
        db.rollback_transaction(&mut tx).unwrap();
        assert_eq!(db.get_ns("users").unwrap().item_count(), 4);
    }

    #[test]
    fn cached_total_mode_uses_the_cache() {
        let db = seeded_db();
        let q = Query::new("users")
            .where_cond("age", CondType::Ge, VariantArray::single(Variant::Int(18)))
            .unwrap()
            .cached_total();
        let mut qr = QueryResults::new();
        db.select(&q, &mut qr, &RdxContext::empty()).unwrap();
        assert_eq!(qr.total_count, 3);

        // remove a matching item; the cached figure survives
        let mut dq = Query::new("users")
            .where_cond("id", CondType::Eq, VariantArray::single(Variant::Int(4)))
            .unwrap();
        dq.query_type = QueryType::Delete;
        db.delete(&dq, &mut QueryResults::new(), &RdxContext::empty()).unwrap();

        let mut qr2 = QueryResults::new();
        db.select(&q, &mut qr2, &RdxContext::empty()).unwrap();
        assert_eq!(qr2.total_count, 3);
    }
}
