use crate::cjson::TagsMatcher;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::item::Item;
use crate::payload::payload_type::PayloadType;
use crate::query::query::Query;
use crate::query::types::{ItemModifyMode, QueryType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

/// One step of a transaction batch.
pub enum TransactionStep {
    ModifyItem { item: Item, mode: ItemModifyMode },
    Query(Query),
}

/// Batched modifications over a single namespace. Steps accumulate
/// locally; `Database::commit_transaction` applies them under the
/// namespace writer lock. Items are bound to the transaction's tags
/// matcher snapshot; the namespace matcher reconciles at commit.
pub struct Transaction {
    pub ns_name: String,
    pub payload_type: PayloadType,
    pub tags_matcher: TagsMatcher,
    steps: Vec<TransactionStep>,
    state: TransactionState,
    tags_updated: bool,
}

impl Transaction {
    pub fn new(ns_name: &str, payload_type: PayloadType, tags_matcher: TagsMatcher) -> Self {
        Transaction {
            ns_name: ns_name.to_string(),
            payload_type,
            tags_matcher,
            steps: Vec::new(),
            state: TransactionState::Active,
            tags_updated: false,
        }
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_tags_updated(&self) -> bool {
        self.tags_updated
    }

    pub fn check_active(&self) -> Result<()> {
        if self.state != TransactionState::Active {
            return Err(Error::new(ErrorKind::NotValid, "transaction is not active"));
        }
        Ok(())
    }

    /// New item bound to the transaction's matcher generation.
    pub fn new_item(&self) -> Item {
        Item::new(self.payload_type.clone(), self.tags_matcher.clone())
    }

    pub fn modify_item(&mut self, item: Item, mode: ItemModifyMode) -> Result<()> {
        self.check_active()?;
        // tags the item learned flow back into the transaction matcher,
        // so later new_item calls see them
        if item.is_tags_updated() {
            self.tags_matcher.merge(&item.tags_matcher)?;
            self.tags_updated = true;
        }
        self.steps.push(TransactionStep::ModifyItem { item, mode });
        Ok(())
    }

    pub fn modify_query(&mut self, query: Query) -> Result<()> {
        self.check_active()?;
        if !matches!(query.query_type, QueryType::Update | QueryType::Delete) {
            return Err(Error::new(
                ErrorKind::Params,
                "only update and delete queries can join a transaction",
            ));
        }
        if query.namespace != self.ns_name {
            return Err(Error::new(
                ErrorKind::Params,
                format!(
                    "transaction on '{}' can not modify namespace '{}'",
                    self.ns_name, query.namespace
                ),
            ));
        }
        self.steps.push(TransactionStep::Query(query));
        Ok(())
    }

    pub fn steps_count(&self) -> usize {
        self.steps.len()
    }

    pub(crate) fn take_steps(&mut self) -> Vec<TransactionStep> {
        std::mem::take(&mut self.steps)
    }

    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.check_active()?;
        self.steps.clear();
        self.state = TransactionState::RolledBack;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variant::KeyValueType;
    use serde_json::json;

    fn tx() -> Transaction {
        let pt = PayloadType::builder("items")
            .field("id", KeyValueType::Int64, false)
            .build()
            .unwrap();
        Transaction::new("items", pt, TagsMatcher::new())
    }

    #[test]
    fn steps_accumulate_until_commit() {
        let mut tx = tx();
        let mut item = tx.new_item();
        item.set_document(json!({"id": 1})).unwrap();
        tx.modify_item(item, ItemModifyMode::Upsert).unwrap();
        assert_eq!(tx.steps_count(), 1);

        let mut q = Query::new("items");
        q.query_type = QueryType::Delete;
        tx.modify_query(q).unwrap();
        assert_eq!(tx.steps_count(), 2);
    }

    #[test]
    fn select_queries_are_rejected() {
        let mut tx = tx();
        assert!(tx.modify_query(Query::new("items")).is_err());
    }

    #[test]
    fn wrong_namespace_is_rejected() {
        let mut tx = tx();
        let mut q = Query::new("other");
        q.query_type = QueryType::Delete;
        assert_eq!(tx.modify_query(q).unwrap_err().kind, ErrorKind::Params);
    }

    #[test]
    fn rollback_finalizes_the_transaction() {
        let mut tx = tx();
        tx.rollback().unwrap();
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert!(tx.rollback().is_err());
        assert!(tx.modify_query(Query::new("items")).is_err());
    }

    #[test]
    fn item_tags_flow_into_the_tx_matcher() {
        let mut tx = tx();
        let mut item = tx.new_item();
        item.set_document(json!({"id": 1, "fresh_field": true})).unwrap();
        assert!(item.is_tags_updated());
        tx.modify_item(item, ItemModifyMode::Upsert).unwrap();
        assert!(tx.is_tags_updated());
        assert!(tx.tags_matcher.name2tag("fresh_field").is_some());
    }
}
