use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::{Point, Variant, VariantArray};
use crate::query::entries::{
    BetweenFieldsQueryEntry, EntryPayload, JoinQueryEntry, QueryEntries, QueryEntry,
};
use crate::query::types::{
    AggType, CalcTotalMode, CondType, FieldModifyMode, JoinType, OpType, QueryType, StrictMode,
    DEFAULT_LIMIT, DEFAULT_OFFSET,
};

pub const AGGREGATION_WITH_SELECT_FIELDS_MSG: &str =
    "Not allowed to combine aggregation functions and fields' filter in a single query";

/// One ORDER BY entry: an expression (usually a field name) plus direction.
#[derive(Debug, Clone, PartialEq)]
pub struct SortingEntry {
    pub expression: String,
    pub desc: bool,
}

/// Aggregation request over one or more fields.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    pub agg_type: AggType,
    pub fields: Vec<String>,
    pub sorting: Vec<SortingEntry>,
    pub limit: u32,
    pub offset: u32,
}

impl AggregateEntry {
    pub fn new(agg_type: AggType, fields: Vec<String>) -> Self {
        AggregateEntry {
            agg_type,
            fields,
            sorting: Vec::new(),
            limit: DEFAULT_LIMIT,
            offset: DEFAULT_OFFSET,
        }
    }
}

/// One SET/DROP clause of an update query.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEntry {
    pub column: String,
    pub values: VariantArray,
    pub mode: FieldModifyMode,
    pub is_expression: bool,
}

impl UpdateEntry {
    pub fn new(
        column: impl Into<String>,
        values: VariantArray,
        mode: FieldModifyMode,
        is_expression: bool,
    ) -> Result<Self> {
        let column = column.into();
        if column.is_empty() {
            return Err(Error::new(ErrorKind::Params, "empty update column name"));
        }
        if mode == FieldModifyMode::SetJson {
            for v in &values {
                if v.as_str().is_none() {
                    return Err(Error::new(
                        ErrorKind::Logic,
                        format!(
                            "unexpected value type in SetObject for '{}': expecting string with JSON content",
                            column
                        ),
                    ));
                }
            }
        }
        Ok(UpdateEntry { column, values, mode, is_expression })
    }
}

/// ON predicate of a join query.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryJoinEntry {
    pub op: OpType,
    pub condition: CondType,
    pub left_field: String,
    pub right_field: String,
}

/// Query over one namespace: filter tree, sorting, aggregations, joined
/// and merged subqueries, update clauses. Built with consuming builder
/// methods and executable as select/update/delete/truncate.
#[derive(Debug, Clone)]
pub struct Query {
    pub namespace: String,
    pub entries: QueryEntries,
    pub start: u32,
    pub count: u32,
    pub calc_total: CalcTotalMode,
    pub debug_level: i32,
    pub strict_mode: StrictMode,
    pub query_type: QueryType,
    pub explain: bool,
    pub with_rank: bool,
    pub sorting_entries: Vec<SortingEntry>,
    /// Keys that go first, before any naturally ordered values; only
    /// allowed with exactly one sorting entry.
    pub forced_sort_order: Vec<Variant>,
    pub aggregations: Vec<AggregateEntry>,
    pub select_filter: Vec<String>,
    pub select_functions: Vec<String>,
    pub update_fields: Vec<UpdateEntry>,
    pub join_queries: Vec<JoinedQuery>,
    pub merge_queries: Vec<JoinedQuery>,
    next_op: OpType,
}

impl Query {
    pub fn new(namespace: impl Into<String>) -> Self {
        Query {
            namespace: namespace.into(),
            entries: QueryEntries::new(),
            start: DEFAULT_OFFSET,
            count: DEFAULT_LIMIT,
            calc_total: CalcTotalMode::NoTotal,
            debug_level: 0,
            strict_mode: StrictMode::NotSet,
            query_type: QueryType::Select,
            explain: false,
            with_rank: false,
            sorting_entries: Vec::new(),
            forced_sort_order: Vec::new(),
            aggregations: Vec::new(),
            select_filter: Vec::new(),
            select_functions: Vec::new(),
            update_fields: Vec::new(),
            join_queries: Vec::new(),
            merge_queries: Vec::new(),
            next_op: OpType::And,
        }
    }

    fn take_op(&mut self) -> OpType {
        std::mem::replace(&mut self.next_op, OpType::And)
    }

    pub fn where_cond(
        mut self,
        field: impl Into<String>,
        cond: CondType,
        values: impl Into<VariantArray>,
    ) -> Result<Self> {
        let op = self.take_op();
        self.entries
            .append(op, EntryPayload::Condition(QueryEntry::new(field, cond, values.into())?));
        Ok(self)
    }

    pub fn where_between_fields(
        mut self,
        left: impl Into<String>,
        cond: CondType,
        right: impl Into<String>,
    ) -> Result<Self> {
        let op = self.take_op();
        self.entries
            .append(op, EntryPayload::BetweenFields(BetweenFieldsQueryEntry::new(left, cond, right)?));
        Ok(self)
    }

    pub fn dwithin(self, field: impl Into<String>, p: Point, distance: f64) -> Result<Self> {
        self.where_cond(
            field,
            CondType::DWithin,
            VariantArray::from_values(vec![Variant::Point(p), Variant::Double(distance)]),
        )
    }

    pub fn always_false(mut self) -> Self {
        let op = self.take_op();
        self.entries.append(op, EntryPayload::AlwaysFalse);
        self
    }

    pub fn or(mut self) -> Self {
        self.next_op = OpType::Or;
        self
    }

    pub fn not(mut self) -> Self {
        self.next_op = OpType::Not;
        self
    }

    pub fn open_bracket(mut self) -> Self {
        let op = self.take_op();
        self.entries.open_bracket(op);
        self
    }

    pub fn close_bracket(mut self) -> Result<Self> {
        self.entries.close_bracket()?;
        Ok(self)
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.count = limit;
        self
    }

    pub fn offset(mut self, offset: u32) -> Self {
        self.start = offset;
        self
    }

    pub fn req_total(mut self) -> Self {
        self.calc_total = CalcTotalMode::AccurateTotal;
        self
    }

    /// Total count served through the engine's LRU cache.
    pub fn cached_total(mut self) -> Self {
        self.calc_total = CalcTotalMode::CachedTotal;
        self
    }

    pub fn explain(mut self) -> Self {
        self.explain = true;
        self
    }

    pub fn with_rank(mut self) -> Self {
        self.with_rank = true;
        self
    }

    pub fn debug(mut self, level: i32) -> Self {
        self.debug_level = level;
        self
    }

    pub fn strict(mut self, mode: StrictMode) -> Self {
        self.strict_mode = mode;
        self
    }

    pub fn sort(mut self, expression: impl Into<String>, desc: bool) -> Self {
        let expression = expression.into();
        if !expression.is_empty() {
            self.sorting_entries.push(SortingEntry { expression, desc });
        }
        self
    }

    pub fn sort_forced(
        mut self,
        expression: impl Into<String>,
        desc: bool,
        forced_order: Vec<Variant>,
    ) -> Result<Self> {
        if !self.sorting_entries.is_empty() && !forced_order.is_empty() {
            return Err(Error::new(
                ErrorKind::Params,
                "forced sort order is allowed for the first sorting entry only",
            ));
        }
        self.sorting_entries.push(SortingEntry { expression: expression.into(), desc });
        self.forced_sort_order.extend(forced_order);
        Ok(self)
    }

    pub fn can_add_aggregation(&self, agg_type: AggType) -> bool {
        agg_type == AggType::Distinct || self.select_filter.is_empty()
    }

    pub fn can_add_select_filter(&self) -> bool {
        self.aggregations.is_empty()
            || (self.aggregations.len() == 1 && self.aggregations[0].agg_type == AggType::Distinct)
    }

    pub fn aggregate(
        mut self,
        agg_type: AggType,
        fields: Vec<String>,
        sort: Vec<(String, bool)>,
        limit: u32,
        offset: u32,
    ) -> Result<Self> {
        if !self.can_add_aggregation(agg_type) {
            return Err(Error::new(ErrorKind::Conflict, AGGREGATION_WITH_SELECT_FIELDS_MSG));
        }
        let mut entry = AggregateEntry::new(agg_type, fields);
        entry.sorting = sort
            .into_iter()
            .map(|(expression, desc)| SortingEntry { expression, desc })
            .collect();
        entry.limit = limit;
        entry.offset = offset;
        self.aggregations.push(entry);
        Ok(self)
    }

    pub fn distinct(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        if !field.is_empty() {
            self.aggregations.push(AggregateEntry::new(AggType::Distinct, vec![field]));
        }
        self
    }

    pub fn select(mut self, fields: Vec<String>) -> Result<Self> {
        if !self.can_add_select_filter() {
            return Err(Error::new(ErrorKind::Conflict, AGGREGATION_WITH_SELECT_FIELDS_MSG));
        }
        self.select_filter.extend(fields);
        Ok(self)
    }

    pub fn function(mut self, func: impl Into<String>) -> Self {
        self.select_functions.push(func.into());
        self
    }

    pub fn set(
        mut self,
        field: impl Into<String>,
        values: VariantArray,
        is_expression: bool,
    ) -> Result<Self> {
        self.update_fields
            .push(UpdateEntry::new(field, values, FieldModifyMode::Set, is_expression)?);
        Ok(self)
    }

    pub fn set_object(
        mut self,
        field: impl Into<String>,
        values: VariantArray,
        is_expression: bool,
    ) -> Result<Self> {
        self.update_fields
            .push(UpdateEntry::new(field, values, FieldModifyMode::SetJson, is_expression)?);
        Ok(self)
    }

    pub fn drop_field(mut self, field: impl Into<String>) -> Result<Self> {
        self.update_fields
            .push(UpdateEntry::new(field, VariantArray::new(), FieldModifyMode::Drop, false)?);
        Ok(self)
    }

    pub fn add_equal_position(mut self, fields: Vec<String>) -> Self {
        self.entries.current_equal_positions().push(fields);
        self
    }

    /// Join with an ON predicate. Non-left joins also place a join entry
    /// into the filter tree, referencing the new subquery by index.
    pub fn join(
        mut self,
        join_type: JoinType,
        left_field: impl Into<String>,
        right_field: impl Into<String>,
        cond: CondType,
        op: OpType,
        other: Query,
    ) -> Self {
        let mut jq = JoinedQuery::new(join_type, other);
        jq.join_entries.push(QueryJoinEntry {
            op,
            condition: cond,
            left_field: left_field.into(),
            right_field: right_field.into(),
        });
        self.push_join(jq);
        self
    }

    fn push_join(&mut self, jq: JoinedQuery) {
        let join_type = jq.join_type;
        self.join_queries.push(jq);
        if join_type != JoinType::LeftJoin {
            let entry_op = if join_type == JoinType::OrInnerJoin { OpType::Or } else { OpType::And };
            self.entries.append(
                entry_op,
                EntryPayload::Join(JoinQueryEntry { join_index: self.join_queries.len() - 1 }),
            );
        }
    }

    pub fn inner_join(
        self,
        left_field: impl Into<String>,
        right_field: impl Into<String>,
        cond: CondType,
        other: Query,
    ) -> Self {
        self.join(JoinType::InnerJoin, left_field, right_field, cond, OpType::And, other)
    }

    pub fn left_join(
        self,
        left_field: impl Into<String>,
        right_field: impl Into<String>,
        cond: CondType,
        other: Query,
    ) -> Self {
        self.join(JoinType::LeftJoin, left_field, right_field, cond, OpType::And, other)
    }

    pub fn or_inner_join(
        self,
        left_field: impl Into<String>,
        right_field: impl Into<String>,
        cond: CondType,
        other: Query,
    ) -> Self {
        self.join(JoinType::OrInnerJoin, left_field, right_field, cond, OpType::And, other)
    }

    pub fn merge(mut self, other: Query) -> Self {
        self.merge_queries.push(JoinedQuery::new(JoinType::Merge, other));
        self
    }

    pub fn has_limit(&self) -> bool {
        self.count != DEFAULT_LIMIT
    }

    pub fn has_offset(&self) -> bool {
        self.start != DEFAULT_OFFSET
    }

    /// Visits joined and merged subqueries (and merged queries' joins).
    pub fn walk_nested(&self, with_self: bool, with_merged: bool, visitor: &mut dyn FnMut(&Query)) {
        if with_self {
            visitor(self);
        }
        if with_merged {
            for mq in &self.merge_queries {
                visitor(&mq.query);
            }
        }
        for jq in &self.join_queries {
            visitor(&jq.query);
        }
        for mq in &self.merge_queries {
            for jq in &mq.query.join_queries {
                visitor(&jq.query);
            }
        }
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        if self.entries != other.entries
            || self.aggregations != other.aggregations
            || self.namespace != other.namespace
            || self.sorting_entries != other.sorting_entries
            || self.calc_total != other.calc_total
            || self.start != other.start
            || self.count != other.count
            || self.debug_level != other.debug_level
            || self.strict_mode != other.strict_mode
            || self.forced_sort_order.len() != other.forced_sort_order.len()
            || self.select_filter != other.select_filter
            || self.select_functions != other.select_functions
            || self.join_queries != other.join_queries
            || self.merge_queries != other.merge_queries
            || self.update_fields != other.update_fields
        {
            return false;
        }
        // Forced sort keys may be re-typed by the wire; compare relaxed.
        self.forced_sort_order
            .iter()
            .zip(&other.forced_sort_order)
            .all(|(a, b)| a.relax_compare_with_string(b) == std::cmp::Ordering::Equal)
    }
}

/// A subquery attached to its parent with a join type; `join_entries`
/// carries the ON predicates (empty for merge queries).
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedQuery {
    pub join_type: JoinType,
    pub query: Query,
    pub join_entries: Vec<QueryJoinEntry>,
}

impl JoinedQuery {
    pub fn new(join_type: JoinType, query: Query) -> Self {
        JoinedQuery { join_type, query, join_entries: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_produces_expected_tree() {
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
            .unwrap()
            .sort("name", true)
            .limit(10)
            .offset(5);
        assert_eq!(q.entries.len(), 4);
        assert!(q.has_limit() && q.has_offset());
    }

    #[test]
    fn aggregation_conflicts_with_select_filter() {
        let q = Query::new("ns").select(vec!["a".into()]).unwrap();
        assert!(q.clone().aggregate(AggType::Sum, vec!["b".into()], vec![], DEFAULT_LIMIT, DEFAULT_OFFSET).is_err());
        // distinct is the one allowed combination
        assert!(q.aggregate(AggType::Distinct, vec!["b".into()], vec![], DEFAULT_LIMIT, DEFAULT_OFFSET).is_ok());
    }

    #[test]
    fn forced_sort_only_on_first_entry() {
        let q = Query::new("ns").sort("a", false);
        assert!(q.sort_forced("b", false, vec![Variant::Int(1)]).is_err());
    }

    #[test]
    fn set_object_requires_json_strings() {
        let err = Query::new("ns")
            .set_object("f", VariantArray::single(Variant::Int(5)), false)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Logic);
    }

    #[test]
    fn inner_join_adds_tree_entry() {
        let q = Query::new("orders").inner_join("user_id", "id", CondType::Eq, Query::new("users"));
        assert_eq!(q.join_queries.len(), 1);
        assert_eq!(q.entries.len(), 1);
        // left join stays out of the filter tree
        let q2 = Query::new("orders").left_join("user_id", "id", CondType::Eq, Query::new("users"));
        assert_eq!(q2.join_queries.len(), 1);
        assert!(q2.entries.is_empty());
    }
}
