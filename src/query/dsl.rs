use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::{Point, Variant, VariantArray};
use crate::payload::payload::json_to_variant;
use crate::query::entries::{
    BetweenFieldsQueryEntry, EntryPayload, JoinQueryEntry, QueryEntries, QueryEntry,
};
use crate::query::query::{
    AggregateEntry, JoinedQuery, Query, QueryJoinEntry, SortingEntry, UpdateEntry,
};
use crate::query::types::{
    AggType, CalcTotalMode, CondType, FieldModifyMode, JoinType, OpType, StrictMode,
    DEFAULT_LIMIT, DEFAULT_OFFSET,
};

// Textual face of the query: a serde document that mirrors the model
// closely enough to round-trip it.

#[derive(Debug, Serialize, Deserialize)]
struct QueryDsl {
    namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u32>,
    #[serde(default = "default_total", skip_serializing_if = "is_default_total")]
    req_total: CalcTotalMode,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    explain: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    with_rank: bool,
    #[serde(default, skip_serializing_if = "is_zero")]
    debug_level: i32,
    #[serde(default = "default_strict", skip_serializing_if = "is_default_strict")]
    strict_mode: StrictMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    filters: Vec<FilterDsl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    equal_positions: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sort: Vec<SortDsl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    aggregations: Vec<AggDsl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    select_filter: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    select_functions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    update_fields: Vec<UpdateDsl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    join_queries: Vec<JoinDsl>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    merge_queries: Vec<JoinDsl>,
}

fn default_total() -> CalcTotalMode {
    CalcTotalMode::NoTotal
}

fn is_default_total(v: &CalcTotalMode) -> bool {
    *v == CalcTotalMode::NoTotal
}

fn default_strict() -> StrictMode {
    StrictMode::NotSet
}

fn is_default_strict(v: &StrictMode) -> bool {
    *v == StrictMode::NotSet
}

fn is_zero(v: &i32) -> bool {
    *v == 0
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum FilterDsl {
    Bracket {
        op: OpType,
        filters: Vec<FilterDsl>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        equal_positions: Vec<Vec<String>>,
    },
    BetweenFields {
        op: OpType,
        first_field: String,
        cond: CondType,
        second_field: String,
    },
    Join {
        op: OpType,
        join_index: usize,
    },
    AlwaysFalse {
        op: OpType,
        always_false: bool,
    },
    Condition {
        op: OpType,
        field: String,
        cond: CondType,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        value: Vec<Value>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        distinct: bool,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct SortDsl {
    field: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    desc: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    values: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AggDsl {
    #[serde(rename = "type")]
    agg_type: AggType,
    fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sort: Vec<SortDsl>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offset: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UpdateDsl {
    field: String,
    mode: FieldModifyMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    values: Vec<Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_array: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    is_expression: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct JoinDsl {
    #[serde(rename = "type")]
    join_type: JoinType,
    #[serde(flatten)]
    query: QueryDsl,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    on: Vec<JoinOnDsl>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JoinOnDsl {
    op: OpType,
    cond: CondType,
    left_field: String,
    right_field: String,
}

fn variant_to_json(v: &Variant) -> Result<Value> {
    Ok(match v {
        Variant::Null => Value::Null,
        Variant::Int(i) => Value::from(*i),
        Variant::Int64(i) => Value::from(*i),
        Variant::Double(d) => Value::from(*d),
        Variant::Bool(b) => Value::from(*b),
        Variant::String(s) => Value::from(s.as_str()),
        Variant::Uuid(u) => Value::from(u.to_string()),
        Variant::Point(p) => Value::from(vec![p.x, p.y]),
        Variant::Tuple(items) => {
            let mut arr = Vec::with_capacity(items.len());
            for item in items {
                arr.push(variant_to_json(item)?);
            }
            Value::Array(arr)
        }
        Variant::Composite(_) => {
            return Err(Error::new(
                ErrorKind::ParseDsl,
                "composite values have no DSL representation",
            ))
        }
    })
}

fn values_to_json(values: &VariantArray) -> Result<Vec<Value>> {
    values.iter().map(variant_to_json).collect()
}

fn json_to_values(values: &[Value]) -> VariantArray {
    VariantArray::from_values(values.iter().map(json_to_variant).collect())
}

fn entries_to_dsl(entries: &QueryEntries, from: usize, to: usize, out: &mut Vec<FilterDsl>) -> Result<()> {
    let nodes = entries.nodes();
    let mut i = from;
    while i < to {
        let node = &nodes[i];
        match &node.payload {
            EntryPayload::Bracket { equal_positions } => {
                let mut inner = Vec::new();
                entries_to_dsl(entries, i + 1, i + node.size, &mut inner)?;
                out.push(FilterDsl::Bracket {
                    op: node.op,
                    filters: inner,
                    equal_positions: equal_positions.clone(),
                });
            }
            EntryPayload::Condition(qe) => {
                let value = if qe.condition == CondType::DWithin {
                    // [[x, y], distance]
                    let (p, d) = match (&qe.values.values[0], &qe.values.values[1]) {
                        (Variant::Point(p), d) => (*p, variant_to_json(d)?),
                        _ => {
                            return Err(Error::new(ErrorKind::ParseDsl, "malformed DWITHIN values"))
                        }
                    };
                    vec![Value::from(vec![p.x, p.y]), d]
                } else {
                    values_to_json(&qe.values)?
                };
                out.push(FilterDsl::Condition {
                    op: node.op,
                    field: qe.field.clone(),
                    cond: qe.condition,
                    value,
                    distinct: qe.distinct,
                });
            }
            EntryPayload::BetweenFields(bf) => out.push(FilterDsl::BetweenFields {
                op: node.op,
                first_field: bf.left_field.clone(),
                cond: bf.condition,
                second_field: bf.right_field.clone(),
            }),
            EntryPayload::Join(je) => out.push(FilterDsl::Join { op: node.op, join_index: je.join_index }),
            EntryPayload::AlwaysFalse => {
                out.push(FilterDsl::AlwaysFalse { op: node.op, always_false: true })
            }
        }
        i += node.size;
    }
    Ok(())
}

fn dsl_to_entries(filters: Vec<FilterDsl>, entries: &mut QueryEntries) -> Result<()> {
    for filter in filters {
        match filter {
            FilterDsl::Bracket { op, filters, equal_positions } => {
                entries.open_bracket(op);
                *entries.current_equal_positions() = equal_positions;
                dsl_to_entries(filters, entries)?;
                entries.close_bracket()?;
            }
            FilterDsl::Condition { op, field, cond, value, distinct } => {
                if distinct {
                    entries.append(op, EntryPayload::Condition(QueryEntry::distinct_tag(field)));
                    continue;
                }
                let values = if cond == CondType::DWithin {
                    if value.len() != 2 {
                        return Err(Error::new(
                            ErrorKind::ParseDsl,
                            "DWITHIN expects [[x, y], distance]",
                        ));
                    }
                    let xy = value[0].as_array().ok_or_else(|| {
                        Error::new(ErrorKind::ParseDsl, "DWITHIN expects [[x, y], distance]")
                    })?;
                    if xy.len() != 2 {
                        return Err(Error::new(ErrorKind::ParseDsl, "DWITHIN point must be [x, y]"));
                    }
                    VariantArray::from_values(vec![
                        Variant::Point(Point::new(
                            xy[0].as_f64().unwrap_or(0.0),
                            xy[1].as_f64().unwrap_or(0.0),
                        )),
                        json_to_variant(&value[1]),
                    ])
                } else {
                    json_to_values(&value)
                };
                entries.append(op, EntryPayload::Condition(QueryEntry::new(field, cond, values)?));
            }
            FilterDsl::BetweenFields { op, first_field, cond, second_field } => {
                entries.append(
                    op,
                    EntryPayload::BetweenFields(BetweenFieldsQueryEntry::new(
                        first_field,
                        cond,
                        second_field,
                    )?),
                );
            }
            FilterDsl::Join { op, join_index } => {
                entries.append(op, EntryPayload::Join(JoinQueryEntry { join_index }));
            }
            FilterDsl::AlwaysFalse { op, .. } => entries.append(op, EntryPayload::AlwaysFalse),
        }
    }
    Ok(())
}

fn query_to_dsl(q: &Query) -> Result<QueryDsl> {
    let mut filters = Vec::new();
    entries_to_dsl(&q.entries, 0, q.entries.len(), &mut filters)?;

    let mut sort = Vec::new();
    for (idx, se) in q.sorting_entries.iter().enumerate() {
        let values = if idx == 0 {
            q.forced_sort_order.iter().map(variant_to_json).collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        sort.push(SortDsl { field: se.expression.clone(), desc: se.desc, values });
    }

    Ok(QueryDsl {
        namespace: q.namespace.clone(),
        limit: q.has_limit().then_some(q.count),
        offset: q.has_offset().then_some(q.start),
        req_total: q.calc_total,
        explain: q.explain,
        with_rank: q.with_rank,
        debug_level: q.debug_level,
        strict_mode: q.strict_mode,
        filters,
        equal_positions: q.entries.equal_positions.clone(),
        sort,
        aggregations: q
            .aggregations
            .iter()
            .map(|a| AggDsl {
                agg_type: a.agg_type,
                fields: a.fields.clone(),
                sort: a
                    .sorting
                    .iter()
                    .map(|s| SortDsl { field: s.expression.clone(), desc: s.desc, values: Vec::new() })
                    .collect(),
                limit: (a.limit != DEFAULT_LIMIT).then_some(a.limit),
                offset: (a.offset != DEFAULT_OFFSET).then_some(a.offset),
            })
            .collect(),
        select_filter: q.select_filter.clone(),
        select_functions: q.select_functions.clone(),
        update_fields: q
            .update_fields
            .iter()
            .map(|u| {
                Ok(UpdateDsl {
                    field: u.column.clone(),
                    mode: u.mode,
                    values: values_to_json(&u.values)?,
                    is_array: u.values.is_array_value(),
                    is_expression: u.is_expression,
                })
            })
            .collect::<Result<Vec<_>>>()?,
        join_queries: q.join_queries.iter().map(joined_to_dsl).collect::<Result<Vec<_>>>()?,
        merge_queries: q.merge_queries.iter().map(joined_to_dsl).collect::<Result<Vec<_>>>()?,
    })
}

fn joined_to_dsl(jq: &JoinedQuery) -> Result<JoinDsl> {
    Ok(JoinDsl {
        join_type: jq.join_type,
        query: query_to_dsl(&jq.query)?,
        on: jq
            .join_entries
            .iter()
            .map(|je| JoinOnDsl {
                op: je.op,
                cond: je.condition,
                left_field: je.left_field.clone(),
                right_field: je.right_field.clone(),
            })
            .collect(),
    })
}

fn dsl_to_query(dsl: QueryDsl) -> Result<Query> {
    let mut q = Query::new(dsl.namespace);
    q.count = dsl.limit.unwrap_or(DEFAULT_LIMIT);
    q.start = dsl.offset.unwrap_or(DEFAULT_OFFSET);
    q.calc_total = dsl.req_total;
    q.explain = dsl.explain;
    q.with_rank = dsl.with_rank;
    q.debug_level = dsl.debug_level;
    q.strict_mode = dsl.strict_mode;
    dsl_to_entries(dsl.filters, &mut q.entries)?;
    q.entries.check_balanced()?;
    q.entries.equal_positions = dsl.equal_positions;

    for (idx, s) in dsl.sort.into_iter().enumerate() {
        if !s.values.is_empty() && idx != 0 {
            return Err(Error::new(
                ErrorKind::ParseDsl,
                "forced sort order is allowed for the first sorting entry only",
            ));
        }
        q.forced_sort_order.extend(s.values.iter().map(json_to_variant));
        q.sorting_entries.push(SortingEntry { expression: s.field, desc: s.desc });
    }

    for a in dsl.aggregations {
        let mut entry = AggregateEntry::new(a.agg_type, a.fields);
        entry.sorting = a
            .sort
            .into_iter()
            .map(|s| SortingEntry { expression: s.field, desc: s.desc })
            .collect();
        entry.limit = a.limit.unwrap_or(DEFAULT_LIMIT);
        entry.offset = a.offset.unwrap_or(DEFAULT_OFFSET);
        q.aggregations.push(entry);
    }

    q.select_filter = dsl.select_filter;
    q.select_functions = dsl.select_functions;

    for u in dsl.update_fields {
        let values = json_to_values(&u.values).mark_array(u.is_array);
        q.update_fields.push(UpdateEntry::new(u.field, values, u.mode, u.is_expression)?);
    }

    for j in dsl.join_queries {
        q.join_queries.push(dsl_to_joined(j)?);
    }
    for m in dsl.merge_queries {
        q.merge_queries.push(dsl_to_joined(m)?);
    }
    Ok(q)
}

fn dsl_to_joined(j: JoinDsl) -> Result<JoinedQuery> {
    let mut jq = JoinedQuery::new(j.join_type, dsl_to_query(j.query)?);
    jq.join_entries = j
        .on
        .into_iter()
        .map(|o| QueryJoinEntry {
            op: o.op,
            condition: o.cond,
            left_field: o.left_field,
            right_field: o.right_field,
        })
        .collect();
    Ok(jq)
}

/// Render the query as its JSON DSL.
pub fn to_dsl(q: &Query) -> Result<String> {
    let dsl = query_to_dsl(q)?;
    serde_json::to_string(&dsl).map_err(|e| Error::new(ErrorKind::ParseDsl, e.to_string()))
}

/// Parse a JSON DSL document into a query.
pub fn from_dsl(input: &str) -> Result<Query> {
    let dsl: QueryDsl =
        serde_json::from_str(input).map_err(|e| Error::new(ErrorKind::ParseDsl, e.to_string()))?;
    dsl_to_query(dsl)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dsl_round_trip() {
        let q = Query::new("ns")
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
            .offset(5)
            .aggregate(AggType::Sum, vec!["score".into()], vec![], DEFAULT_LIMIT, DEFAULT_OFFSET)
            .unwrap();
        let text = to_dsl(&q).unwrap();
        let decoded = from_dsl(&text).unwrap();
        assert_eq!(decoded, q);
    }

    #[test]
    fn dsl_round_trip_with_joins_and_updates() {
        let q = Query::new("users")
            .inner_join("id", "user_id", CondType::Eq, Query::new("orders"))
            .merge(Query::new("users_archive"))
            .set("age", VariantArray::single(Variant::Int(30)), false)
            .unwrap();
        let text = to_dsl(&q).unwrap();
        assert_eq!(from_dsl(&text).unwrap(), q);
    }

    #[test]
    fn dwithin_in_dsl() {
        let q = Query::new("places").dwithin("location", Point::new(1.0, 2.0), 3.5).unwrap();
        let text = to_dsl(&q).unwrap();
        assert_eq!(from_dsl(&text).unwrap(), q);
    }

    #[test]
    fn malformed_dsl_is_parse_dsl_error() {
        let err = from_dsl("{not json").unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseDsl);
        let err = from_dsl(r#"{"namespace": "ns", "filters": [{"op": "AND", "field": "a", "cond": "DWITHIN", "value": [1]}]}"#)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseDsl);
    }
}
