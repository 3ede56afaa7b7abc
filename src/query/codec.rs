use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::{Point, Variant, VariantArray};
use crate::query::entries::{
    BetweenFieldsQueryEntry, EntryPayload, JoinQueryEntry, QueryEntry,
};
use crate::query::query::{
    AggregateEntry, JoinedQuery, Query, QueryJoinEntry, SortingEntry, UpdateEntry,
};
use crate::query::types::{
    tag, AggType, CalcTotalMode, CondType, FieldModifyMode, JoinType, OpType, StrictMode,
    DEFAULT_LIMIT, DEFAULT_OFFSET,
};
use crate::wire::serializer::{Serializer, WrSerializer};

pub const NORMAL: u8 = 0;
pub const WITH_JOIN_ENTRIES: u8 = 1;
pub const SKIP_JOIN_QUERIES: u8 = 2;
pub const SKIP_MERGE_QUERIES: u8 = 4;
pub const SKIP_LIMIT_OFFSET: u8 = 8;

/// Serialize a query (and, by default, its join/merge subqueries) into
/// the tagged binary wire.
pub fn serialize(q: &Query, ser: &mut WrSerializer, mode: u8) {
    serialize_single(q, &[], ser, mode);

    if mode & SKIP_JOIN_QUERIES == 0 {
        for jq in &q.join_queries {
            ser.put_varuint(jq.join_type as u64);
            serialize_single(&jq.query, &jq.join_entries, ser, WITH_JOIN_ENTRIES);
        }
    }

    if mode & SKIP_MERGE_QUERIES == 0 {
        for mq in &q.merge_queries {
            ser.put_varuint(mq.join_type as u64);
            serialize_single(&mq.query, &mq.join_entries, ser, mode | WITH_JOIN_ENTRIES);
            for jq in &mq.query.join_queries {
                ser.put_varuint(jq.join_type as u64);
                serialize_single(&jq.query, &jq.join_entries, ser, WITH_JOIN_ENTRIES);
            }
        }
    }
}

fn serialize_single(q: &Query, join_entries: &[QueryJoinEntry], ser: &mut WrSerializer, mode: u8) {
    ser.put_vstring(&q.namespace);
    q.entries.serialize(ser);

    for agg in &q.aggregations {
        ser.put_varuint(tag::AGGREGATION);
        ser.put_varuint(agg.agg_type as u64);
        ser.put_varuint(agg.fields.len() as u64);
        for field in &agg.fields {
            ser.put_vstring(field);
        }
        for se in &agg.sorting {
            ser.put_varuint(tag::AGGREGATION_SORT);
            ser.put_vstring(&se.expression);
            ser.put_varuint(se.desc as u64);
        }
        // defaults are omitted on encode
        if agg.limit != DEFAULT_LIMIT {
            ser.put_varuint(tag::AGGREGATION_LIMIT);
            ser.put_varuint(agg.limit as u64);
        }
        if agg.offset != DEFAULT_OFFSET {
            ser.put_varuint(tag::AGGREGATION_OFFSET);
            ser.put_varuint(agg.offset as u64);
        }
    }

    for (idx, se) in q.sorting_entries.iter().enumerate() {
        ser.put_varuint(tag::SORT_INDEX);
        ser.put_vstring(&se.expression);
        ser.put_varuint(se.desc as u64);
        // forced keys belong to the first entry only
        let forced: &[Variant] = if idx == 0 { &q.forced_sort_order } else { &[] };
        ser.put_varuint(forced.len() as u64);
        for v in forced {
            ser.put_variant(v);
        }
    }

    if mode & WITH_JOIN_ENTRIES != 0 {
        for je in join_entries {
            ser.put_varuint(tag::JOIN_ON);
            ser.put_varuint(je.op as u64);
            ser.put_varuint(je.condition as u64);
            ser.put_vstring(&je.left_field);
            ser.put_vstring(&je.right_field);
        }
    }

    for group in &q.entries.equal_positions {
        put_equal_position(ser, 0, group);
    }
    for (wire_pos, groups) in q.entries.bracket_equal_positions() {
        for group in groups {
            put_equal_position(ser, wire_pos as u64, group);
        }
    }

    ser.put_varuint(tag::DEBUG_LEVEL);
    ser.put_varuint(q.debug_level as u64);

    if q.strict_mode != StrictMode::NotSet {
        ser.put_varuint(tag::STRICT_MODE);
        ser.put_varuint(q.strict_mode as u64);
    }

    if mode & SKIP_LIMIT_OFFSET == 0 {
        if q.has_limit() {
            ser.put_varuint(tag::LIMIT);
            ser.put_varuint(q.count as u64);
        }
        if q.has_offset() {
            ser.put_varuint(tag::OFFSET);
            ser.put_varuint(q.start as u64);
        }
    }

    if q.calc_total != CalcTotalMode::NoTotal {
        ser.put_varuint(tag::REQ_TOTAL);
        ser.put_varuint(q.calc_total as u64);
    }

    for sf in &q.select_filter {
        ser.put_varuint(tag::SELECT_FILTER);
        ser.put_vstring(sf);
    }

    if q.explain {
        ser.put_varuint(tag::EXPLAIN);
    }

    if q.with_rank {
        ser.put_varuint(tag::WITH_RANK);
    }

    for func in &q.select_functions {
        ser.put_varuint(tag::SELECT_FUNCTION);
        ser.put_vstring(func);
    }

    for field in &q.update_fields {
        match field.mode {
            FieldModifyMode::Set => {
                ser.put_varuint(tag::UPDATE_FIELD_V2);
                ser.put_vstring(&field.column);
                ser.put_varuint(field.values.is_array_value() as u64);
                ser.put_varuint(field.values.len() as u64);
                for v in &field.values {
                    ser.put_varuint(field.is_expression as u64);
                    ser.put_variant(v);
                }
            }
            FieldModifyMode::Drop => {
                ser.put_varuint(tag::DROP_FIELD);
                ser.put_vstring(&field.column);
            }
            FieldModifyMode::SetJson => {
                ser.put_varuint(tag::UPDATE_OBJECT);
                ser.put_vstring(&field.column);
                ser.put_varuint(field.values.len() as u64);
                ser.put_varuint(field.values.is_array_value() as u64);
                for v in &field.values {
                    ser.put_varuint(field.is_expression as u64);
                    ser.put_variant(v);
                }
            }
        }
    }

    ser.put_varuint(tag::END);
}

fn put_equal_position(ser: &mut WrSerializer, wire_pos: u64, group: &[String]) {
    ser.put_varuint(tag::EQUAL_POSITION);
    ser.put_varuint(wire_pos);
    ser.put_varuint(group.len() as u64);
    for field in group {
        ser.put_vstring(field);
    }
}

/// Decode a root query and any trailing join/merge subqueries.
pub fn deserialize(rd: &mut Serializer) -> Result<Query> {
    let mut q = Query::new(rd.get_vstring()?.to_string());
    let mut dummy_join_entries = Vec::new();
    let mut has_join_conditions = deserialize_body(&mut q, rd, &mut dummy_join_entries)?;

    let mut nested = false;
    while !rd.eof() {
        let join_type = JoinType::from_u64(rd.get_varuint()?)?;
        let mut sub = Query::new(rd.get_vstring()?.to_string());
        let mut join_entries = Vec::new();
        has_join_conditions |= deserialize_body(&mut sub, rd, &mut join_entries)?;
        sub.debug_level = q.debug_level;
        sub.strict_mode = q.strict_mode;
        let mut jq = JoinedQuery::new(join_type, sub);
        jq.join_entries = join_entries;
        if join_type == JoinType::Merge {
            q.merge_queries.push(jq);
            nested = true;
        } else {
            let target = if nested {
                &mut q.merge_queries.last_mut().unwrap().query
            } else {
                &mut q
            };
            if join_type != JoinType::LeftJoin && !has_join_conditions {
                let join_index = target.join_queries.len();
                let op = if join_type == JoinType::OrInnerJoin { OpType::Or } else { OpType::And };
                target.entries.append(op, EntryPayload::Join(JoinQueryEntry { join_index }));
            }
            target.join_queries.push(jq);
        }
    }
    Ok(q)
}

/// Reads tagged records up to `End`. Returns whether explicit join
/// conditions were present in the body.
fn deserialize_body(
    q: &mut Query,
    rd: &mut Serializer,
    join_entries: &mut Vec<QueryJoinEntry>,
) -> Result<bool> {
    let mut has_join_conditions = false;
    let mut equal_positions: Vec<(usize, Vec<String>)> = Vec::new();
    loop {
        if rd.eof() {
            break;
        }
        let rtag = rd.get_varuint()?;
        match rtag {
            tag::CONDITION => {
                let field = rd.get_vstring()?.to_string();
                let op = OpType::from_u64(rd.get_varuint()?)?;
                let condition = CondType::from_u64(rd.get_varuint()?)?;
                let cnt = rd.get_varuint()? as usize;
                let values = if condition == CondType::DWithin {
                    if cnt != 3 {
                        return Err(Error::new(
                            ErrorKind::ParseBin,
                            "expected point and distance for DWithin",
                        ));
                    }
                    let x = rd.get_variant()?.ensure_hold().as_double()?;
                    let y = rd.get_variant()?.ensure_hold().as_double()?;
                    let dist = rd.get_variant()?.ensure_hold();
                    VariantArray::from_values(vec![Variant::Point(Point::new(x, y)), dist])
                } else {
                    rd.get_variant_array(cnt)?
                };
                q.entries
                    .append(op, EntryPayload::Condition(QueryEntry::new(field, condition, values)?));
            }
            tag::BETWEEN_FIELDS_CONDITION => {
                let op = OpType::from_u64(rd.get_varuint()?)?;
                let left = rd.get_vstring()?.to_string();
                let condition = CondType::from_u64(rd.get_varuint()?)?;
                let right = rd.get_vstring()?.to_string();
                q.entries.append(
                    op,
                    EntryPayload::BetweenFields(BetweenFieldsQueryEntry::new(left, condition, right)?),
                );
            }
            tag::ALWAYS_FALSE_CONDITION => {
                let op = OpType::from_u64(rd.get_varuint()?)?;
                q.entries.append(op, EntryPayload::AlwaysFalse);
            }
            tag::JOIN_CONDITION => {
                let jt = JoinType::from_u64(rd.get_varuint()?)?;
                let join_index = rd.get_varuint()? as usize;
                has_join_conditions = true;
                let op = if jt == JoinType::OrInnerJoin { OpType::Or } else { OpType::And };
                q.entries.append(op, EntryPayload::Join(JoinQueryEntry { join_index }));
            }
            tag::AGGREGATION => {
                let agg_type = AggType::from_u64(rd.get_varuint()?)?;
                let fields_count = rd.get_varuint()? as usize;
                let mut fields = Vec::with_capacity(fields_count);
                for _ in 0..fields_count {
                    fields.push(rd.get_vstring()?.to_string());
                }
                let mut entry = AggregateEntry::new(agg_type, fields);
                // inner records belong to the aggregation until an unknown
                // tag stops the loop; the reader then rewinds one record
                let mut pos = rd.pos();
                while !rd.eof() {
                    let atag = rd.get_varuint()?;
                    match atag {
                        tag::AGGREGATION_SORT => {
                            let expression = rd.get_vstring()?.to_string();
                            let desc = rd.get_varuint()? != 0;
                            entry.sorting.push(SortingEntry { expression, desc });
                        }
                        tag::AGGREGATION_LIMIT => entry.limit = rd.get_varuint()? as u32,
                        tag::AGGREGATION_OFFSET => entry.offset = rd.get_varuint()? as u32,
                        _ => {
                            rd.set_pos(pos);
                            break;
                        }
                    }
                    pos = rd.pos();
                }
                q.aggregations.push(entry);
            }
            tag::DISTINCT => {
                let field = rd.get_vstring()?.to_string();
                if !field.is_empty() {
                    q.entries
                        .append(OpType::And, EntryPayload::Condition(QueryEntry::distinct_tag(field)));
                }
            }
            tag::SORT_INDEX => {
                let expression = rd.get_vstring()?.to_string();
                let desc = rd.get_varuint()? != 0;
                if !expression.is_empty() {
                    q.sorting_entries.push(SortingEntry { expression, desc });
                }
                let cnt = rd.get_varuint()? as usize;
                if cnt != 0 && q.sorting_entries.len() != 1 {
                    return Err(Error::new(
                        ErrorKind::Params,
                        "forced sort order is allowed for the first sorting entry only",
                    ));
                }
                for _ in 0..cnt {
                    q.forced_sort_order.push(rd.get_variant()?.ensure_hold());
                }
            }
            tag::JOIN_ON => {
                let op = OpType::from_u64(rd.get_varuint()?)?;
                let condition = CondType::from_u64(rd.get_varuint()?)?;
                let left_field = rd.get_vstring()?.to_string();
                let right_field = rd.get_vstring()?.to_string();
                join_entries.push(QueryJoinEntry { op, condition, left_field, right_field });
            }
            tag::DEBUG_LEVEL => q.debug_level = rd.get_varuint()? as i32,
            tag::STRICT_MODE => q.strict_mode = StrictMode::from_u64(rd.get_varuint()?)?,
            tag::LIMIT => q.count = rd.get_varuint()? as u32,
            tag::OFFSET => q.start = rd.get_varuint()? as u32,
            tag::REQ_TOTAL => q.calc_total = CalcTotalMode::from_u64(rd.get_varuint()?)?,
            tag::SELECT_FILTER => q.select_filter.push(rd.get_vstring()?.to_string()),
            tag::EQUAL_POSITION => {
                let bracket_pos = rd.get_varuint()? as usize;
                let fields_count = rd.get_varuint()? as usize;
                let mut fields = Vec::with_capacity(fields_count);
                for _ in 0..fields_count {
                    fields.push(rd.get_vstring()?.to_string());
                }
                equal_positions.push((bracket_pos, fields));
            }
            tag::EXPLAIN => q.explain = true,
            tag::WITH_RANK => q.with_rank = true,
            tag::SELECT_FUNCTION => q.select_functions.push(rd.get_vstring()?.to_string()),
            tag::DROP_FIELD => {
                let column = rd.get_vstring()?.to_string();
                q.update_fields.push(UpdateEntry::new(
                    column,
                    VariantArray::new(),
                    FieldModifyMode::Drop,
                    false,
                )?);
            }
            tag::UPDATE_FIELD_V2 => {
                let column = rd.get_vstring()?.to_string();
                let is_array = rd.get_varuint()? != 0;
                let num_values = rd.get_varuint()? as usize;
                let (values, is_expression) = read_update_values(rd, num_values)?;
                q.update_fields.push(UpdateEntry::new(
                    column,
                    values.mark_array(is_array),
                    FieldModifyMode::Set,
                    is_expression,
                )?);
            }
            tag::UPDATE_FIELD => {
                // legacy record: array-ness inferred from the value count
                let column = rd.get_vstring()?.to_string();
                let num_values = rd.get_varuint()? as usize;
                let is_array = num_values > 1;
                let (values, is_expression) = read_update_values(rd, num_values)?;
                q.update_fields.push(UpdateEntry::new(
                    column,
                    values.mark_array(is_array),
                    FieldModifyMode::Set,
                    is_expression,
                )?);
            }
            tag::UPDATE_OBJECT => {
                let column = rd.get_vstring()?.to_string();
                let num_values = rd.get_varuint()? as usize;
                let is_array = rd.get_varuint()? == 1;
                let (values, is_expression) = read_update_values(rd, num_values)?;
                q.update_fields.push(UpdateEntry::new(
                    column,
                    values.mark_array(is_array),
                    FieldModifyMode::SetJson,
                    is_expression,
                )?);
            }
            tag::OPEN_BRACKET => {
                let op = OpType::from_u64(rd.get_varuint()?)?;
                q.entries.open_bracket(op);
            }
            tag::CLOSE_BRACKET => q.entries.close_bracket()?,
            tag::END => break,
            other => {
                return Err(Error::new(
                    ErrorKind::ParseBin,
                    format!("unknown type {} while parsing binary buffer", other),
                ))
            }
        }
    }
    q.entries.check_balanced()?;
    for (bracket_pos, fields) in equal_positions {
        q.entries.equal_positions_of_bracket(bracket_pos)?.push(fields);
    }
    Ok(has_join_conditions)
}

fn read_update_values(rd: &mut Serializer, num_values: usize) -> Result<(VariantArray, bool)> {
    let mut values = VariantArray::new();
    let mut is_expression = false;
    for _ in 0..num_values {
        is_expression = rd.get_varuint()? != 0;
        values.push(rd.get_variant()?.ensure_hold());
    }
    Ok((values, is_expression))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(q: &Query) -> Query {
        let mut ser = WrSerializer::new();
        serialize(q, &mut ser, NORMAL);
        let mut rd = Serializer::new(ser.slice());
        let decoded = deserialize(&mut rd).unwrap();
        assert!(rd.eof());
        decoded
    }

    #[test]
    fn spec_query_round_trips() {
        // select * from ns where age > 18 and (city='Kyiv' or city='Lviv')
        // order by name desc limit 10 offset 5 aggregate sum(score)
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
        assert_eq!(round_trip(&q), q);
    }

    #[test]
    fn joins_and_merges_round_trip() {
        let orders = Query::new("orders")
            .where_cond("total", CondType::Ge, VariantArray::single(Variant::Double(100.0)))
            .unwrap();
        let archive = Query::new("orders_archive")
            .where_cond("year", CondType::Eq, VariantArray::single(Variant::Int(2020)))
            .unwrap();
        let q = Query::new("users")
            .inner_join("id", "user_id", CondType::Eq, orders)
            .left_join("id", "user_id", CondType::Set, Query::new("profiles"))
            .merge(archive);
        assert_eq!(round_trip(&q), q);
    }

    #[test]
    fn update_fields_round_trip() {
        let q = Query::new("items")
            .set("price", VariantArray::single(Variant::Double(9.99)), false)
            .unwrap()
            .set(
                "tags",
                VariantArray::from_values(vec![Variant::str("a"), Variant::str("b")]).mark_array(true),
                false,
            )
            .unwrap()
            .set_object("nested", VariantArray::single(Variant::str("{\"a\":1}")), false)
            .unwrap()
            .drop_field("stale")
            .unwrap();
        assert_eq!(round_trip(&q), q);
    }

    #[test]
    fn single_element_array_marker_survives() {
        let q = Query::new("items")
            .set("tags", VariantArray::single(Variant::str("a")).mark_array(true), false)
            .unwrap();
        let decoded = round_trip(&q);
        assert!(decoded.update_fields[0].values.is_array_value());
    }

    #[test]
    fn dwithin_and_equal_positions_round_trip() {
        let q = Query::new("places")
            .dwithin("location", Point::new(55.7, 37.6), 10.0)
            .unwrap()
            .open_bracket()
            .where_cond("sizes", CondType::Gt, VariantArray::single(Variant::Int(3)))
            .unwrap()
            .where_cond("prices", CondType::Lt, VariantArray::single(Variant::Int(100)))
            .unwrap()
            .add_equal_position(vec!["sizes".into(), "prices".into()])
            .close_bracket()
            .unwrap();
        assert_eq!(round_trip(&q), q);
    }

    #[test]
    fn forced_sort_order_round_trips_relaxed() {
        let q = Query::new("items")
            .sort_forced("status", false, vec![Variant::str("gold"), Variant::str("silver")])
            .unwrap();
        assert_eq!(round_trip(&q), q);
    }

    #[test]
    fn bad_wire_is_rejected() {
        // unknown record tag
        let mut ser = WrSerializer::new();
        ser.put_vstring("ns");
        ser.put_varuint(99);
        let err = deserialize(&mut Serializer::new(ser.slice())).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParseBin);

        // dangling close bracket
        let mut ser = WrSerializer::new();
        ser.put_vstring("ns");
        ser.put_varuint(tag::CLOSE_BRACKET);
        assert!(deserialize(&mut Serializer::new(ser.slice())).is_err());

        // missing close bracket
        let mut ser = WrSerializer::new();
        ser.put_vstring("ns");
        ser.put_varuint(tag::OPEN_BRACKET);
        ser.put_varuint(OpType::And as u64);
        ser.put_varuint(tag::END);
        assert!(deserialize(&mut Serializer::new(ser.slice())).is_err());

        // DWithin with the wrong variant count
        let mut ser = WrSerializer::new();
        ser.put_vstring("ns");
        ser.put_varuint(tag::CONDITION);
        ser.put_vstring("loc");
        ser.put_varuint(OpType::And as u64);
        ser.put_varuint(CondType::DWithin as u64);
        ser.put_varuint(2);
        ser.put_variant(&Variant::Double(1.0));
        ser.put_variant(&Variant::Double(2.0));
        assert!(deserialize(&mut Serializer::new(ser.slice())).is_err());
    }

    #[test]
    fn legacy_update_field_infers_array_from_count() {
        let mut ser = WrSerializer::new();
        ser.put_vstring("ns");
        ser.put_varuint(tag::UPDATE_FIELD);
        ser.put_vstring("tags");
        ser.put_varuint(2);
        ser.put_varuint(0);
        ser.put_variant(&Variant::str("a"));
        ser.put_varuint(0);
        ser.put_variant(&Variant::str("b"));
        ser.put_varuint(tag::END);
        let q = deserialize(&mut Serializer::new(ser.slice())).unwrap();
        assert!(q.update_fields[0].values.is_array_value());
    }
}
