use regex::Regex;

use crate::cjson::TagsMatcher;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::{Variant, VariantArray};
use crate::payload::payload::Payload;
use crate::query::types::{tag, CondType, OpType};
use crate::wire::serializer::WrSerializer;

/// Filter on one field against a set of values.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryEntry {
    pub field: String,
    pub condition: CondType,
    pub values: VariantArray,
    pub distinct: bool,
}

impl QueryEntry {
    pub fn new(field: impl Into<String>, condition: CondType, values: VariantArray) -> Result<Self> {
        let entry = QueryEntry { field: field.into(), condition, values, distinct: false };
        entry.verify()?;
        Ok(entry)
    }

    /// Distinct marker entry: `Any` condition without values.
    pub fn distinct_tag(field: impl Into<String>) -> Self {
        QueryEntry {
            field: field.into(),
            condition: CondType::Any,
            values: VariantArray::new(),
            distinct: true,
        }
    }

    pub fn verify(&self) -> Result<()> {
        let n = self.values.len();
        let fail = |what: &str| {
            Err(Error::new(
                ErrorKind::Logic,
                format!("condition {} for field '{}' {}", self.condition.name(), self.field, what),
            ))
        };
        match self.condition {
            CondType::Any | CondType::Empty => {
                if n != 0 {
                    return fail("expects no values");
                }
            }
            CondType::Eq | CondType::Set | CondType::AllSet => {}
            CondType::Lt | CondType::Le | CondType::Gt | CondType::Ge | CondType::Like => {
                if n != 1 {
                    return fail("expects exactly one value");
                }
            }
            CondType::Range => {
                if n != 2 {
                    return fail("expects two values");
                }
            }
            CondType::DWithin => {
                if n != 2
                    || !matches!(self.values.values[0], Variant::Point(_))
                    || self.values.values[1].as_double().is_err()
                {
                    return fail("expects a point and a distance");
                }
            }
        }
        Ok(())
    }

    fn field_values(&self, pl: &Payload, tm: &TagsMatcher) -> Result<VariantArray> {
        match pl.payload_type().field_by_name(&self.field) {
            Some(idx) => pl.get(idx),
            None => pl.get_by_json_path(&self.field, tm),
        }
    }

    pub fn check(&self, pl: &Payload, tm: &TagsMatcher) -> Result<bool> {
        let lhs = self.field_values(pl, tm)?;
        check_condition(&lhs, self.condition, &self.values)
    }
}

/// Filter comparing two fields of the same item.
#[derive(Debug, Clone, PartialEq)]
pub struct BetweenFieldsQueryEntry {
    pub left_field: String,
    pub condition: CondType,
    pub right_field: String,
}

impl BetweenFieldsQueryEntry {
    pub fn new(left: impl Into<String>, condition: CondType, right: impl Into<String>) -> Result<Self> {
        if matches!(condition, CondType::Any | CondType::Empty | CondType::DWithin) {
            return Err(Error::new(
                ErrorKind::Logic,
                format!("condition '{}' is inapplicable between two fields", condition.name()),
            ));
        }
        Ok(BetweenFieldsQueryEntry {
            left_field: left.into(),
            condition,
            right_field: right.into(),
        })
    }

    pub fn check(&self, pl: &Payload, tm: &TagsMatcher) -> Result<bool> {
        let lhs = field_values(pl, tm, &self.left_field)?;
        let rhs = field_values(pl, tm, &self.right_field)?;
        check_condition(&lhs, self.condition, &rhs)
    }
}

fn field_values(pl: &Payload, tm: &TagsMatcher, field: &str) -> Result<VariantArray> {
    match pl.payload_type().field_by_name(field) {
        Some(idx) => pl.get(idx),
        None => pl.get_by_json_path(field, tm),
    }
}

/// Back-reference to a sibling join query by index into the parent
/// query's join list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinQueryEntry {
    pub join_index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryPayload {
    /// Internal node; children are the following `size - 1` nodes.
    Bracket { equal_positions: Vec<Vec<String>> },
    Condition(QueryEntry),
    BetweenFields(BetweenFieldsQueryEntry),
    Join(JoinQueryEntry),
    AlwaysFalse,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub op: OpType,
    /// Subtree size including this node; 1 for leaves.
    pub size: usize,
    pub payload: EntryPayload,
}

/// The WHERE tree, stored flat: brackets carry their subtree size, so
/// children are inline right after their bracket node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryEntries {
    nodes: Vec<Node>,
    /// Equal-position groups of the root level.
    pub equal_positions: Vec<Vec<String>>,
    #[doc(hidden)]
    open_brackets: Vec<usize>,
}

impl QueryEntries {
    pub fn new() -> Self {
        QueryEntries::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn append(&mut self, op: OpType, payload: EntryPayload) {
        debug_assert!(!matches!(payload, EntryPayload::Bracket { .. }));
        self.push_node(Node { op, size: 1, payload });
    }

    pub fn open_bracket(&mut self, op: OpType) {
        let idx = self.nodes.len();
        self.push_node(Node { op, size: 1, payload: EntryPayload::Bracket { equal_positions: Vec::new() } });
        self.open_brackets.push(idx);
    }

    pub fn close_bracket(&mut self) -> Result<()> {
        self.open_brackets
            .pop()
            .map(|_| ())
            .ok_or_else(|| Error::new(ErrorKind::ParseBin, "unexpected close bracket"))
    }

    fn push_node(&mut self, node: Node) {
        for &idx in &self.open_brackets {
            self.nodes[idx].size += 1;
        }
        self.nodes.push(node);
    }

    pub fn check_balanced(&self) -> Result<()> {
        if !self.open_brackets.is_empty() {
            return Err(Error::new(
                ErrorKind::ParseBin,
                format!("{} bracket(s) left open", self.open_brackets.len()),
            ));
        }
        Ok(())
    }

    /// Equal-position list of the innermost currently open bracket, or of
    /// the root when no bracket is open.
    pub fn current_equal_positions(&mut self) -> &mut Vec<Vec<String>> {
        match self.open_brackets.last().copied() {
            Some(idx) => match &mut self.nodes[idx].payload {
                EntryPayload::Bracket { equal_positions } => equal_positions,
                _ => unreachable!("open bracket stack points to a non-bracket node"),
            },
            None => &mut self.equal_positions,
        }
    }

    pub fn brackets_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(n.payload, EntryPayload::Bracket { .. }))
            .count()
    }

    /// Equal positions addressed the way the wire does: 0 is the root,
    /// any other value is a flat node position + 1 and must point at a
    /// bracket node.
    pub fn equal_positions_of_bracket(&mut self, wire_pos: usize) -> Result<&mut Vec<Vec<String>>> {
        if wire_pos == 0 {
            return Ok(&mut self.equal_positions);
        }
        match self.nodes.get_mut(wire_pos - 1).map(|n| &mut n.payload) {
            Some(EntryPayload::Bracket { equal_positions }) => Ok(equal_positions),
            _ => Err(Error::new(
                ErrorKind::ParseBin,
                format!("equal position refers to missing bracket at {}", wire_pos),
            )),
        }
    }

    /// (wire position, group) pairs for every bracket carrying groups.
    pub fn bracket_equal_positions(&self) -> impl Iterator<Item = (usize, &Vec<Vec<String>>)> {
        self.nodes.iter().enumerate().filter_map(|(i, n)| match &n.payload {
            EntryPayload::Bracket { equal_positions } if !equal_positions.is_empty() => {
                Some((i + 1, equal_positions))
            }
            _ => None,
        })
    }

    /// Emits the tree as tagged wire records (without the closing `End`).
    pub fn serialize(&self, ser: &mut WrSerializer) {
        self.serialize_range(0, self.nodes.len(), ser);
    }

    fn serialize_range(&self, from: usize, to: usize, ser: &mut WrSerializer) {
        let mut i = from;
        while i < to {
            let node = &self.nodes[i];
            match &node.payload {
                EntryPayload::Bracket { .. } => {
                    ser.put_varuint(tag::OPEN_BRACKET);
                    ser.put_varuint(node.op as u64);
                    self.serialize_range(i + 1, i + node.size, ser);
                    ser.put_varuint(tag::CLOSE_BRACKET);
                }
                EntryPayload::Condition(qe) => {
                    if qe.distinct {
                        ser.put_varuint(tag::DISTINCT);
                        ser.put_vstring(&qe.field);
                    } else {
                        ser.put_varuint(tag::CONDITION);
                        ser.put_vstring(&qe.field);
                        ser.put_varuint(node.op as u64);
                        ser.put_varuint(qe.condition as u64);
                        if qe.condition == CondType::DWithin {
                            // point + distance travel as three variants
                            ser.put_varuint(3);
                            match &qe.values.values[0] {
                                Variant::Point(p) => {
                                    ser.put_variant(&Variant::Double(p.x));
                                    ser.put_variant(&Variant::Double(p.y));
                                }
                                other => {
                                    // verified at construction; keep the wire total
                                    ser.put_variant(other);
                                    ser.put_variant(&Variant::Double(0.0));
                                }
                            }
                            ser.put_variant(&qe.values.values[1]);
                        } else {
                            ser.put_varuint(qe.values.len() as u64);
                            for v in &qe.values {
                                ser.put_variant(v);
                            }
                        }
                    }
                }
                EntryPayload::BetweenFields(bf) => {
                    ser.put_varuint(tag::BETWEEN_FIELDS_CONDITION);
                    ser.put_varuint(node.op as u64);
                    ser.put_vstring(&bf.left_field);
                    ser.put_varuint(bf.condition as u64);
                    ser.put_vstring(&bf.right_field);
                }
                EntryPayload::Join(je) => {
                    let join_type = if node.op == OpType::Or { 2u64 } else { 1u64 };
                    ser.put_varuint(tag::JOIN_CONDITION);
                    ser.put_varuint(join_type);
                    ser.put_varuint(je.join_index as u64);
                }
                EntryPayload::AlwaysFalse => {
                    ser.put_varuint(tag::ALWAYS_FALSE_CONDITION);
                    ser.put_varuint(node.op as u64);
                }
            }
            i += node.size;
        }
    }

    /// Evaluates the tree against a single item. Join entries can not be
    /// checked here; their execution is the caller's concern.
    pub fn check_if_satisfy(&self, pl: &Payload, tm: &TagsMatcher) -> Result<bool> {
        self.check_range(0, self.nodes.len(), pl, tm)
    }

    fn check_range(&self, from: usize, to: usize, pl: &Payload, tm: &TagsMatcher) -> Result<bool> {
        let mut result = true;
        let mut i = from;
        while i < to {
            let node = &self.nodes[i];
            let value = match &node.payload {
                EntryPayload::Bracket { .. } => self.check_range(i + 1, i + node.size, pl, tm)?,
                EntryPayload::Condition(qe) => {
                    if qe.distinct {
                        true
                    } else {
                        qe.check(pl, tm)?
                    }
                }
                EntryPayload::BetweenFields(bf) => bf.check(pl, tm)?,
                EntryPayload::Join(_) => {
                    return Err(Error::new(
                        ErrorKind::Logic,
                        "join condition can not be checked against a single item",
                    ))
                }
                EntryPayload::AlwaysFalse => false,
            };
            result = if i == from {
                match node.op {
                    OpType::Not => !value,
                    _ => value,
                }
            } else {
                match node.op {
                    OpType::And => result && value,
                    OpType::Or => result || value,
                    OpType::Not => result && !value,
                }
            };
            i += node.size;
        }
        Ok(result)
    }
}

pub fn check_condition(lhs: &VariantArray, cond: CondType, rhs: &VariantArray) -> Result<bool> {
    use std::cmp::Ordering;
    let cmp_first = |ord_ok: fn(Ordering) -> bool| -> bool {
        lhs.iter().any(|l| {
            rhs.values
                .first()
                .and_then(|r| l.compare(r))
                .map(ord_ok)
                .unwrap_or(false)
        })
    };
    Ok(match cond {
        CondType::Any => !lhs.is_empty(),
        CondType::Empty => lhs.is_empty(),
        CondType::Eq | CondType::Set => lhs
            .iter()
            .any(|l| rhs.iter().any(|r| l.compare(r) == Some(Ordering::Equal))),
        CondType::AllSet => {
            !rhs.is_empty()
                && rhs
                    .iter()
                    .all(|r| lhs.iter().any(|l| l.compare(r) == Some(Ordering::Equal)))
        }
        CondType::Lt => cmp_first(|o| o == Ordering::Less),
        CondType::Le => cmp_first(|o| o != Ordering::Greater),
        CondType::Gt => cmp_first(|o| o == Ordering::Greater),
        CondType::Ge => cmp_first(|o| o != Ordering::Less),
        CondType::Range => {
            if rhs.len() != 2 {
                return Err(Error::new(ErrorKind::Logic, "RANGE expects two bounds"));
            }
            lhs.iter().any(|l| {
                l.compare(&rhs.values[0]).map(|o| o != Ordering::Less).unwrap_or(false)
                    && l.compare(&rhs.values[1]).map(|o| o != Ordering::Greater).unwrap_or(false)
            })
        }
        CondType::Like => {
            let pattern = rhs
                .values
                .first()
                .and_then(Variant::as_str)
                .ok_or_else(|| Error::new(ErrorKind::Logic, "LIKE expects a string pattern"))?;
            let re = like_to_regex(pattern)?;
            lhs.iter().any(|l| l.as_str().map(|s| re.is_match(s)).unwrap_or(false))
        }
        CondType::DWithin => {
            let (center, dist) = match (&rhs.values[0], rhs.values[1].as_double()) {
                (Variant::Point(p), Ok(d)) => (*p, d),
                _ => return Err(Error::new(ErrorKind::Logic, "DWITHIN expects a point and a distance")),
            };
            lhs.iter().any(|l| match l {
                Variant::Point(p) => p.distance(&center) <= dist,
                _ => false,
            })
        }
    })
}

/// SQL LIKE pattern to an anchored regex: `%` matches any run, `_` one
/// character; everything else is literal.
fn like_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::new(ErrorKind::Logic, format!("bad LIKE pattern: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::variant::Point;

    fn eq_entry(field: &str, v: Variant) -> EntryPayload {
        EntryPayload::Condition(QueryEntry::new(field, CondType::Eq, VariantArray::single(v)).unwrap())
    }

    #[test]
    fn bracket_sizes_cover_children() {
        let mut entries = QueryEntries::new();
        entries.append(OpType::And, eq_entry("a", Variant::Int(1)));
        entries.open_bracket(OpType::And);
        entries.append(OpType::And, eq_entry("b", Variant::Int(2)));
        entries.append(OpType::Or, eq_entry("c", Variant::Int(3)));
        entries.close_bracket().unwrap();
        entries.check_balanced().unwrap();

        assert_eq!(entries.len(), 4);
        assert_eq!(entries.nodes()[1].size, 3);
        assert_eq!(entries.brackets_count(), 1);
    }

    #[test]
    fn unbalanced_brackets_are_rejected() {
        let mut entries = QueryEntries::new();
        assert!(entries.close_bracket().is_err());
        entries.open_bracket(OpType::And);
        assert!(entries.check_balanced().is_err());
    }

    #[test]
    fn equal_positions_attach_to_open_bracket() {
        let mut entries = QueryEntries::new();
        entries.current_equal_positions().push(vec!["x".into()]);
        entries.open_bracket(OpType::And);
        entries.current_equal_positions().push(vec!["y".into(), "z".into()]);
        entries.close_bracket().unwrap();

        assert_eq!(entries.equal_positions.len(), 1);
        // the bracket sits at node 0, wire position 1
        assert_eq!(entries.equal_positions_of_bracket(1).unwrap().len(), 1);
        assert!(entries.equal_positions_of_bracket(5).is_err());
    }

    #[test]
    fn between_fields_forbids_unary_conditions() {
        assert!(BetweenFieldsQueryEntry::new("a", CondType::Empty, "b").is_err());
        assert!(BetweenFieldsQueryEntry::new("a", CondType::DWithin, "b").is_err());
        assert!(BetweenFieldsQueryEntry::new("a", CondType::Le, "b").is_ok());
    }

    #[test]
    fn condition_checks() {
        let lhs = VariantArray::from_values(vec![Variant::Int(5), Variant::Int(9)]);
        assert!(check_condition(&lhs, CondType::Eq, &VariantArray::single(Variant::Int(9))).unwrap());
        assert!(check_condition(&lhs, CondType::Lt, &VariantArray::single(Variant::Int(6))).unwrap());
        assert!(check_condition(
            &lhs,
            CondType::Range,
            &VariantArray::from_values(vec![Variant::Int(6), Variant::Int(10)])
        )
        .unwrap());
        assert!(!check_condition(&lhs, CondType::Empty, &VariantArray::new()).unwrap());

        let strs = VariantArray::single(Variant::str("hello world"));
        assert!(check_condition(&strs, CondType::Like, &VariantArray::single(Variant::str("hello%"))).unwrap());
        assert!(!check_condition(&strs, CondType::Like, &VariantArray::single(Variant::str("h_llo"))).unwrap());

        let points = VariantArray::single(Variant::Point(Point::new(0.0, 0.0)));
        let rhs = VariantArray::from_values(vec![
            Variant::Point(Point::new(3.0, 4.0)),
            Variant::Double(5.0),
        ]);
        assert!(check_condition(&points, CondType::DWithin, &rhs).unwrap());
    }

    #[test]
    fn dwithin_entry_verification() {
        let bad = QueryEntry::new(
            "p",
            CondType::DWithin,
            VariantArray::single(Variant::Double(1.0)),
        );
        assert!(bad.is_err());
    }
}
