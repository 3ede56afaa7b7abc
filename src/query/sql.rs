use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::{Variant, VariantArray};
use crate::query::entries::{EntryPayload, QueryEntries};
use crate::query::query::Query;
use crate::query::types::{CondType, FieldModifyMode, OpType, QueryType};
use crate::query::tokenizer::{TokenType, Tokenizer};

/// Renders the query in SQL form for logs and diagnostics. One-way: the
/// output is not guaranteed to parse back into an identical query.
pub fn get_sql(q: &Query, strip_args: bool) -> String {
    let mut out = String::new();
    match q.query_type {
        QueryType::Truncate => {
            out.push_str("TRUNCATE ");
            out.push_str(&q.namespace);
            return out;
        }
        QueryType::Delete => {
            out.push_str("DELETE FROM ");
            out.push_str(&q.namespace);
        }
        QueryType::Update => {
            out.push_str("UPDATE ");
            out.push_str(&q.namespace);
            let mut first = true;
            for u in &q.update_fields {
                out.push_str(if first { " SET " } else { "," });
                first = false;
                out.push_str(&u.column);
                match u.mode {
                    FieldModifyMode::Drop => {
                        out.push_str(" = NULL");
                    }
                    _ => {
                        out.push_str(" = ");
                        write_values(&mut out, &u.values, strip_args);
                    }
                }
            }
        }
        QueryType::Select => {
            out.push_str("SELECT ");
            if !q.aggregations.is_empty() {
                let aggs: Vec<String> = q
                    .aggregations
                    .iter()
                    .map(|a| format!("{}({})", a.agg_type.name(), a.fields.join(",")))
                    .collect();
                out.push_str(&aggs.join(","));
            } else if !q.select_filter.is_empty() {
                out.push_str(&q.select_filter.join(","));
            } else {
                out.push('*');
            }
            out.push_str(" FROM ");
            out.push_str(&q.namespace);
        }
    }

    write_where(&mut out, &q.entries, strip_args);

    for (idx, se) in q.sorting_entries.iter().enumerate() {
        out.push_str(if idx == 0 { " ORDER BY " } else { "," });
        out.push_str(&se.expression);
        if se.desc {
            out.push_str(" DESC");
        }
    }

    if q.has_limit() {
        out.push_str(&format!(" LIMIT {}", q.count));
    }
    if q.has_offset() {
        out.push_str(&format!(" OFFSET {}", q.start));
    }
    out
}

fn write_where(out: &mut String, entries: &QueryEntries, strip_args: bool) {
    if entries.is_empty() {
        return;
    }
    out.push_str(" WHERE ");
    write_range(out, entries, 0, entries.len(), strip_args);
}

fn write_range(out: &mut String, entries: &QueryEntries, from: usize, to: usize, strip_args: bool) {
    let nodes = entries.nodes();
    let mut i = from;
    while i < to {
        let node = &nodes[i];
        if i != from {
            match node.op {
                OpType::And => out.push_str(" AND "),
                OpType::Or => out.push_str(" OR "),
                OpType::Not => out.push_str(" AND NOT "),
            }
        } else if node.op == OpType::Not {
            out.push_str("NOT ");
        }
        match &node.payload {
            EntryPayload::Bracket { .. } => {
                out.push('(');
                write_range(out, entries, i + 1, i + node.size, strip_args);
                out.push(')');
            }
            EntryPayload::Condition(qe) => {
                match qe.condition {
                    CondType::DWithin => {
                        out.push_str(&format!("ST_DWithin({},", qe.field));
                        write_values(out, &qe.values, strip_args);
                        out.push(')');
                    }
                    CondType::Any => {
                        out.push_str(&qe.field);
                        out.push_str(" IS NOT NULL");
                    }
                    CondType::Empty => {
                        out.push_str(&qe.field);
                        out.push_str(" IS NULL");
                    }
                    CondType::Set | CondType::AllSet => {
                        out.push_str(&qe.field);
                        out.push_str(if qe.condition == CondType::Set { " IN (" } else { " ALLSET (" });
                        write_values(out, &qe.values, strip_args);
                        out.push(')');
                    }
                    CondType::Range => {
                        out.push_str(&qe.field);
                        out.push_str(" RANGE(");
                        write_values(out, &qe.values, strip_args);
                        out.push(')');
                    }
                    cond => {
                        out.push_str(&qe.field);
                        out.push(' ');
                        out.push_str(cond.name());
                        out.push(' ');
                        write_values(out, &qe.values, strip_args);
                    }
                }
            }
            EntryPayload::BetweenFields(bf) => {
                out.push_str(&format!("{} {} {}", bf.left_field, bf.condition.name(), bf.right_field));
            }
            EntryPayload::Join(je) => {
                out.push_str(&format!("INNER JOIN #{}", je.join_index));
            }
            EntryPayload::AlwaysFalse => out.push_str("false"),
        }
        i += node.size;
    }
}

fn write_values(out: &mut String, values: &VariantArray, strip_args: bool) {
    if strip_args {
        out.push('?');
        return;
    }
    let rendered: Vec<String> = values.iter().map(Variant::dump).collect();
    out.push_str(&rendered.join(","));
}

/// Minimal SQL SELECT parser backing the binding's string entry point.
/// Supports a flat WHERE over one namespace; the full grammar belongs to
/// an external parser.
pub fn parse_sql(input: &str) -> Result<Query> {
    let mut t = Tokenizer::new(input);
    expect_keyword(&mut t, "SELECT")?;

    let mut fields = Vec::new();
    loop {
        let tok = t.next_token()?;
        match tok.typ {
            TokenType::Symbol if tok.text == "*" => {}
            TokenType::Name if tok.text.eq_ignore_ascii_case("FROM") => break,
            TokenType::Name => fields.push(tok.text),
            TokenType::Symbol if tok.text == "," => {}
            _ => {
                return Err(Error::new(
                    ErrorKind::ParseSql,
                    format!("unexpected '{}' in select list, {}", tok.text, t.where_is()),
                ))
            }
        }
    }

    let ns = t.next_token()?;
    if ns.typ != TokenType::Name {
        return Err(Error::new(ErrorKind::ParseSql, "namespace name expected after FROM"));
    }
    let mut q = Query::new(ns.text);
    if !fields.is_empty() {
        q = q.select(fields)?;
    }

    loop {
        let tok = t.next_token()?;
        match tok.typ {
            TokenType::End => break,
            TokenType::Name if tok.text.eq_ignore_ascii_case("WHERE") => {
                q = parse_where(&mut t, q)?;
            }
            TokenType::Name if tok.text.eq_ignore_ascii_case("ORDER") => {
                expect_keyword(&mut t, "BY")?;
                let field = t.next_token()?;
                if field.typ != TokenType::Name {
                    return Err(Error::new(ErrorKind::ParseSql, "sort field expected after ORDER BY"));
                }
                let mut desc = false;
                if peek_keyword(&mut t, "DESC")? {
                    t.next_token()?;
                    desc = true;
                } else if peek_keyword(&mut t, "ASC")? {
                    t.next_token()?;
                }
                q = q.sort(field.text, desc);
            }
            TokenType::Name if tok.text.eq_ignore_ascii_case("LIMIT") => {
                q = q.limit(parse_number(&mut t)?);
            }
            TokenType::Name if tok.text.eq_ignore_ascii_case("OFFSET") => {
                q = q.offset(parse_number(&mut t)?);
            }
            _ => {
                return Err(Error::new(
                    ErrorKind::ParseSql,
                    format!("unexpected '{}' in query, {}", tok.text, t.where_is()),
                ))
            }
        }
    }
    Ok(q)
}

fn parse_where(t: &mut Tokenizer, mut q: Query) -> Result<Query> {
    loop {
        let field = t.next_token()?;
        if field.typ != TokenType::Name {
            return Err(Error::new(
                ErrorKind::ParseSql,
                format!("field name expected in WHERE, got '{}'", field.text),
            ));
        }
        let op = t.next_token()?;
        let (cond, values) = match op.text.as_str() {
            "=" => (CondType::Eq, VariantArray::single(parse_value(t)?)),
            "<" | ">" => {
                // <= and >= arrive as two symbol tokens
                let mut cond = if op.text == "<" { CondType::Lt } else { CondType::Gt };
                if t.peek_token()?.text == "=" {
                    t.next_token()?;
                    cond = if cond == CondType::Lt { CondType::Le } else { CondType::Ge };
                }
                (cond, VariantArray::single(parse_value(t)?))
            }
            _ if op.text.eq_ignore_ascii_case("IN") => {
                let open = t.next_token()?;
                if open.text != "(" {
                    return Err(Error::new(ErrorKind::ParseSql, "'(' expected after IN"));
                }
                let mut values = VariantArray::new();
                loop {
                    let tok = t.next_token()?;
                    match tok.text.as_str() {
                        ")" => break,
                        "," => continue,
                        _ => values.push(token_value(&tok)?),
                    }
                }
                (CondType::Set, values)
            }
            _ if op.text.eq_ignore_ascii_case("LIKE") => {
                (CondType::Like, VariantArray::single(parse_value(t)?))
            }
            other => {
                return Err(Error::new(
                    ErrorKind::ParseSql,
                    format!("unknown condition '{}' in WHERE", other),
                ));
            }
        };
        q = q.where_cond(field.text, cond, values)?;

        if peek_keyword(t, "AND")? {
            t.next_token()?;
            continue;
        }
        if peek_keyword(t, "OR")? {
            t.next_token()?;
            q = q.or();
            continue;
        }
        return Ok(q);
    }
}

fn parse_value(t: &mut Tokenizer) -> Result<Variant> {
    let tok = t.next_token()?;
    token_value(&tok)
}

fn token_value(tok: &crate::query::tokenizer::Token) -> Result<Variant> {
    Ok(match tok.typ {
        TokenType::Number => {
            if tok.text.contains('.') {
                Variant::Double(tok.text.parse().map_err(|_| {
                    Error::new(ErrorKind::ParseSql, format!("bad number '{}'", tok.text))
                })?)
            } else {
                Variant::Int64(tok.text.parse().map_err(|_| {
                    Error::new(ErrorKind::ParseSql, format!("bad number '{}'", tok.text))
                })?)
            }
        }
        TokenType::String => Variant::str(tok.text.clone()),
        TokenType::Name if tok.text.eq_ignore_ascii_case("true") => Variant::Bool(true),
        TokenType::Name if tok.text.eq_ignore_ascii_case("false") => Variant::Bool(false),
        _ => {
            return Err(Error::new(
                ErrorKind::ParseSql,
                format!("value expected, got '{}'", tok.text),
            ))
        }
    })
}

fn parse_number(t: &mut Tokenizer) -> Result<u32> {
    let tok = t.next_token()?;
    if tok.typ != TokenType::Number {
        return Err(Error::new(ErrorKind::ParseSql, format!("number expected, got '{}'", tok.text)));
    }
    tok.text
        .parse()
        .map_err(|_| Error::new(ErrorKind::ParseSql, format!("bad number '{}'", tok.text)))
}

fn expect_keyword(t: &mut Tokenizer, kw: &str) -> Result<()> {
    let tok = t.next_token()?;
    if tok.typ == TokenType::Name && tok.text.eq_ignore_ascii_case(kw) {
        Ok(())
    } else {
        Err(Error::new(
            ErrorKind::ParseSql,
            format!("'{}' expected, got '{}'", kw, tok.text),
        ))
    }
}

fn peek_keyword(t: &mut Tokenizer, kw: &str) -> Result<bool> {
    let tok = t.peek_token()?;
    Ok(tok.typ == TokenType::Name && tok.text.eq_ignore_ascii_case(kw))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::types::AggType;
    use crate::query::types::{DEFAULT_LIMIT, DEFAULT_OFFSET};

    #[test]
    fn renders_select() {
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
            .offset(5);
        let sql = get_sql(&q, false);
        assert_eq!(
            sql,
            "SELECT * FROM ns WHERE age > 18 AND (city = 'Kyiv' OR city = 'Lviv') ORDER BY name DESC LIMIT 10 OFFSET 5"
        );
    }

    #[test]
    fn renders_aggregation_and_stripped_args() {
        let q = Query::new("ns")
            .aggregate(AggType::Sum, vec!["score".into()], vec![], DEFAULT_LIMIT, DEFAULT_OFFSET)
            .unwrap()
            .where_cond("age", CondType::Ge, VariantArray::single(Variant::Int(21)))
            .unwrap();
        assert_eq!(get_sql(&q, true), "SELECT sum(score) FROM ns WHERE age >= ?");
    }

    #[test]
    fn renders_update_and_delete() {
        let mut q = Query::new("items")
            .set("price", VariantArray::single(Variant::Double(1.5)), false)
            .unwrap()
            .where_cond("id", CondType::Eq, VariantArray::single(Variant::Int(1)))
            .unwrap();
        q.query_type = QueryType::Update;
        assert_eq!(get_sql(&q, false), "UPDATE items SET price = 1.5 WHERE id = 1");

        let mut d = Query::new("items");
        d.query_type = QueryType::Delete;
        assert_eq!(get_sql(&d, false), "DELETE FROM items");
    }

    #[test]
    fn parses_basic_select() {
        let q = parse_sql("SELECT * FROM users WHERE age > 18 AND name = 'bob' ORDER BY age DESC LIMIT 5 OFFSET 2")
            .unwrap();
        assert_eq!(q.namespace, "users");
        assert_eq!(q.entries.len(), 2);
        assert_eq!(q.count, 5);
        assert_eq!(q.start, 2);
        assert!(q.sorting_entries[0].desc);
    }

    #[test]
    fn parses_in_and_select_list() {
        let q = parse_sql("SELECT id, name FROM users WHERE city IN ('a', 'b')").unwrap();
        assert_eq!(q.select_filter, vec!["id".to_string(), "name".to_string()]);
        assert_eq!(q.entries.len(), 1);
    }

    #[test]
    fn garbage_is_parse_sql_error() {
        assert_eq!(parse_sql("DROP TABLE users").unwrap_err().kind, ErrorKind::ParseSql);
        assert_eq!(parse_sql("SELECT * FROM").unwrap_err().kind, ErrorKind::ParseSql);
    }
}
