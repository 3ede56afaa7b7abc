use crate::cjson::TagsMatcher;
use crate::core::error::{Error, ErrorKind, Result};
use crate::core::variant::{KeyValueType, Variant, VariantArray};
use crate::payload::payload::Payload;
use crate::payload::payload_type::PayloadType;
use crate::payload::value::PayloadValue;
use crate::query::tokenizer::{Token, TokenType, Tokenizer};

const WRONG_FIELD_TYPE_ERROR: &str =
    "Only integral type non-array fields are supported in arithmetical expressions";

/// Resolves calls to names the payload does not know (select functions,
/// item precepts like `serial()`).
pub trait FunctionExecutor {
    fn execute(&mut self, name: &str, args: &[String], for_field: &str) -> Result<Variant>;
}

/// Executor for contexts where no functions are available.
pub struct NoFunctions;

impl FunctionExecutor for NoFunctions {
    fn execute(&mut self, name: &str, _args: &[String], _for_field: &str) -> Result<Variant> {
        Err(Error::new(ErrorKind::Params, format!("unknown function or field '{}'", name)))
    }
}

/// Evaluation state: set by the lowest-precedence operator seen so far;
/// array-concat is sticky once entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalState {
    None,
    SumSubtract,
    MulDivide,
    ArrayConcat,
}

/// Recursive-descent evaluator of arithmetic / array-concatenation
/// expressions over a single payload:
/// `Sum := Mul ((+|-) Mul)*`, `Mul := Concat ((*|/) Concat)*`,
/// `Concat := Primary (|| Primary)*`,
/// `Primary := number | '(' Sum ')' | '[' value {, value} ']' | name`.
pub struct ExpressionEvaluator<'a> {
    payload_type: &'a PayloadType,
    tags_matcher: &'a TagsMatcher,
    functions: &'a mut dyn FunctionExecutor,
    state: EvalState,
    array_values: VariantArray,
    for_field: String,
}

impl<'a> ExpressionEvaluator<'a> {
    pub fn new(
        payload_type: &'a PayloadType,
        tags_matcher: &'a TagsMatcher,
        functions: &'a mut dyn FunctionExecutor,
    ) -> Self {
        ExpressionEvaluator {
            payload_type,
            tags_matcher,
            functions,
            state: EvalState::None,
            array_values: VariantArray::new(),
            for_field: String::new(),
        }
    }

    pub fn state(&self) -> EvalState {
        self.state
    }

    /// Evaluates `expr` over `v`. A non-empty array accumulator wins over
    /// the scalar result; a pure scalar comes back as a one-element array.
    pub fn evaluate(&mut self, expr: &str, v: &PayloadValue, for_field: &str) -> Result<VariantArray> {
        self.state = EvalState::None;
        self.array_values = VariantArray::new();
        self.for_field = for_field.to_string();
        let mut parser = Tokenizer::new(expr);
        let pl = Payload::new(self.payload_type, v);
        let scalar = self.sum(&mut parser, &pl)?;
        let tail = parser.next_token()?;
        if tail.typ != TokenType::End {
            return Err(Error::new(
                ErrorKind::ParseSql,
                format!("unexpected '{}' in expression, {}", tail.text, parser.where_is()),
            ));
        }
        if self.array_values.is_empty() {
            Ok(VariantArray::single(Variant::Double(scalar)))
        } else {
            let mut out = std::mem::take(&mut self.array_values);
            out.set_array_flag(true);
            Ok(out)
        }
    }

    fn sum(&mut self, parser: &mut Tokenizer, pl: &Payload) -> Result<f64> {
        let mut left = self.mul(parser, pl)?;
        loop {
            let tok = parser.peek_token()?;
            match tok.text.as_str() {
                "+" => {
                    self.widen(EvalState::SumSubtract);
                    parser.next_token()?;
                    left += self.mul(parser, pl)?;
                }
                "-" => {
                    self.widen(EvalState::SumSubtract);
                    parser.next_token()?;
                    left -= self.mul(parser, pl)?;
                }
                _ => return Ok(left),
            }
        }
    }

    fn mul(&mut self, parser: &mut Tokenizer, pl: &Payload) -> Result<f64> {
        let mut left = self.concat(parser, pl)?;
        loop {
            let tok = parser.peek_token()?;
            match tok.text.as_str() {
                "*" => {
                    self.widen(EvalState::MulDivide);
                    parser.next_token()?;
                    left *= self.concat(parser, pl)?;
                }
                "/" => {
                    self.widen(EvalState::MulDivide);
                    parser.next_token()?;
                    let val = self.concat(parser, pl)?;
                    if val == 0.0 {
                        return Err(Error::new(ErrorKind::Logic, "Division by zero!"));
                    }
                    left /= val;
                }
                _ => return Ok(left),
            }
        }
    }

    fn concat(&mut self, parser: &mut Tokenizer, pl: &Payload) -> Result<f64> {
        let left = self.primary(parser, pl)?;
        loop {
            let tok = parser.peek_token()?;
            if tok.text != "|" {
                return Ok(left);
            }
            parser.next_token()?;
            let second = parser.next_token()?;
            if second.text != "|" {
                return Err(Error::new(
                    ErrorKind::Logic,
                    format!("expected '|', not '{}'", second.text),
                ));
            }
            self.state = EvalState::ArrayConcat;
            self.primary(parser, pl)?;
        }
    }

    fn primary(&mut self, parser: &mut Tokenizer, pl: &Payload) -> Result<f64> {
        let tok = parser.peek_token()?;
        match tok.typ {
            TokenType::Symbol if tok.text == "(" => {
                parser.next_token()?;
                let val = self.sum(parser, pl)?;
                let closing = parser.next_token()?;
                if closing.text != ")" {
                    return Err(Error::new(ErrorKind::Logic, "')' expected in arithmetical expression"));
                }
                Ok(val)
            }
            TokenType::Symbol if tok.text == "[" => {
                parser.next_token()?;
                self.capture_array_content(parser)?;
                Ok(0.0)
            }
            TokenType::Number => {
                parser.next_token()?;
                tok.text.parse::<f64>().map_err(|_| {
                    Error::new(ErrorKind::ParseSql, format!("bad number '{}'", tok.text))
                })
            }
            TokenType::Name => {
                parser.next_token()?;
                self.resolve_name(parser, pl, &tok)
            }
            _ => Err(Error::new(
                ErrorKind::Logic,
                WRONG_FIELD_TYPE_ERROR.to_string(),
            )),
        }
    }

    fn capture_array_content(&mut self, parser: &mut Tokenizer) -> Result<()> {
        loop {
            let tok = parser.next_token()?;
            if tok.text == "]" {
                if self.array_values.is_empty() {
                    return Ok(());
                }
                return Err(Error::new(
                    ErrorKind::ParseSql,
                    format!("expected field value, but found ']', {}", parser.where_is()),
                ));
            }
            self.array_values.push(token_to_variant(&tok)?);
            let sep = parser.next_token()?;
            if sep.text == "]" {
                return Ok(());
            }
            if sep.text != "," {
                return Err(Error::new(
                    ErrorKind::ParseSql,
                    format!("expected ']' or ',', but found '{}', {}", sep.text, parser.where_is()),
                ));
            }
        }
    }

    fn resolve_name(&mut self, parser: &mut Tokenizer, pl: &Payload, tok: &Token) -> Result<f64> {
        if let Some(field) = self.payload_type.field_by_name(&tok.text) {
            let f = self.payload_type.field(field);
            if f.is_array || self.state == EvalState::ArrayConcat {
                let values = pl.get(field)?;
                for v in values {
                    self.array_values.push(v.ensure_hold());
                }
                return Ok(0.0);
            }
            return match f.key_type {
                KeyValueType::Int | KeyValueType::Int64 | KeyValueType::Double => {
                    let values = pl.get(field)?;
                    match values.values.first() {
                        Some(first) => first.as_double(),
                        None => Err(Error::new(
                            ErrorKind::Logic,
                            format!("Calculating value of an empty field is impossible: {}", tok.text),
                        )),
                    }
                }
                _ => Err(Error::new(
                    ErrorKind::Logic,
                    format!("{}: {}", WRONG_FIELD_TYPE_ERROR, tok.text),
                )),
            };
        }

        let values = pl.get_by_json_path(&tok.text, self.tags_matcher)?;
        if !values.is_empty() {
            if values.len() > 1 || self.state == EvalState::ArrayConcat {
                for v in values {
                    self.array_values.push(v.ensure_hold());
                }
                return Ok(0.0);
            }
            let first = &values.values[0];
            return match first.key_type() {
                KeyValueType::Int | KeyValueType::Int64 | KeyValueType::Double => first.as_double(),
                _ => Err(Error::new(
                    ErrorKind::Logic,
                    format!("{}: {}", WRONG_FIELD_TYPE_ERROR, tok.text),
                )),
            };
        }

        // Unknown name: a select-function call like name(arg, ...).
        let args = self.parse_function_args(parser)?;
        let result = self
            .functions
            .execute(&tok.text, &args, &self.for_field.clone())?;
        result.as_double()
    }

    fn parse_function_args(&mut self, parser: &mut Tokenizer) -> Result<Vec<String>> {
        let open = parser.next_token()?;
        if open.text != "(" {
            return Err(Error::new(
                ErrorKind::Params,
                format!("unknown field or function, {}", parser.where_is()),
            ));
        }
        let mut args = Vec::new();
        loop {
            let tok = parser.next_token()?;
            match tok.text.as_str() {
                ")" => return Ok(args),
                "," => continue,
                _ => args.push(tok.text),
            }
        }
    }

    fn widen(&mut self, state: EvalState) {
        if self.state != EvalState::ArrayConcat {
            self.state = state;
        }
    }
}

fn token_to_variant(tok: &Token) -> Result<Variant> {
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
        TokenType::String | TokenType::Name => Variant::str(tok.text.clone()),
        _ => {
            return Err(Error::new(
                ErrorKind::ParseSql,
                format!("unexpected token '{}' in array literal", tok.text),
            ))
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::payload::build_payload;
    use serde_json::json;

    fn fixture() -> (PayloadType, TagsMatcher, PayloadValue) {
        let t = PayloadType::builder("items")
            .field("price", KeyValueType::Double, false)
            .field("qty", KeyValueType::Int, false)
            .field("tags", KeyValueType::String, true)
            .field("name", KeyValueType::String, false)
            .build()
            .unwrap();
        let mut tm = TagsMatcher::new();
        let pv = build_payload(
            &t,
            &json!({"price": 2.5, "qty": 4, "tags": ["a", "b"], "name": "x", "extra": "c"}),
            &mut tm,
        )
        .unwrap();
        (t, tm, pv)
    }

    #[test]
    fn pure_arithmetic() {
        let (t, tm, pv) = fixture();
        let mut nf = NoFunctions;
        let mut ev = ExpressionEvaluator::new(&t, &tm, &mut nf);
        let out = ev.evaluate("2 + 2 * 2", &pv, "").unwrap();
        assert_eq!(out.values, vec![Variant::Double(6.0)]);
        let out = ev.evaluate("(2 + 2) * 2", &pv, "").unwrap();
        assert_eq!(out.values, vec![Variant::Double(8.0)]);
        // equal precedence folds left-to-right
        let out = ev.evaluate("8 / 4 / 2", &pv, "").unwrap();
        assert_eq!(out.values, vec![Variant::Double(1.0)]);
    }

    #[test]
    fn division_by_zero_is_logic_error() {
        let (t, tm, pv) = fixture();
        let mut nf = NoFunctions;
        let mut ev = ExpressionEvaluator::new(&t, &tm, &mut nf);
        let err = ev.evaluate("10 / (2 - 2)", &pv, "").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Logic);
        assert!(err.context.contains("Division by zero"));
    }

    #[test]
    fn field_arithmetic() {
        let (t, tm, pv) = fixture();
        let mut nf = NoFunctions;
        let mut ev = ExpressionEvaluator::new(&t, &tm, &mut nf);
        let out = ev.evaluate("price * qty", &pv, "").unwrap();
        assert_eq!(out.values, vec![Variant::Double(10.0)]);
    }

    #[test]
    fn string_field_is_rejected() {
        let (t, tm, pv) = fixture();
        let mut nf = NoFunctions;
        let mut ev = ExpressionEvaluator::new(&t, &tm, &mut nf);
        let err = ev.evaluate("name + 1", &pv, "").unwrap_err();
        assert_eq!(err.kind, ErrorKind::Logic);
    }

    #[test]
    fn array_concat_is_sticky_and_left_to_right() {
        let (t, tm, pv) = fixture();
        let mut nf = NoFunctions;
        let mut ev = ExpressionEvaluator::new(&t, &tm, &mut nf);
        let out = ev.evaluate("tags || extra", &pv, "").unwrap();
        assert_eq!(ev.state(), EvalState::ArrayConcat);
        assert!(out.is_array_value());
        let strs: Vec<&str> = out.iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(strs, vec!["a", "b", "c"]);
    }

    #[test]
    fn array_literal_concat() {
        let (t, tm, pv) = fixture();
        let mut nf = NoFunctions;
        let mut ev = ExpressionEvaluator::new(&t, &tm, &mut nf);
        let out = ev.evaluate("['x', 'y'] || tags", &pv, "").unwrap();
        let strs: Vec<&str> = out.iter().map(|v| v.as_str().unwrap()).collect();
        assert_eq!(strs, vec!["x", "y", "a", "b"]);
    }

    #[test]
    fn unknown_name_goes_to_function_executor() {
        struct Fixed;
        impl FunctionExecutor for Fixed {
            fn execute(&mut self, name: &str, _args: &[String], _f: &str) -> Result<Variant> {
                assert_eq!(name, "rank");
                Ok(Variant::Double(7.0))
            }
        }
        let (t, tm, pv) = fixture();
        let mut f = Fixed;
        let mut ev = ExpressionEvaluator::new(&t, &tm, &mut f);
        let out = ev.evaluate("rank() + 1", &pv, "score").unwrap();
        assert_eq!(out.values, vec![Variant::Double(8.0)]);
    }
}
