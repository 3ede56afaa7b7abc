use crate::core::error::{Error, ErrorKind, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    Name,
    Number,
    String,
    Symbol,
    End,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub typ: TokenType,
    pub text: String,
}

impl Token {
    fn end() -> Self {
        Token { typ: TokenType::End, text: String::new() }
    }
}

/// Expression tokenizer: names (with dots for JSON paths), numbers,
/// quoted strings and single-character symbols.
pub struct Tokenizer<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str) -> Self {
        Tokenizer { input: input.as_bytes(), pos: 0 }
    }

    /// Human-readable position for error context.
    pub fn where_is(&self) -> String {
        let upto = std::str::from_utf8(&self.input[..self.pos]).unwrap_or("");
        format!("pos {} ('...{}')", self.pos, &upto[upto.len().saturating_sub(16)..])
    }

    pub fn peek_token(&mut self) -> Result<Token> {
        let save = self.pos;
        let tok = self.next_token()?;
        self.pos = save;
        Ok(tok)
    }

    pub fn next_token(&mut self) -> Result<Token> {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        if self.pos >= self.input.len() {
            return Ok(Token::end());
        }
        let c = self.input[self.pos];
        if c.is_ascii_digit() {
            let start = self.pos;
            while self.pos < self.input.len()
                && (self.input[self.pos].is_ascii_digit() || self.input[self.pos] == b'.')
            {
                self.pos += 1;
            }
            return Ok(Token {
                typ: TokenType::Number,
                text: std::str::from_utf8(&self.input[start..self.pos])?.to_string(),
            });
        }
        if c.is_ascii_alphabetic() || c == b'_' {
            let start = self.pos;
            while self.pos < self.input.len()
                && (self.input[self.pos].is_ascii_alphanumeric()
                    || self.input[self.pos] == b'_'
                    || self.input[self.pos] == b'.')
            {
                self.pos += 1;
            }
            return Ok(Token {
                typ: TokenType::Name,
                text: std::str::from_utf8(&self.input[start..self.pos])?.to_string(),
            });
        }
        if c == b'\'' || c == b'"' {
            let quote = c;
            self.pos += 1;
            let start = self.pos;
            while self.pos < self.input.len() && self.input[self.pos] != quote {
                self.pos += 1;
            }
            if self.pos >= self.input.len() {
                return Err(Error::new(
                    ErrorKind::ParseSql,
                    format!("unterminated string literal, {}", self.where_is()),
                ));
            }
            let text = std::str::from_utf8(&self.input[start..self.pos])?.to_string();
            self.pos += 1;
            return Ok(Token { typ: TokenType::String, text });
        }
        self.pos += 1;
        Ok(Token {
            typ: TokenType::Symbol,
            text: (c as char).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_expression() {
        let mut t = Tokenizer::new("price * 2 + nested.rate || 'str'");
        let kinds: Vec<(TokenType, String)> = std::iter::from_fn(|| {
            let tok = t.next_token().unwrap();
            (tok.typ != TokenType::End).then(|| (tok.typ, tok.text))
        })
        .collect();
        assert_eq!(
            kinds,
            vec![
                (TokenType::Name, "price".into()),
                (TokenType::Symbol, "*".into()),
                (TokenType::Number, "2".into()),
                (TokenType::Symbol, "+".into()),
                (TokenType::Name, "nested.rate".into()),
                (TokenType::Symbol, "|".into()),
                (TokenType::Symbol, "|".into()),
                (TokenType::String, "str".into()),
            ]
        );
    }

    #[test]
    fn peek_does_not_consume() {
        let mut t = Tokenizer::new("a b");
        assert_eq!(t.peek_token().unwrap().text, "a");
        assert_eq!(t.next_token().unwrap().text, "a");
        assert_eq!(t.next_token().unwrap().text, "b");
        assert_eq!(t.next_token().unwrap().typ, TokenType::End);
    }
}
