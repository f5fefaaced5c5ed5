//! Lexer for the restricted SQL dialect.

use std::iter::Peekable;
use std::str::CharIndices;

use super::token::{Keyword, Token, TokenKind};
use super::QueryError;

pub struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
        }
    }

    /// Tokenizes the whole input. The last token is always [`TokenKind::Eof`].
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::InvalidQuery`] for unterminated literals and
    /// characters outside the dialect.
    pub fn tokenize(mut self) -> Result<Vec<Token>, QueryError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let is_eof = token.kind == TokenKind::Eof;
            tokens.push(token);
            if is_eof {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, QueryError> {
        self.skip_whitespace();
        let Some(&(position, c)) = self.chars.peek() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                position: self.source.len(),
            });
        };
        let kind = match c {
            '*' => self.single(TokenKind::Star),
            ',' => self.single(TokenKind::Comma),
            '(' => self.single(TokenKind::LParen),
            ')' => self.single(TokenKind::RParen),
            '+' => self.single(TokenKind::Plus),
            '-' => self.single(TokenKind::Minus),
            '=' => self.single(TokenKind::Eq),
            '!' => {
                self.chars.next();
                if self.eat('=') {
                    TokenKind::Ne
                } else {
                    return Err(unexpected('!', position));
                }
            }
            '<' => {
                self.chars.next();
                if self.eat('=') {
                    TokenKind::Le
                } else if self.eat('>') {
                    TokenKind::Ne
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                self.chars.next();
                if self.eat('=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '\'' => TokenKind::String(self.quoted('\'', position)?),
            '"' => TokenKind::QuotedIdentifier(self.quoted('"', position)?),
            '`' => TokenKind::QuotedIdentifier(self.quoted('`', position)?),
            c if c.is_ascii_digit() || c == '.' => TokenKind::Number(self.number(position)?),
            c if is_identifier_start(c) => {
                let word = self.word(position);
                match Keyword::lookup(word) {
                    Some(keyword) => TokenKind::Keyword(keyword),
                    None => TokenKind::Identifier(word.to_string()),
                }
            }
            other => return Err(unexpected(other, position)),
        };
        Ok(Token { kind, position })
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.chars.next();
        kind
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.chars.peek().map(|&(_, c)| c) == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while self.chars.peek().is_some_and(|&(_, c)| c.is_whitespace()) {
            self.chars.next();
        }
    }

    /// Reads a literal delimited by `quote`; a doubled quote is an escape.
    fn quoted(&mut self, quote: char, start: usize) -> Result<String, QueryError> {
        self.chars.next();
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => {
                    if self.eat(quote) {
                        value.push(quote);
                    } else {
                        return Ok(value);
                    }
                }
                Some((_, c)) => value.push(c),
                None => {
                    return Err(QueryError::InvalidQuery(format!(
                        "Unterminated literal starting at position {start}"
                    )))
                }
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<String, QueryError> {
        let mut end = start;
        let mut seen_dot = false;
        let mut seen_exponent = false;
        while let Some(&(i, c)) = self.chars.peek() {
            let accept = match c {
                '0'..='9' => true,
                '.' if !seen_dot && !seen_exponent => {
                    seen_dot = true;
                    true
                }
                'e' | 'E' if !seen_exponent => {
                    seen_exponent = true;
                    true
                }
                '+' | '-' => self.source[..i].ends_with(['e', 'E']),
                _ => false,
            };
            if !accept {
                break;
            }
            end = i + c.len_utf8();
            self.chars.next();
        }
        let text = &self.source[start..end];
        if text == "." || text.ends_with(['e', 'E', '+', '-']) {
            return Err(QueryError::InvalidQuery(format!(
                "Malformed number '{text}' at position {start}"
            )));
        }
        Ok(text.to_string())
    }

    fn word(&mut self, start: usize) -> &'a str {
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if !is_identifier_part(c) {
                break;
            }
            end = i + c.len_utf8();
            self.chars.next();
        }
        &self.source[start..end]
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_identifier_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn unexpected(c: char, position: usize) -> QueryError {
    QueryError::InvalidQuery(format!("Unexpected character '{c}' at position {position}"))
}
