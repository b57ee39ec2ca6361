//! Translation of Lucene query syntax (`query_string`, `simple_query_string`)
//! into WHERE expressions.
//!
//! Supported: bare terms and quoted phrases (fanned out over the default
//! fields), `field:value`, `AND`/`OR`/`NOT` plus `+`/`-` prefixes, grouping
//! with parentheses, `[a TO b]` / `{a TO b}` ranges, `*`/`?` wildcards and
//! `field:>n` comparisons. Invalid input never fails the request: it
//! degrades to a constant `false` clause.

use tracing::warn;

use crate::ast::{self, column, infix, prefix, quoted_literal, Expr};

/// Translates a Lucene query into a WHERE expression over `fields`.
pub fn translate_to_sql(query: &str, fields: &[String]) -> Expr {
    let tokens = tokenize(query);
    let mut parser = LuceneParser { tokens, pos: 0, fields: fields.to_vec() };
    match parser.parse_or() {
        Some(expr) if parser.pos == parser.tokens.len() => expr,
        _ => {
            warn!(query, "invalid Lucene query, returning FALSE clause");
            ast::literal("false")
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Term(String),
    Phrase(String),
    Field(String),
    And,
    Or,
    Not,
    Plus,
    Minus,
    LParen,
    RParen,
    RangeStart { inclusive: bool },
    RangeEnd { inclusive: bool },
    To,
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\n' => {
                chars.next();
            }
            '"' => {
                chars.next();
                let mut phrase = String::new();
                for d in chars.by_ref() {
                    if d == '"' {
                        break;
                    }
                    phrase.push(d);
                }
                tokens.push(Token::Phrase(phrase));
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::RangeStart { inclusive: true });
            }
            '{' => {
                chars.next();
                tokens.push(Token::RangeStart { inclusive: false });
            }
            ']' => {
                chars.next();
                tokens.push(Token::RangeEnd { inclusive: true });
            }
            '}' => {
                chars.next();
                tokens.push(Token::RangeEnd { inclusive: false });
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            _ => {
                let mut word = String::new();
                let mut is_field = false;
                while let Some(&d) = chars.peek() {
                    if d.is_whitespace() || matches!(d, '(' | ')' | '[' | ']' | '{' | '}' | '"') {
                        break;
                    }
                    if d == ':' {
                        chars.next();
                        is_field = true;
                        break;
                    }
                    word.push(d);
                    chars.next();
                }
                match word.as_str() {
                    "AND" if !is_field => tokens.push(Token::And),
                    "OR" if !is_field => tokens.push(Token::Or),
                    "NOT" if !is_field => tokens.push(Token::Not),
                    "TO" if !is_field => tokens.push(Token::To),
                    _ => {
                        if is_field {
                            tokens.push(Token::Field(word));
                        } else {
                            tokens.push(Token::Term(word));
                        }
                    }
                }
            }
        }
    }
    tokens
}

struct LuceneParser {
    tokens: Vec<Token>,
    pos: usize,
    fields: Vec<String>,
}

impl LuceneParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Option<Expr> {
        let mut terms = vec![self.parse_and()?];
        loop {
            match self.peek() {
                Some(Token::Or) => {
                    self.next();
                    terms.push(self.parse_and()?);
                }
                // bare juxtaposition is OR in Lucene's default operator
                Some(t) if !matches!(t, Token::RParen | Token::RangeEnd { .. }) => {
                    terms.push(self.parse_and()?);
                }
                _ => break,
            }
        }
        ast::or(terms)
    }

    fn parse_and(&mut self) -> Option<Expr> {
        let mut terms = vec![self.parse_clause()?];
        while matches!(self.peek(), Some(Token::And)) {
            self.next();
            terms.push(self.parse_clause()?);
        }
        ast::and(terms)
    }

    fn parse_clause(&mut self) -> Option<Expr> {
        match self.peek()? {
            Token::Not | Token::Minus => {
                self.next();
                let inner = self.parse_clause()?;
                Some(prefix("NOT", vec![inner]))
            }
            Token::Plus => {
                self.next();
                self.parse_clause()
            }
            Token::LParen => {
                self.next();
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Some(inner),
                    _ => None,
                }
            }
            Token::Field(_) => {
                let Some(Token::Field(name)) = self.next() else { return None };
                self.parse_field_value(&name)
            }
            Token::Term(_) | Token::Phrase(_) => {
                let token = self.next()?;
                let text = match token {
                    Token::Term(t) | Token::Phrase(t) => t,
                    _ => return None,
                };
                self.match_default_fields(&text)
            }
            _ => None,
        }
    }

    fn parse_field_value(&mut self, field: &str) -> Option<Expr> {
        match self.peek()? {
            Token::RangeStart { .. } => {
                let Some(Token::RangeStart { inclusive: lower_inclusive }) = self.next() else {
                    return None;
                };
                let lower = self.range_bound()?;
                if !matches!(self.next(), Some(Token::To)) {
                    return None;
                }
                let upper = self.range_bound()?;
                let Some(Token::RangeEnd { inclusive: upper_inclusive }) = self.next() else {
                    return None;
                };
                let mut clauses = Vec::new();
                if let Some(lo) = lower {
                    let op = if lower_inclusive { ">=" } else { ">" };
                    clauses.push(infix(column(field), op, ast::literal(lo)));
                }
                if let Some(hi) = upper {
                    let op = if upper_inclusive { "<=" } else { "<" };
                    clauses.push(infix(column(field), op, ast::literal(hi)));
                }
                match ast::and(clauses) {
                    Some(e) => Some(e),
                    None => Some(ast::literal("true")),
                }
            }
            Token::LParen => {
                // field:(a b c) — any of the values
                self.next();
                let mut values = Vec::new();
                loop {
                    match self.next() {
                        Some(Token::Term(t)) | Some(Token::Phrase(t)) => {
                            values.push(self.field_match(field, &t))
                        }
                        Some(Token::Or) => continue,
                        Some(Token::RParen) => break,
                        _ => return None,
                    }
                }
                ast::or(values)
            }
            Token::Term(_) | Token::Phrase(_) => {
                let token = self.next()?;
                let text = match token {
                    Token::Term(t) | Token::Phrase(t) => t,
                    _ => return None,
                };
                if let Some(rest) = text.strip_prefix(">=") {
                    return Some(infix(column(field), ">=", ast::literal(rest)));
                }
                if let Some(rest) = text.strip_prefix("<=") {
                    return Some(infix(column(field), "<=", ast::literal(rest)));
                }
                if let Some(rest) = text.strip_prefix('>') {
                    return Some(infix(column(field), ">", ast::literal(rest)));
                }
                if let Some(rest) = text.strip_prefix('<') {
                    return Some(infix(column(field), "<", ast::literal(rest)));
                }
                Some(self.field_match(field, &text))
            }
            _ => None,
        }
    }

    fn range_bound(&mut self) -> Option<Option<String>> {
        match self.next()? {
            Token::Term(t) | Token::Phrase(t) => {
                if t == "*" {
                    Some(None)
                } else {
                    Some(Some(t))
                }
            }
            _ => None,
        }
    }

    /// `field:value` with wildcard support; plain values become
    /// case-insensitive substring matches like `match` does.
    fn field_match(&self, field: &str, value: &str) -> Expr {
        if value.contains('*') || value.contains('?') {
            let pattern = value.replace('*', "%").replace('?', "_");
            infix(column(field), "ILIKE", quoted_literal(pattern))
        } else {
            infix(column(field), "ILIKE", quoted_literal(format!("%{}%", value)))
        }
    }

    fn match_default_fields(&self, text: &str) -> Option<Expr> {
        if self.fields.is_empty() {
            warn!("Lucene query without fields and no full-text fields configured");
            return Some(ast::literal("false"));
        }
        let clauses: Vec<Expr> =
            self.fields.iter().map(|f| self.field_match(f, text)).collect();
        ast::or(clauses)
    }
}
