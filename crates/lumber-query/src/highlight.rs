//! Highlighting of matched tokens in returned string cells.
//!
//! A [`Highlighter`] is built while the request is parsed (pre/post tags) and
//! filled with tokens by running [`TokenCollector`] over the final hits
//! SELECT. At response time each string cell of a highlightable column gets
//! its matches wrapped in the tags.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::ast::{self, Expr, ExprVisitor, InfixExpr};

const DEFAULT_PRE_TAG: &str = "@kibana-highlighted-field@";
const DEFAULT_POST_TAG: &str = "@/kibana-highlighted-field@";

#[derive(Debug, Clone, Default)]
pub struct Highlighter {
    /// column name -> lowercase tokens to highlight
    pub tokens: HashMap<String, HashSet<String>>,
    pub pre_tags: Vec<String>,
    pub post_tags: Vec<String>,
    enabled: bool,
}

impl Highlighter {
    /// Highlighter for requests that did not ask for highlighting.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn new(pre_tags: Vec<String>, post_tags: Vec<String>) -> Self {
        let pre_tags =
            if pre_tags.is_empty() { vec![DEFAULT_PRE_TAG.to_string()] } else { pre_tags };
        let post_tags =
            if post_tags.is_empty() { vec![DEFAULT_POST_TAG.to_string()] } else { post_tags };
        Self { tokens: HashMap::new(), pre_tags, post_tags, enabled: true }
    }

    pub fn should_highlight(&self, column_name: &str) -> bool {
        self.enabled && self.tokens.contains_key(column_name)
    }

    /// Extracts tokens to highlight from the WHERE tree of the final select.
    pub fn set_tokens_from(&mut self, select: &crate::ast::SelectCommand) {
        let mut collector = TokenCollector::default();
        collector.visit_select(select);
        self.tokens = collector.tokens;
    }

    /// Tokens for a column, longest first, so larger chunks win overlaps.
    fn sorted_tokens(&self, column_name: &str) -> Vec<&String> {
        let mut tokens: Vec<&String> = match self.tokens.get(column_name) {
            Some(set) => set.iter().collect(),
            None => return Vec::new(),
        };
        tokens.sort_by(|a, b| b.len().cmp(&a.len()).then(a.cmp(b)));
        tokens
    }

    /// Returns the highlighted fragments of `value`: every case-insensitive
    /// occurrence of any token, overlaps merged, wrapped in the first
    /// pre/post tag pair.
    pub fn highlight_value(&self, column_name: &str, value: &str) -> Vec<String> {
        if self.pre_tags.is_empty() || self.post_tags.is_empty() {
            return Vec::new();
        }

        let lower = value.to_lowercase();
        let mut matches: Vec<(usize, usize)> = Vec::new();
        for token in self.sorted_tokens(column_name) {
            if token.is_empty() {
                continue;
            }
            let mut pos = 0;
            while pos < lower.len() {
                match lower[pos..].find(token.as_str()) {
                    Some(idx) => {
                        let start = pos + idx;
                        let end = start + token.len();
                        matches.push((start, end));
                        pos = end;
                    }
                    None => break,
                }
            }
        }

        if matches.is_empty() {
            return Vec::new();
        }
        matches.sort();

        let mut merged: Vec<(usize, usize)> = Vec::new();
        for (start, end) in matches {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => {
                    *last_end = (*last_end).max(end);
                }
                _ => merged.push((start, end)),
            }
        }

        merged
            .into_iter()
            .filter_map(|(start, end)| {
                // token positions come from the lowercased copy; they are only
                // valid on the original when both slices are char boundaries
                value.get(start..end).map(|chunk| {
                    format!("{}{}{}", self.pre_tags[0], chunk, self.post_tags[0])
                })
            })
            .collect()
    }
}

/// Visitor that collects highlight tokens from `=`, `IN`, `LIKE` and `ILIKE`
/// comparisons of a column against a string literal.
#[derive(Default)]
pub struct TokenCollector {
    pub tokens: HashMap<String, HashSet<String>>,
}

impl ExprVisitor for TokenCollector {
    fn visit_infix(&mut self, e: &InfixExpr) -> Expr {
        let op = e.op.trim().to_uppercase();
        if matches!(op.as_str(), "=" | "IN" | "LIKE" | "ILIKE") {
            if let (Expr::ColumnRef(col), Expr::Literal(lit)) = (&*e.left, &*e.right) {
                if lit.value.starts_with('\'') {
                    let token = lit
                        .value
                        .trim_start_matches('\'')
                        .trim_start_matches('%')
                        .trim_end_matches('\'')
                        .trim_end_matches('%');
                    self.tokens
                        .entry(col.column_name.clone())
                        .or_default()
                        .insert(token.to_lowercase());
                } else {
                    debug!(value = %lit.value, "not collecting non-string literal for highlighting");
                }
            }
        }
        ast::walk_infix(self, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        and, column, infix, quoted_literal, sort_column, table, OrderByDirection, SelectCommand,
    };

    fn highlighter_with(tokens: &[(&str, &str)]) -> Highlighter {
        let mut h = Highlighter::new(vec!["<em>".to_string()], vec!["</em>".to_string()]);
        for (col, token) in tokens {
            h.tokens.entry(col.to_string()).or_default().insert(token.to_string());
        }
        h
    }

    #[test]
    fn test_collects_tokens_from_where_tree() {
        let select = SelectCommand::new(
            vec![column("*")],
            vec![],
            vec![sort_column("timestamp", OrderByDirection::Desc)],
            Some(table("logs")),
            and(vec![
                infix(column("message"), "ILIKE", quoted_literal("%firefox%")),
                infix(column("host"), "=", quoted_literal("web-1")),
            ]),
            10,
            0,
            false,
        );
        let mut h = Highlighter::new(vec![], vec![]);
        h.set_tokens_from(&select);
        assert!(h.tokens["message"].contains("firefox"));
        assert!(h.tokens["host"].contains("web-1"));
    }

    #[test]
    fn test_highlight_is_case_insensitive() {
        let h = highlighter_with(&[("message", "firefo")]);
        let out = h.highlight_value("message", "Mozilla Firefox/6.0a1");
        assert_eq!(out, vec!["<em>Firefo</em>".to_string()]);
    }

    #[test]
    fn test_overlapping_matches_merge() {
        let h = highlighter_with(&[("message", "abcd"), ("message", "cdef")]);
        let out = h.highlight_value("message", "xxabcdefxx");
        assert_eq!(out, vec!["<em>abcdef</em>".to_string()]);
    }

    #[test]
    fn test_fragments_in_left_to_right_order() {
        let h = highlighter_with(&[("message", "err")]);
        let out = h.highlight_value("message", "err ... ERR ... Err");
        assert_eq!(
            out,
            vec![
                "<em>err</em>".to_string(),
                "<em>ERR</em>".to_string(),
                "<em>Err</em>".to_string()
            ]
        );
    }

    #[test]
    fn test_no_tokens_no_fragments() {
        let h = highlighter_with(&[]);
        assert!(h.highlight_value("message", "anything").is_empty());
        assert!(!h.should_highlight("message"));
    }
}
