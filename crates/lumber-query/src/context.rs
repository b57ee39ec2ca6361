//! The view of one index a query translation runs against.
//!
//! The parser and the transform passes never touch the registry or the table
//! catalog directly; the gateway hands them an [`IndexContext`] snapshot so
//! translation stays pure and testable.

/// DateTime kind of a column, as stored in the backing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateTimeKind {
    DateTime,
    DateTime64,
    Invalid,
}

/// Presence and shape of a physical column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    NotExists,
    BaseType,
    Array,
}

/// A pair of `keys[]`/`values[]` columns storing open JSON fields.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributePair {
    pub keys_column: String,
    pub values_column: String,
}

/// Everything the translator needs to know about the target index.
pub trait IndexContext: Send + Sync {
    /// Physical table name.
    fn table_name(&self) -> &str;

    /// Resolves an alias or property name to the internal column name;
    /// unknown names pass through unchanged.
    fn resolve_field(&self, name: &str) -> String;

    /// True when the schema declares the field (directly or via alias).
    fn has_field(&self, name: &str) -> bool;

    fn date_time_kind(&self, column: &str) -> DateTimeKind;

    fn field_kind(&self, column: &str) -> FieldKind;

    /// DB-level type string of a physical column, e.g. `Array(String)`.
    fn db_column_type(&self, column: &str) -> Option<String>;

    fn full_text_fields(&self) -> Vec<String>;

    fn attribute_arrays(&self) -> Vec<AttributePair>;

    fn timestamp_column(&self) -> Option<String>;

    fn is_geo_point(&self, field: &str) -> bool;

    fn is_ip(&self, field: &str) -> bool;

    /// `(alias, target)` pairs declared for the index.
    fn aliases(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! A hand-rolled context for parser and transform tests.

    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct StaticContext {
        pub table: String,
        pub columns: HashMap<String, String>,
        pub aliases: HashMap<String, String>,
        pub full_text: Vec<String>,
        pub attributes: Vec<AttributePair>,
        pub timestamp: Option<String>,
        pub geo_points: Vec<String>,
        pub ips: Vec<String>,
    }

    impl StaticContext {
        pub fn new(table: &str) -> Self {
            Self { table: table.to_string(), ..Default::default() }
        }

        pub fn with_column(mut self, name: &str, db_type: &str) -> Self {
            self.columns.insert(name.to_string(), db_type.to_string());
            self
        }

        pub fn with_alias(mut self, alias: &str, target: &str) -> Self {
            self.aliases.insert(alias.to_string(), target.to_string());
            self
        }

        pub fn with_timestamp(mut self, column: &str) -> Self {
            self.timestamp = Some(column.to_string());
            self
        }

        pub fn with_full_text(mut self, fields: &[&str]) -> Self {
            self.full_text = fields.iter().map(|f| f.to_string()).collect();
            self
        }

        pub fn with_ip(mut self, field: &str) -> Self {
            self.ips.push(field.to_string());
            self
        }

        pub fn with_geo_point(mut self, field: &str) -> Self {
            self.geo_points.push(field.to_string());
            self
        }

        pub fn with_attributes(mut self, keys: &str, values: &str) -> Self {
            self.attributes.push(AttributePair {
                keys_column: keys.to_string(),
                values_column: values.to_string(),
            });
            self
        }
    }

    impl IndexContext for StaticContext {
        fn table_name(&self) -> &str {
            &self.table
        }

        fn resolve_field(&self, name: &str) -> String {
            self.aliases.get(name).cloned().unwrap_or_else(|| name.to_string())
        }

        fn has_field(&self, name: &str) -> bool {
            let resolved = self.resolve_field(name);
            self.columns.contains_key(&resolved)
                || self.geo_points.contains(&resolved)
                || self.ips.contains(&resolved)
        }

        fn date_time_kind(&self, column: &str) -> DateTimeKind {
            match self.columns.get(column) {
                Some(t) if t.starts_with("DateTime64") => DateTimeKind::DateTime64,
                Some(t) if t.starts_with("DateTime") => DateTimeKind::DateTime,
                _ => DateTimeKind::Invalid,
            }
        }

        fn field_kind(&self, column: &str) -> FieldKind {
            match self.columns.get(column) {
                Some(t) if t.starts_with("Array") => FieldKind::Array,
                Some(_) => FieldKind::BaseType,
                None => FieldKind::NotExists,
            }
        }

        fn db_column_type(&self, column: &str) -> Option<String> {
            self.columns.get(column).cloned()
        }

        fn full_text_fields(&self) -> Vec<String> {
            self.full_text.clone()
        }

        fn attribute_arrays(&self) -> Vec<AttributePair> {
            self.attributes.clone()
        }

        fn timestamp_column(&self) -> Option<String> {
            self.timestamp.clone()
        }

        fn is_geo_point(&self, field: &str) -> bool {
            self.geo_points.iter().any(|g| g == field)
        }

        fn is_ip(&self, field: &str) -> bool {
            self.ips.iter().any(|i| i == field)
        }

        fn aliases(&self) -> Vec<(String, String)> {
            let mut pairs: Vec<(String, String)> =
                self.aliases.iter().map(|(a, t)| (a.clone(), t.clone())).collect();
            pairs.sort();
            pairs
        }
    }
}
