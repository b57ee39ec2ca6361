//! Physical table definitions and the live table catalog.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use lumber_query::context::{AttributePair, DateTimeKind, FieldKind};

/// One physical column with its database-level type string.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self { name: name.to_string(), type_name: type_name.to_string() }
    }

    pub fn is_array(&self) -> bool {
        self.type_name.starts_with("Array")
    }
}

/// Engine-level table settings established at first DDL.
#[derive(Debug, Clone, Default)]
pub struct TableConfig {
    pub engine: String,
    pub order_by: Vec<String>,
    pub ttl: Option<String>,
}

/// A backing table. Columns are ordered as created; readers treat the whole
/// value as an immutable snapshot, only ingest extends it.
#[derive(Debug, Clone, Default)]
pub struct Table {
    pub name: String,
    pub database: Option<String>,
    columns: Vec<Column>,
    by_name: HashMap<String, usize>,
    pub timestamp_column: Option<String>,
    pub attribute_arrays: Vec<AttributePair>,
    pub full_text_columns: Vec<String>,
    pub config: TableConfig,
}

impl Table {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), ..Default::default() }
    }

    pub fn with_column(mut self, name: &str, type_name: &str) -> Self {
        self.push_column(Column::new(name, type_name));
        self
    }

    pub fn with_timestamp(mut self, column: &str) -> Self {
        self.timestamp_column = Some(column.to_string());
        self
    }

    pub fn with_full_text(mut self, columns: &[&str]) -> Self {
        self.full_text_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Declares a paired `keys[]`/`values[]` attribute column set.
    pub fn with_attributes(mut self, keys: &str, values: &str, value_type: &str) -> Self {
        self.push_column(Column::new(keys, "Array(String)"));
        self.push_column(Column::new(values, &format!("Array({})", value_type)));
        self.attribute_arrays.push(AttributePair {
            keys_column: keys.to_string(),
            values_column: values.to_string(),
        });
        self
    }

    pub fn push_column(&mut self, column: Column) {
        if self.by_name.contains_key(&column.name) {
            return;
        }
        self.by_name.insert(column.name.clone(), self.columns.len());
        self.columns.push(column);
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// `["db".]"table"` for use in FROM clauses.
    pub fn full_table_name(&self) -> String {
        match &self.database {
            Some(db) if !db.is_empty() => format!("{}.{}", db, self.name),
            _ => self.name.clone(),
        }
    }

    /// DateTime kind of a column; prefix match because of parameterized
    /// types like `DateTime64(3, 'UTC')`.
    pub fn date_time_kind(&self, field_name: &str) -> DateTimeKind {
        match self.column(field_name) {
            Some(col) if col.type_name.starts_with("DateTime64") => DateTimeKind::DateTime64,
            Some(col) if col.type_name.starts_with("DateTime") => DateTimeKind::DateTime,
            _ => DateTimeKind::Invalid,
        }
    }

    pub fn field_kind(&self, field_name: &str) -> FieldKind {
        match self.column(field_name) {
            None => FieldKind::NotExists,
            Some(col) if col.is_array() => FieldKind::Array,
            Some(_) => FieldKind::BaseType,
        }
    }

    pub fn full_text_fields(&self) -> Vec<String> {
        self.full_text_columns.clone()
    }
}

/// Concurrent map of table definitions, keyed by table name. Writers are
/// the ingest DDL path only; last writer wins, column additions are
/// monotonic.
#[derive(Default)]
pub struct TableCatalog {
    tables: DashMap<String, Arc<Table>>,
}

impl TableCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, table: Table) {
        self.tables.insert(table.name.clone(), Arc::new(table));
    }

    pub fn get(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.tables.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    /// Tables matching an index pattern; `*` matches any run of characters.
    pub fn resolve_pattern(&self, pattern: &str) -> Vec<String> {
        self.table_names()
            .into_iter()
            .filter(|name| pattern_matches(pattern, name))
            .collect()
    }
}

/// `*`-wildcard match over the full string, comma-separated alternatives
/// allowed as in index patterns.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    pattern.split(',').any(|p| glob_matches(p.trim(), name))
}

fn glob_matches(pattern: &str, name: &str) -> bool {
    match pattern.split_once('*') {
        None => pattern == name,
        Some((head, tail)) => {
            if !name.starts_with(head) {
                return false;
            }
            let rest = &name[head.len()..];
            if tail.is_empty() {
                return true;
            }
            (0..=rest.len()).any(|i| glob_matches(tail, &rest[i..]))
        }
    }
}

/// True when the pattern can match more than one concrete index.
pub fn is_index_pattern(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains(',')
}
