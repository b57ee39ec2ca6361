//! Per-index schemas composed from configuration and the live catalog.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use lumber_query::context::{
    AttributePair, DateTimeKind, FieldKind, IndexContext,
};

use crate::config::{GatewayConfig, IndexConfig};
use crate::table::{Table, TableCatalog};

/// The closed set of field type tags.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Keyword,
    Text,
    Long,
    UnsignedLong,
    Integer,
    Short,
    Byte,
    Float,
    Double,
    Boolean,
    Date,
    DateNanos,
    Ip,
    GeoPoint,
    Object,
    Array(Box<FieldType>),
}

impl FieldType {
    /// Parses a configured type name. `alias` is handled by the caller.
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "keyword" => Self::Keyword,
            "text" => Self::Text,
            "long" => Self::Long,
            "unsigned_long" => Self::UnsignedLong,
            "integer" => Self::Integer,
            "short" => Self::Short,
            "byte" => Self::Byte,
            "float" => Self::Float,
            "double" => Self::Double,
            "boolean" => Self::Boolean,
            "date" => Self::Date,
            "date_nanos" => Self::DateNanos,
            "ip" => Self::Ip,
            "geo_point" => Self::GeoPoint,
            "object" => Self::Object,
            _ => return None,
        })
    }
}

/// Maps database column types onto the tag set. Every type maps to exactly
/// one tag; unknowns fall back to text at the call site.
pub struct ClickhouseTypeAdapter;

impl ClickhouseTypeAdapter {
    pub fn convert(&self, type_name: &str) -> Option<FieldType> {
        let unwrapped = unwrap_modifiers(type_name);
        if let Some(inner) = unwrapped.strip_prefix("Array(").and_then(|s| s.strip_suffix(')')) {
            return self.convert(inner).map(|t| FieldType::Array(Box::new(t)));
        }
        Some(match unwrapped {
            "String" | "FixedString" => FieldType::Keyword,
            "Int8" => FieldType::Byte,
            "Int16" => FieldType::Short,
            "Int32" | "UInt8" | "UInt16" => FieldType::Integer,
            "Int64" | "UInt32" => FieldType::Long,
            "UInt64" | "UInt128" | "UInt256" => FieldType::UnsignedLong,
            "Float32" => FieldType::Float,
            "Float64" => FieldType::Double,
            "Bool" => FieldType::Boolean,
            "Date" | "Date32" | "DateTime" => FieldType::Date,
            "DateTime64" => FieldType::DateNanos,
            "IPv4" | "IPv6" => FieldType::Ip,
            "Point" => FieldType::GeoPoint,
            "Tuple" | "JSON" | "Map" => FieldType::Object,
            _ => return None,
        })
    }
}

/// Strips type parameters and wrapping modifiers:
/// `LowCardinality(Nullable(String))` -> `String`, `DateTime64(3)` ->
/// `DateTime64`.
fn unwrap_modifiers(type_name: &str) -> &str {
    let mut t = type_name.trim();
    loop {
        let mut changed = false;
        for wrapper in ["Nullable(", "LowCardinality(", "SimpleAggregateFunction("] {
            if let Some(inner) = t.strip_prefix(wrapper).and_then(|s| s.strip_suffix(')')) {
                t = inner.trim();
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }
    match t.split_once('(') {
        Some((head, _)) if head != "Array" => head,
        _ => t,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub property_name: String,
    pub internal_property_name: String,
    pub field_type: FieldType,
    pub is_full_text: bool,
}

/// An immutable snapshot of one index's schema.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub fields: HashMap<String, Field>,
    pub aliases: HashMap<String, String>,
}

impl Schema {
    /// Aliases first, then fields, then nothing. Never panics on unknown
    /// names.
    pub fn resolve_field(&self, name: &str) -> Option<&Field> {
        if let Some(target) = self.aliases.get(name) {
            return self.fields.get(target);
        }
        self.fields.get(name)
    }

    pub fn field_type(&self, name: &str) -> Option<&FieldType> {
        self.resolve_field(name).map(|f| &f.field_type)
    }
}

/// Recomputes schemas on demand from configuration plus the catalog; static
/// declarations win over discovered columns, aliases apply last.
pub struct SchemaRegistry {
    config: Arc<GatewayConfig>,
    catalog: Arc<TableCatalog>,
    adapter: ClickhouseTypeAdapter,
}

impl SchemaRegistry {
    pub fn new(config: Arc<GatewayConfig>, catalog: Arc<TableCatalog>) -> Self {
        Self { config, catalog, adapter: ClickhouseTypeAdapter }
    }

    pub fn all_schemas(&self) -> HashMap<String, Schema> {
        let mut schemas = HashMap::new();
        for (index_name, index_config) in self.config.enabled_indexes() {
            schemas.insert(index_name.clone(), self.compose(index_name, index_config));
        }
        schemas
    }

    pub fn find_schema(&self, index_name: &str) -> Option<Schema> {
        let index_config = self.config.index(index_name)?;
        Some(self.compose(index_name, index_config))
    }

    fn compose(&self, index_name: &str, index_config: &IndexConfig) -> Schema {
        let mut schema = Schema::default();
        self.populate_from_static_configuration(index_config, &mut schema);
        self.populate_from_table_definition(index_name, index_config, &mut schema);
        self.populate_aliases(index_config, &mut schema);
        schema
    }

    fn populate_from_static_configuration(&self, cfg: &IndexConfig, schema: &mut Schema) {
        if cfg.deprecated_config_in_use() {
            for (field_name, type_name) in &cfg.mappings {
                match FieldType::parse(type_name) {
                    Some(resolved) => {
                        schema.fields.insert(
                            field_name.clone(),
                            make_field(field_name, resolved, cfg.is_full_text_field(field_name)),
                        );
                    }
                    None => warn!(
                        field = %field_name, type_name = %type_name,
                        "invalid configuration: type not supported"
                    ),
                }
            }
        } else if let Some(static_schema) = &cfg.static_schema {
            for (field_name, field) in &static_schema.fields {
                if field.field_type == "alias" {
                    continue;
                }
                match FieldType::parse(&field.field_type) {
                    Some(resolved) => {
                        schema.fields.insert(
                            field_name.clone(),
                            make_field(field_name, resolved, cfg.is_full_text_field(field_name)),
                        );
                    }
                    None => warn!(
                        field = %field_name, type_name = %field.field_type,
                        "invalid configuration: type not supported"
                    ),
                }
            }
        }
    }

    fn populate_from_table_definition(
        &self,
        index_name: &str,
        cfg: &IndexConfig,
        schema: &mut Schema,
    ) {
        let Some(table) = self.catalog.get(index_name) else {
            return;
        };
        debug!(table = %index_name, "loading schema from table definition");
        for column in table.columns() {
            if schema.fields.contains_key(&column.name) {
                continue;
            }
            let field_type = match self.adapter.convert(&column.type_name) {
                Some(t) => t,
                None => {
                    debug!(type_name = %column.type_name, "type not supported, falling back to text");
                    FieldType::Text
                }
            };
            schema.fields.insert(
                column.name.clone(),
                make_field(&column.name, field_type, cfg.is_full_text_field(&column.name)),
            );
        }
    }

    fn populate_aliases(&self, cfg: &IndexConfig, schema: &mut Schema) {
        if cfg.deprecated_config_in_use() {
            for (alias_name, alias) in &cfg.aliases {
                if schema.fields.contains_key(&alias.target) {
                    schema.aliases.insert(alias_name.clone(), alias.target.clone());
                } else {
                    debug!(alias = %alias_name, target = %alias.target, "alias target not found, possibly not yet loaded");
                }
            }
        } else if let Some(static_schema) = &cfg.static_schema {
            for (field_name, field) in &static_schema.fields {
                if field.field_type != "alias" {
                    continue;
                }
                match &field.aliased_field {
                    Some(target) if schema.fields.contains_key(target) => {
                        schema.aliases.insert(field_name.clone(), target.clone());
                    }
                    Some(target) => {
                        debug!(alias = %field_name, target = %target, "alias target not found, possibly not yet loaded");
                    }
                    None => {
                        warn!(alias = %field_name, "alias field without aliased-field");
                    }
                }
            }
        }
    }
}

fn make_field(name: &str, field_type: FieldType, is_full_text: bool) -> Field {
    Field {
        property_name: name.to_string(),
        internal_property_name: name.to_string(),
        field_type,
        is_full_text,
    }
}

/// The view one query translation runs against: a table snapshot plus its
/// composed schema.
pub struct IndexView {
    pub table: Arc<Table>,
    pub schema: Schema,
}

impl IndexContext for IndexView {
    fn table_name(&self) -> &str {
        &self.table.name
    }

    fn resolve_field(&self, name: &str) -> String {
        match self.schema.resolve_field(name) {
            Some(field) => field.internal_property_name.clone(),
            None => name.to_string(),
        }
    }

    fn has_field(&self, name: &str) -> bool {
        self.schema.resolve_field(name).is_some()
    }

    fn date_time_kind(&self, column: &str) -> DateTimeKind {
        self.table.date_time_kind(column)
    }

    fn field_kind(&self, column: &str) -> FieldKind {
        self.table.field_kind(column)
    }

    fn db_column_type(&self, column: &str) -> Option<String> {
        self.table.column(column).map(|c| c.type_name.clone())
    }

    fn full_text_fields(&self) -> Vec<String> {
        self.table.full_text_fields()
    }

    fn attribute_arrays(&self) -> Vec<AttributePair> {
        self.table.attribute_arrays.clone()
    }

    fn timestamp_column(&self) -> Option<String> {
        self.table.timestamp_column.clone()
    }

    fn is_geo_point(&self, field: &str) -> bool {
        matches!(self.schema.field_type(field), Some(FieldType::GeoPoint))
    }

    fn is_ip(&self, field: &str) -> bool {
        matches!(self.schema.field_type(field), Some(FieldType::Ip))
    }

    fn aliases(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> = self
            .schema
            .aliases
            .iter()
            .map(|(a, t)| (a.clone(), t.clone()))
            .collect();
        pairs.sort();
        pairs
    }
}
