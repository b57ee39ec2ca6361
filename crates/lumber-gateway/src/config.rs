//! YAML configuration.
//!
//! Two schema dialects are accepted per index: the current
//! `static-schema.fields` block and the deprecated `mappings`/`aliases`
//! pair. The registry prefers the new block when present.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use lumber_common::{Error, Result};

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub indexes: HashMap<String, IndexConfig>,
    #[serde(default)]
    pub ingest_statistics: bool,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub timestamp_field: Option<String>,
    #[serde(default)]
    pub full_text_fields: Vec<String>,
    /// Deprecated alias map; superseded by `static-schema` alias fields.
    #[serde(default)]
    pub aliases: HashMap<String, AliasConfig>,
    /// Deprecated field type map; superseded by `static-schema`.
    #[serde(default)]
    pub mappings: HashMap<String, String>,
    #[serde(default, rename = "static-schema")]
    pub static_schema: Option<StaticSchema>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasConfig {
    pub source: String,
    pub target: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StaticSchema {
    #[serde(default)]
    pub fields: HashMap<String, StaticField>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StaticField {
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default, rename = "aliased-field")]
    pub aliased_field: Option<String>,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).map_err(|e| Error::Configuration(e.to_string()))
    }

    pub fn enabled_indexes(&self) -> impl Iterator<Item = (&String, &IndexConfig)> {
        self.indexes.iter().filter(|(_, cfg)| cfg.enabled)
    }

    pub fn index(&self, name: &str) -> Option<&IndexConfig> {
        self.indexes.get(name).filter(|cfg| cfg.enabled)
    }
}

impl IndexConfig {
    /// True when only the deprecated mapping dialect is present.
    pub fn deprecated_config_in_use(&self) -> bool {
        self.static_schema.is_none()
    }

    pub fn is_full_text_field(&self, field: &str) -> bool {
        self.full_text_fields.iter().any(|f| f == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NEW_DIALECT: &str = r#"
indexes:
  logs:
    enabled: true
    timestampField: timestamp
    fullTextFields:
      - message
    static-schema:
      fields:
        severity:
          type: keyword
        msg:
          type: alias
          aliased-field: message
ingestStatistics: true
"#;

    const DEPRECATED_DIALECT: &str = r#"
indexes:
  logs:
    enabled: true
    timestampField: timestamp
    fullTextFields:
      - message
    mappings:
      severity: keyword
    aliases:
      msg:
        source: msg
        target: message
"#;

    #[test]
    fn test_parse_new_dialect() {
        let cfg = GatewayConfig::from_yaml(NEW_DIALECT).unwrap();
        let index = cfg.index("logs").unwrap();
        assert!(!index.deprecated_config_in_use());
        assert!(cfg.ingest_statistics);
        let schema = index.static_schema.as_ref().unwrap();
        assert_eq!(schema.fields["severity"].field_type, "keyword");
        assert_eq!(schema.fields["msg"].aliased_field.as_deref(), Some("message"));
    }

    #[test]
    fn test_parse_deprecated_dialect() {
        let cfg = GatewayConfig::from_yaml(DEPRECATED_DIALECT).unwrap();
        let index = cfg.index("logs").unwrap();
        assert!(index.deprecated_config_in_use());
        assert_eq!(index.mappings["severity"], "keyword");
        assert_eq!(index.aliases["msg"].target, "message");
    }

    #[test]
    fn test_disabled_index_is_hidden() {
        let cfg = GatewayConfig::from_yaml(
            "indexes:\n  old:\n    enabled: false\n",
        )
        .unwrap();
        assert!(cfg.index("old").is_none());
        assert_eq!(cfg.enabled_indexes().count(), 0);
    }

    #[test]
    fn test_unknown_top_level_key_is_rejected() {
        assert!(GatewayConfig::from_yaml("indexes: {}\nbogus: 1\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lumber.yaml");
        std::fs::write(&path, NEW_DIALECT).unwrap();
        let cfg = GatewayConfig::load(&path).unwrap();
        assert!(cfg.index("logs").is_some());
    }
}
