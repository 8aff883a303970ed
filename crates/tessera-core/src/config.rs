//! Serializable schema configuration.
//!
//! The configuration is the external, camelCase form of a
//! [`DatabaseSchema`]. It is read from JSON or TOML and converted into the
//! validated schema with [`DatabaseSchema::from_config`].
//!
//! ```
//! use tessera_core::{DatabaseSchema, SchemaConfig};
//!
//! let config = SchemaConfig::from_json_str(
//!     r#"{ "version": 1, "stores": [
//!         { "name": "S", "keyPath": "id", "type": "NUMERIC",
//!           "indexes": [{ "keyPath": "tags", "multiEntry": true }] }
//!     ] }"#,
//! ).unwrap();
//! let schema = DatabaseSchema::from_config(&config).unwrap();
//! assert!(schema.store("S").unwrap().has_index("tags"));
//! assert_eq!(schema.to_config(), config);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;
use crate::schema::{DatabaseSchema, IndexSchema, KeyPath, StoreSchema, TypeSpec};

fn is_false(value: &bool) -> bool {
    !*value
}

/// Top-level schema configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaConfig {
    /// Explicit schema version. Assigned on first connect when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    /// Store definitions in order.
    #[serde(default)]
    pub stores: Vec<StoreConfig>,
}

/// Configuration of one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    /// Unique store name.
    pub name: String,
    /// Inline key path. Absent for out-of-line keys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<KeyPath>,
    /// Generate keys for records that lack one.
    #[serde(default, skip_serializing_if = "is_false")]
    pub auto_increment: bool,
    /// Declared key type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<TypeSpec>,
    /// Persist only key and indexed fields.
    #[serde(default, skip_serializing_if = "is_false")]
    pub fixed: bool,
    /// Emit mutation events for this store.
    #[serde(default, skip_serializing_if = "is_false")]
    pub dispatch_events: bool,
    /// Index definitions in order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexConfig>,
}

/// Configuration of one index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexConfig {
    /// Index name; defaults to the key path text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Indexed field path(s).
    pub key_path: KeyPath,
    /// Declared value type.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub key_type: Option<TypeSpec>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub multi_entry: bool,
}

impl SchemaConfig {
    /// Parse a JSON configuration.
    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))
    }

    /// Parse a TOML configuration. Stores are written as `[[stores]]` tables.
    pub fn from_toml_str(text: &str) -> Result<Self, SchemaError> {
        toml::from_str(text).map_err(|e| SchemaError::Parse(e.to_string()))
    }

    /// Serialize to pretty JSON.
    pub fn to_json_string(&self) -> Result<String, SchemaError> {
        serde_json::to_string_pretty(self).map_err(|e| SchemaError::Parse(e.to_string()))
    }
}

impl StoreConfig {
    fn to_schema(&self) -> StoreSchema {
        let mut store = StoreSchema::new(&self.name)
            .with_auto_increment(self.auto_increment)
            .with_fixed(self.fixed)
            .with_dispatch_events(self.dispatch_events);
        if let Some(kp) = &self.key_path {
            store = store.with_key_path(kp.clone());
        }
        if let Some(t) = &self.key_type {
            store = store.with_key_type(t.clone());
        }
        for index in &self.indexes {
            store = store.with_index(index.to_schema());
        }
        store
    }

    fn from_schema(store: &StoreSchema) -> Self {
        Self {
            name: store.name().to_string(),
            key_path: store.key_path().cloned(),
            auto_increment: store.auto_increment(),
            key_type: store.key_type().cloned(),
            fixed: store.fixed(),
            dispatch_events: store.dispatch_events(),
            indexes: store.indexes().iter().map(IndexConfig::from_schema).collect(),
        }
    }
}

impl IndexConfig {
    fn to_schema(&self) -> IndexSchema {
        let mut index = IndexSchema::new(self.key_path.clone())
            .with_unique(self.unique)
            .with_multi_entry(self.multi_entry);
        if let Some(name) = &self.name {
            index = index.with_name(name);
        }
        if let Some(t) = &self.key_type {
            index = index.with_type(t.clone());
        }
        index
    }

    fn from_schema(index: &IndexSchema) -> Self {
        let path_text = index.key_path().text();
        Self {
            name: (index.name() != path_text).then(|| index.name().to_string()),
            key_path: index.key_path().clone(),
            key_type: index.key_type().cloned(),
            unique: index.unique(),
            multi_entry: index.multi_entry(),
        }
    }
}

impl DatabaseSchema {
    /// Build and validate a schema from configuration.
    pub fn from_config(config: &SchemaConfig) -> Result<Self, SchemaError> {
        let stores = config.stores.iter().map(StoreConfig::to_schema).collect();
        let schema = DatabaseSchema::new(stores)?;
        Ok(match config.version {
            Some(v) => schema.with_version(v),
            None => schema,
        })
    }

    /// The canonical configuration of this schema.
    pub fn to_config(&self) -> SchemaConfig {
        SchemaConfig {
            version: self.version(),
            stores: self.stores().iter().map(StoreConfig::from_schema).collect(),
        }
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json_str(text: &str) -> Result<Self, SchemaError> {
        Self::from_config(&SchemaConfig::from_json_str(text)?)
    }

    /// Parse and validate a TOML configuration.
    pub fn from_toml_str(text: &str) -> Result<Self, SchemaError> {
        Self::from_config(&SchemaConfig::from_toml_str(text)?)
    }
}
