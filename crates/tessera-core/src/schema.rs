//! Immutable schema values: databases, stores, indexes and key paths.
//!
//! Schemas are built once, validated, and then only ever replaced wholesale.
//! Builder methods take `self` by value and every "mutating" operation on a
//! validated schema returns a new schema.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SchemaError;
use crate::key::Key;
use crate::validate;

// ── Types ───────────────────────────────────────────────────────────

/// Declared primitive type of a key or key component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    /// Any valid key, stored as opaque collation bytes.
    Blob,
    /// A point in time.
    Date,
    /// An integral number.
    Integer,
    /// Any number.
    Numeric,
    /// A text value.
    Text,
}

impl DataType {
    /// Upper-case name as written in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "BLOB",
            Self::Date => "DATE",
            Self::Integer => "INTEGER",
            Self::Numeric => "NUMERIC",
            Self::Text => "TEXT",
        }
    }
}

/// A declared key type: one scalar type or one type per composite component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeSpec {
    /// A single scalar type.
    Scalar(DataType),
    /// One type per component of a composite key path.
    Composite(Vec<DataType>),
}

impl TypeSpec {
    /// The scalar type, if this is not a composite spec.
    pub fn scalar(&self) -> Option<DataType> {
        match self {
            Self::Scalar(t) => Some(*t),
            Self::Composite(_) => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Scalar(t) => t.as_str().to_string(),
            Self::Composite(ts) => {
                let names: Vec<_> = ts.iter().map(DataType::as_str).collect();
                format!("[{}]", names.join(","))
            }
        }
    }
}

impl From<DataType> for TypeSpec {
    fn from(value: DataType) -> Self {
        Self::Scalar(value)
    }
}

impl From<Vec<DataType>> for TypeSpec {
    fn from(value: Vec<DataType>) -> Self {
        Self::Composite(value)
    }
}

/// Convert a JSON value into a key honouring an optional declared type.
pub fn typed_key(value: &Value, spec: Option<&TypeSpec>) -> Option<Key> {
    match spec {
        None => Key::from_json(value),
        Some(TypeSpec::Scalar(t)) => Key::from_json_typed(value, *t),
        Some(TypeSpec::Composite(types)) => match value {
            Value::Array(items) if items.len() == types.len() => items
                .iter()
                .zip(types)
                .map(|(item, t)| Key::from_json_typed(item, *t))
                .collect::<Option<Vec<_>>>()
                .map(Key::Array),
            _ => None,
        },
    }
}

/// Whether an already-built key satisfies an optional declared type.
pub fn key_matches_type(key: &Key, spec: Option<&TypeSpec>) -> bool {
    match spec {
        None => key.is_valid(),
        Some(TypeSpec::Scalar(t)) => key.conforms_to(*t),
        Some(TypeSpec::Composite(types)) => match key {
            Key::Array(items) if items.len() == types.len() => {
                items.iter().zip(types).all(|(k, t)| k.conforms_to(*t))
            }
            _ => false,
        },
    }
}

// ── Key paths ───────────────────────────────────────────────────────

/// A dotted field path, or a list of them for composite keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPath {
    /// One field path such as `id` or `meta.created`.
    Single(String),
    /// An ordered list of field paths.
    Composite(Vec<String>),
}

impl KeyPath {
    /// Textual form: the path itself, or the comma-joined component paths.
    pub fn text(&self) -> String {
        match self {
            Self::Single(p) => p.clone(),
            Self::Composite(ps) => ps.join(","),
        }
    }

    /// Whether this is a composite path.
    pub fn is_composite(&self) -> bool {
        matches!(self, Self::Composite(_))
    }

    /// Number of components.
    pub fn arity(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Composite(ps) => ps.len(),
        }
    }

    /// Component paths in order.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            Self::Single(p) => vec![p.as_str()],
            Self::Composite(ps) => ps.iter().map(String::as_str).collect(),
        }
    }

    /// The raw JSON value at this path. Composite paths yield an array of
    /// their component values; any missing component yields `None`.
    pub fn value_of(&self, record: &Value) -> Option<Value> {
        match self {
            Self::Single(p) => lookup(record, p).cloned(),
            Self::Composite(ps) => ps
                .iter()
                .map(|p| lookup(record, p).cloned())
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
        }
    }

    /// Write `key` into `record` at this path, creating intermediate objects.
    pub fn assign(&self, record: &mut Value, key: &Key) -> Result<(), SchemaError> {
        match self {
            Self::Single(p) => assign(record, p, key.to_json()),
            Self::Composite(ps) => match key {
                Key::Array(items) if items.len() == ps.len() => {
                    for (p, item) in ps.iter().zip(items) {
                        assign(record, p, item.to_json())?;
                    }
                    Ok(())
                }
                _ => Err(SchemaError::KeyPath(format!(
                    "composite key path {} needs a tuple of {} keys",
                    self.text(),
                    ps.len()
                ))),
            },
        }
    }
}

impl From<&str> for KeyPath {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<String> for KeyPath {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<&str>> for KeyPath {
    fn from(value: Vec<&str>) -> Self {
        Self::Composite(value.into_iter().map(str::to_string).collect())
    }
}

impl From<Vec<String>> for KeyPath {
    fn from(value: Vec<String>) -> Self {
        Self::Composite(value)
    }
}

fn lookup<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(record, |current, segment| current.as_object()?.get(segment))
}

fn assign(record: &mut Value, path: &str, value: Value) -> Result<(), SchemaError> {
    let segments: Vec<&str> = path.split('.').collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(SchemaError::KeyPath("empty key path".into()));
    };
    let mut current = record;
    for segment in parents {
        let object = current
            .as_object_mut()
            .ok_or_else(|| SchemaError::KeyPath(format!("{path}: parent of {segment} is not an object")))?;
        current = object
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
    let object = current
        .as_object_mut()
        .ok_or_else(|| SchemaError::KeyPath(format!("{path}: record is not an object")))?;
    object.insert(last.to_string(), value);
    Ok(())
}

fn copy_path(from: &Value, into: &mut Value, path: &str) {
    if let Some(value) = lookup(from, path) {
        // Only fails for non-object parents, which cannot occur in a fresh projection.
        let _ = assign(into, path, value.clone());
    }
}

// ── Index schema ────────────────────────────────────────────────────

/// An index over one store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSchema {
    name: String,
    key_path: KeyPath,
    key_type: Option<TypeSpec>,
    unique: bool,
    multi_entry: bool,
}

impl IndexSchema {
    /// A non-unique index over `key_path`, named after the path text.
    pub fn new(key_path: impl Into<KeyPath>) -> Self {
        let key_path = key_path.into();
        Self {
            name: key_path.text(),
            key_path,
            key_type: None,
            unique: false,
            multi_entry: false,
        }
    }

    /// Give the index an explicit name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Declare the indexed value type.
    pub fn with_type(mut self, key_type: impl Into<TypeSpec>) -> Self {
        self.key_type = Some(key_type.into());
        self
    }

    /// Mark the index unique.
    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = unique;
        self
    }

    /// Index each element of an array value separately.
    pub fn with_multi_entry(mut self, multi_entry: bool) -> Self {
        self.multi_entry = multi_entry;
        self
    }

    /// Index name, unique within its store.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the indexed value inside each record.
    pub fn key_path(&self) -> &KeyPath {
        &self.key_path
    }

    /// Declared type of the indexed value, if any.
    pub fn key_type(&self) -> Option<&TypeSpec> {
        self.key_type.as_ref()
    }

    /// Whether two records may not share an index key.
    pub fn unique(&self) -> bool {
        self.unique
    }

    /// Whether array values are indexed element by element.
    pub fn multi_entry(&self) -> bool {
        self.multi_entry
    }

    /// The index key of a non-multiEntry index. Missing fields and values
    /// that are not valid keys of the declared type yield `None`.
    pub fn extract_key(&self, record: &Value) -> Option<Key> {
        let raw = self.key_path.value_of(record)?;
        typed_key(&raw, self.key_type.as_ref())
    }

    /// Every key this record contributes to the index.
    ///
    /// For multiEntry indexes over an array value that is each distinct
    /// element that is a valid key, in first-seen order. Otherwise at most
    /// one key.
    pub fn index_keys(&self, record: &Value) -> Vec<Key> {
        if !self.multi_entry {
            return self.extract_key(record).into_iter().collect();
        }
        let Some(raw) = self.key_path.value_of(record) else {
            return Vec::new();
        };
        let elements = match &raw {
            Value::Array(items) => items.as_slice(),
            single => std::slice::from_ref(single),
        };
        let mut keys: Vec<Key> = Vec::new();
        for element in elements {
            if let Some(key) = typed_key(element, self.key_type.as_ref()) {
                if !keys.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    pub(crate) fn describe(&self) -> String {
        let mut out = format!("{} on {}", self.name, self.key_path.text());
        if let Some(t) = &self.key_type {
            out.push_str(&format!(" type {}", t.describe()));
        }
        if self.unique {
            out.push_str(" unique");
        }
        if self.multi_entry {
            out.push_str(" multiEntry");
        }
        out
    }
}

// ── Store schema ────────────────────────────────────────────────────

/// One object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSchema {
    name: String,
    key_path: Option<KeyPath>,
    auto_increment: bool,
    key_type: Option<TypeSpec>,
    indexes: Vec<IndexSchema>,
    fixed: bool,
    dispatch_events: bool,
}

impl StoreSchema {
    /// A store with out-of-line keys and no indexes.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: None,
            auto_increment: false,
            key_type: None,
            indexes: Vec::new(),
            fixed: false,
            dispatch_events: false,
        }
    }

    /// Use an inline key path.
    pub fn with_key_path(mut self, key_path: impl Into<KeyPath>) -> Self {
        self.key_path = Some(key_path.into());
        self
    }

    /// Generate integer keys for records written without one.
    pub fn with_auto_increment(mut self, auto_increment: bool) -> Self {
        self.auto_increment = auto_increment;
        self
    }

    /// Declare the primary key type.
    pub fn with_key_type(mut self, key_type: impl Into<TypeSpec>) -> Self {
        self.key_type = Some(key_type.into());
        self
    }

    /// Append an index.
    pub fn with_index(mut self, index: IndexSchema) -> Self {
        self.indexes.push(index);
        self
    }

    /// Persist only the key path and indexed fields of each record.
    pub fn with_fixed(mut self, fixed: bool) -> Self {
        self.fixed = fixed;
        self
    }

    /// Request change events; storage ignores the flag.
    pub fn with_dispatch_events(mut self, dispatch_events: bool) -> Self {
        self.dispatch_events = dispatch_events;
        self
    }

    /// Store name, unique within the database.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The inline key path; `None` means keys are supplied out of line.
    pub fn key_path(&self) -> Option<&KeyPath> {
        self.key_path.as_ref()
    }

    /// Whether the store generates keys.
    pub fn auto_increment(&self) -> bool {
        self.auto_increment
    }

    /// Declared primary key type, if any.
    pub fn key_type(&self) -> Option<&TypeSpec> {
        self.key_type.as_ref()
    }

    /// Indexes in declaration order.
    pub fn indexes(&self) -> &[IndexSchema] {
        &self.indexes
    }

    /// Whether only key and indexed fields are persisted.
    pub fn fixed(&self) -> bool {
        self.fixed
    }

    /// Whether change events are requested for this store.
    pub fn dispatch_events(&self) -> bool {
        self.dispatch_events
    }

    /// A new, validated store schema with `index` appended.
    pub fn add_index(&self, index: IndexSchema) -> Result<StoreSchema, SchemaError> {
        let next = self.clone().with_index(index);
        let mut issues = Vec::new();
        validate::validate_store(&next, &mut issues);
        if issues.is_empty() {
            Ok(next)
        } else {
            Err(SchemaError::Invalid(issues))
        }
    }

    /// Look up an index by name.
    pub fn index(&self, name: &str) -> Option<&IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Look up an index by name, failing with [`SchemaError::UnknownIndex`].
    pub fn require_index(&self, name: &str) -> Result<&IndexSchema, SchemaError> {
        self.index(name).ok_or_else(|| SchemaError::UnknownIndex {
            store: self.name.clone(),
            index: name.to_string(),
        })
    }

    /// Whether an index with this name or key path text exists.
    pub fn has_index(&self, name_or_path: &str) -> bool {
        self.indexes
            .iter()
            .any(|i| i.name == name_or_path || i.key_path.text() == name_or_path)
    }

    /// The primary key of a record with an inline key path.
    ///
    /// Returns `None` when the store has no key path, a segment is missing,
    /// or the value is not a valid key of the declared type.
    pub fn extract_key(&self, record: &Value) -> Option<Key> {
        let raw = self.key_path.as_ref()?.value_of(record)?;
        typed_key(&raw, self.key_type.as_ref())
    }

    /// Whether the record carries any value at the key path.
    pub fn has_key_value(&self, record: &Value) -> bool {
        self.key_path
            .as_ref()
            .and_then(|kp| kp.value_of(record))
            .is_some()
    }

    /// Whether `key` is acceptable as a primary key of this store.
    pub fn accepts_key(&self, key: &Key) -> bool {
        key_matches_type(key, self.key_type.as_ref())
    }

    /// A copy of `record` with `key` written at the key path.
    pub fn set_key_value(&self, record: &Value, key: &Key) -> Result<Value, SchemaError> {
        let key_path = self.key_path.as_ref().ok_or_else(|| {
            SchemaError::KeyPath(format!("store {} has out-of-line keys", self.name))
        })?;
        let mut out = record.clone();
        key_path.assign(&mut out, key)?;
        Ok(out)
    }

    /// The record as persisted: for fixed stores only the key path and the
    /// indexed fields survive.
    pub fn project_fixed(&self, record: &Value) -> Value {
        if !self.fixed {
            return record.clone();
        }
        let mut out = Value::Object(Map::new());
        let paths = self
            .key_path
            .iter()
            .chain(self.indexes.iter().map(|i| &i.key_path));
        for key_path in paths {
            for path in key_path.paths() {
                copy_path(record, &mut out, path);
            }
        }
        out
    }

    pub(crate) fn describe_key(&self) -> String {
        let mut out = match &self.key_path {
            Some(kp) => format!("keyPath {}", kp.text()),
            None => "out-of-line keys".to_string(),
        };
        if let Some(t) = &self.key_type {
            out.push_str(&format!(" type {}", t.describe()));
        }
        if self.auto_increment {
            out.push_str(" autoIncrement");
        }
        out
    }
}

// ── Database schema ─────────────────────────────────────────────────

/// The full schema of one database.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatabaseSchema {
    version: Option<u32>,
    stores: Vec<StoreSchema>,
}

impl DatabaseSchema {
    /// Build and validate a schema from its stores.
    pub fn new(stores: Vec<StoreSchema>) -> Result<Self, SchemaError> {
        let schema = Self {
            version: None,
            stores,
        };
        validate::validate_schema(&schema).map_err(SchemaError::Invalid)?;
        Ok(schema)
    }

    /// The same schema with an explicit version.
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    /// Explicit or assigned version; `None` until assigned.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Stores in declaration order.
    pub fn stores(&self) -> &[StoreSchema] {
        &self.stores
    }

    /// Look up a store by name.
    pub fn store(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.iter().find(|s| s.name == name)
    }

    /// Look up a store, failing with [`SchemaError::UnknownStore`].
    pub fn require_store(&self, name: &str) -> Result<&StoreSchema, SchemaError> {
        self.store(name)
            .ok_or_else(|| SchemaError::UnknownStore(name.to_string()))
    }

    /// Whether a store with this name exists.
    pub fn has_store(&self, name: &str) -> bool {
        self.store(name).is_some()
    }

    /// A new, validated schema with `store` appended.
    pub fn add_store(&self, store: StoreSchema) -> Result<DatabaseSchema, SchemaError> {
        let mut stores = self.stores.clone();
        stores.push(store);
        let next = Self {
            version: self.version,
            stores,
        };
        validate::validate_schema(&next).map_err(SchemaError::Invalid)?;
        Ok(next)
    }

    /// A new, validated schema with the named store removed.
    pub fn remove_store(&self, name: &str) -> Result<DatabaseSchema, SchemaError> {
        self.require_store(name)?;
        Ok(Self {
            version: self.version,
            stores: self.stores.iter().filter(|s| s.name != name).cloned().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn people() -> StoreSchema {
        StoreSchema::new("people")
            .with_key_path("id")
            .with_key_type(DataType::Numeric)
            .with_index(IndexSchema::new("email").with_unique(true))
            .with_index(IndexSchema::new("tags").with_multi_entry(true))
            .with_index(IndexSchema::new(vec!["last", "first"]))
    }

    #[test]
    fn extract_key_walks_dotted_paths() {
        let store = StoreSchema::new("s").with_key_path("meta.id");
        assert_eq!(
            store.extract_key(&json!({"meta": {"id": "x"}})),
            Some(Key::from("x"))
        );
        assert_eq!(store.extract_key(&json!({"meta": {}})), None);
        assert_eq!(store.extract_key(&json!({"meta": 3})), None);
        assert!(!store.has_key_value(&json!({"other": 1})));
    }

    #[test]
    fn extract_key_respects_declared_type() {
        let store = people();
        assert_eq!(store.extract_key(&json!({"id": 4})), Some(Key::from(4)));
        assert_eq!(store.extract_key(&json!({"id": "4"})), None);
        assert!(store.has_key_value(&json!({"id": "4"})));
    }

    #[test]
    fn composite_paths() {
        let store = StoreSchema::new("s").with_key_path(vec!["a", "b"]);
        let key = store.extract_key(&json!({"a": 1, "b": "z"})).unwrap();
        assert_eq!(key, Key::from(vec![Key::from(1), Key::from("z")]));
        assert_eq!(store.extract_key(&json!({"a": 1})), None);

        let written = store.set_key_value(&json!({}), &key).unwrap();
        assert_eq!(written, json!({"a": 1, "b": "z"}));
        assert!(store.set_key_value(&json!({}), &Key::from(1)).is_err());
    }

    #[test]
    fn set_key_value_creates_parents() {
        let store = StoreSchema::new("s").with_key_path("meta.id");
        let out = store.set_key_value(&json!({"v": 1}), &Key::from(9)).unwrap();
        assert_eq!(out, json!({"v": 1, "meta": {"id": 9}}));
        assert!(store.set_key_value(&json!([1]), &Key::from(9)).is_err());
    }

    #[test]
    fn multi_entry_keys_are_distinct_and_valid() {
        let store = people();
        let tags = store.index("tags").unwrap();
        let keys = tags.index_keys(&json!({"id": 1, "tags": ["b", "a", "b", null, {"x": 1}]}));
        assert_eq!(keys, vec![Key::from("b"), Key::from("a")]);
        assert_eq!(tags.index_keys(&json!({"id": 1, "tags": "solo"})), vec![Key::from("solo")]);
        assert!(tags.index_keys(&json!({"id": 1})).is_empty());

        let name = store.index("last,first").unwrap();
        assert_eq!(
            name.index_keys(&json!({"last": "Doe", "first": "Jo"})),
            vec![Key::from(vec![Key::from("Doe"), Key::from("Jo")])]
        );
    }

    #[test]
    fn index_lookup() {
        let store = people();
        assert!(store.has_index("email"));
        assert!(store.has_index("last,first"));
        assert!(!store.has_index("missing"));
        assert!(matches!(
            store.require_index("missing"),
            Err(SchemaError::UnknownIndex { .. })
        ));
    }

    #[test]
    fn add_index_returns_new_schema() {
        let store = people();
        let next = store.add_index(IndexSchema::new("age")).unwrap();
        assert!(next.has_index("age"));
        assert!(!store.has_index("age"));
        assert!(store.add_index(IndexSchema::new("email")).is_err());
    }

    #[test]
    fn project_fixed_keeps_key_and_indexed_fields() {
        let store = StoreSchema::new("s")
            .with_key_path("id")
            .with_index(IndexSchema::new("meta.kind"))
            .with_fixed(true);
        let record = json!({"id": 1, "meta": {"kind": "a", "note": "x"}, "body": "long"});
        assert_eq!(
            store.project_fixed(&record),
            json!({"id": 1, "meta": {"kind": "a"}})
        );
        let open = StoreSchema::new("s").with_key_path("id");
        assert_eq!(open.project_fixed(&record), record);
    }

    #[test]
    fn database_add_store() {
        let db = DatabaseSchema::new(vec![people()]).unwrap();
        let next = db.add_store(StoreSchema::new("notes")).unwrap();
        assert!(next.has_store("notes"));
        assert!(!db.has_store("notes"));
        assert!(db.add_store(people()).is_err());
        assert!(next.remove_store("notes").unwrap().store("notes").is_none());
    }
}
