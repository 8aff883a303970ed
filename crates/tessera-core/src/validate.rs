use std::collections::HashSet;

use crate::error::SchemaIssue;
use crate::schema::{DataType, DatabaseSchema, KeyPath, StoreSchema, TypeSpec};

/// Prefix reserved for internal tables and columns.
pub const RESERVED_PREFIX: &str = "__";

/// Validate a database schema. Returns every problem found, not just the first.
pub fn validate_schema(schema: &DatabaseSchema) -> Result<(), Vec<SchemaIssue>> {
    let mut issues = Vec::new();

    let mut names = HashSet::new();
    for store in schema.stores() {
        if !names.insert(store.name()) {
            issues.push(SchemaIssue::store(store.name(), "duplicate store name"));
        }
        validate_store(store, &mut issues);
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Validate one store and its indexes, appending problems to `issues`.
pub(crate) fn validate_store(store: &StoreSchema, issues: &mut Vec<SchemaIssue>) {
    let name = store.name();
    if name.is_empty() {
        issues.push(SchemaIssue::global("store name must not be empty"));
    } else if name.starts_with(RESERVED_PREFIX) {
        issues.push(SchemaIssue::store(
            name,
            format!("store names starting with {RESERVED_PREFIX} are reserved"),
        ));
    }

    if let Some(kp) = store.key_path() {
        for message in key_path_problems(kp) {
            issues.push(SchemaIssue::store(name, format!("key path: {message}")));
        }
    }

    if let Some(message) = type_problem(store.key_path(), store.key_type()) {
        issues.push(SchemaIssue::store(name, message));
    }

    if store.auto_increment() {
        if store.key_path().is_some_and(KeyPath::is_composite) {
            issues.push(SchemaIssue::store(
                name,
                "autoIncrement requires a single or absent key path",
            ));
        }
        match store.key_type().and_then(TypeSpec::scalar) {
            Some(DataType::Integer | DataType::Numeric) => {}
            _ => issues.push(SchemaIssue::store(
                name,
                "autoIncrement requires an INTEGER or NUMERIC key type",
            )),
        }
    }

    let mut index_names = HashSet::new();
    let mut columns = HashSet::new();
    for index in store.indexes() {
        let index_name = index.name();
        if index_name.is_empty() {
            issues.push(SchemaIssue::store(name, "index name must not be empty"));
        } else if !index_names.insert(index_name) {
            issues.push(SchemaIssue::index(name, index_name, "duplicate index name"));
        }

        for message in key_path_problems(index.key_path()) {
            issues.push(SchemaIssue::index(name, index_name, format!("key path: {message}")));
        }

        if let Some(message) = type_problem(Some(index.key_path()), index.key_type()) {
            issues.push(SchemaIssue::index(name, index_name, message));
        }

        if index.multi_entry() && index.key_path().is_composite() {
            issues.push(SchemaIssue::index(
                name,
                index_name,
                "multiEntry indexes cannot use a composite key path",
            ));
        }

        if !index.multi_entry() && !columns.insert(index.key_path().text()) {
            issues.push(SchemaIssue::index(
                name,
                index_name,
                format!(
                    "another index already covers key path {}",
                    index.key_path().text()
                ),
            ));
        }
    }
}

fn key_path_problems(kp: &KeyPath) -> Vec<String> {
    let mut out = Vec::new();
    let paths = kp.paths();
    if paths.is_empty() {
        out.push("composite key path must list at least one field".to_string());
    }
    for path in paths {
        if path.is_empty() || path.split('.').any(str::is_empty) {
            out.push(format!("{path:?} has an empty segment"));
        } else if path.starts_with(RESERVED_PREFIX) {
            out.push(format!("{path:?} uses the reserved {RESERVED_PREFIX} prefix"));
        } else if path.contains(',') {
            out.push(format!("{path:?} must not contain ','"));
        }
    }
    out
}

fn type_problem(kp: Option<&KeyPath>, spec: Option<&TypeSpec>) -> Option<String> {
    let composite_arity = kp.filter(|k| k.is_composite()).map(KeyPath::arity);
    match (composite_arity, spec?) {
        (Some(_), TypeSpec::Scalar(_)) => {
            Some("a composite key path cannot declare a scalar type".to_string())
        }
        (None, TypeSpec::Composite(_)) => {
            Some("a composite type requires a composite key path".to_string())
        }
        (Some(arity), TypeSpec::Composite(types)) if arity != types.len() => Some(format!(
            "composite type lists {} types for {arity} key path components",
            types.len()
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::IndexSchema;

    fn messages(stores: Vec<StoreSchema>) -> Vec<String> {
        match DatabaseSchema::new(stores) {
            Ok(_) => Vec::new(),
            Err(e) => e.issues().iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn valid_schema_passes() {
        let store = StoreSchema::new("s")
            .with_key_path("id")
            .with_auto_increment(true)
            .with_key_type(DataType::Integer)
            .with_index(IndexSchema::new("tags").with_multi_entry(true))
            .with_index(IndexSchema::new(vec!["a", "b"]).with_type(vec![DataType::Text, DataType::Date]));
        assert!(messages(vec![store]).is_empty());
    }

    #[test]
    fn collects_every_problem() {
        let errors = messages(vec![
            StoreSchema::new(""),
            StoreSchema::new("__meta"),
            StoreSchema::new("dup"),
            StoreSchema::new("dup"),
        ]);
        assert_eq!(errors.len(), 3, "{errors:?}");
        assert!(errors.iter().any(|e| e.contains("must not be empty")));
        assert!(errors.iter().any(|e| e.contains("reserved")));
        assert!(errors.iter().any(|e| e.contains("[store=dup] duplicate store name")));
    }

    #[test]
    fn auto_increment_rules() {
        let untyped = StoreSchema::new("s").with_auto_increment(true);
        assert_eq!(messages(vec![untyped]).len(), 1);

        let text = StoreSchema::new("s")
            .with_auto_increment(true)
            .with_key_type(DataType::Text);
        assert_eq!(messages(vec![text]).len(), 1);

        let composite = StoreSchema::new("s")
            .with_key_path(vec!["a", "b"])
            .with_auto_increment(true)
            .with_key_type(DataType::Integer);
        // composite path with scalar type, and autoIncrement on a composite path
        assert_eq!(messages(vec![composite]).len(), 2);
    }

    #[test]
    fn type_arity_must_match() {
        let store = StoreSchema::new("s")
            .with_key_path(vec!["a", "b"])
            .with_key_type(vec![DataType::Text]);
        let errors = messages(vec![store]);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("1 types for 2"));
    }

    #[test]
    fn index_rules() {
        let store = StoreSchema::new("s")
            .with_index(IndexSchema::new("a"))
            .with_index(IndexSchema::new("a").with_name("a2"))
            .with_index(IndexSchema::new("b").with_name("a"))
            .with_index(IndexSchema::new(vec!["x", "y"]).with_multi_entry(true))
            .with_index(IndexSchema::new("bad..path"));
        let errors = messages(vec![store]);
        assert!(errors.iter().any(|e| e.contains("already covers key path a")));
        assert!(errors.iter().any(|e| e.contains("[store=s, index=a] duplicate index name")));
        assert!(errors.iter().any(|e| e.contains("composite key path")));
        assert!(errors.iter().any(|e| e.contains("empty segment")));
    }

    #[test]
    fn multi_entry_indexes_may_share_a_path() {
        let store = StoreSchema::new("s")
            .with_index(IndexSchema::new("tags").with_multi_entry(true))
            .with_index(IndexSchema::new("tags").with_name("tags_all"));
        assert!(messages(vec![store]).is_empty());
    }
}
