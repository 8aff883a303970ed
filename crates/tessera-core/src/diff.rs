//! Structural schema differences, used at connect time to decide whether a
//! stored schema matches the configured one.

use crate::schema::{DatabaseSchema, IndexSchema, StoreSchema};

impl StoreSchema {
    /// Describe how `other` differs from `self`. Empty when equivalent.
    ///
    /// Compares the store name, key path, key type, auto-increment flag and
    /// the index set including each index's key path, type, unique and
    /// multiEntry flags.
    pub fn difference(&self, other: &StoreSchema) -> String {
        let mut out = Vec::new();
        if self.name() != other.name() {
            out.push(format!("name {} -> {}", self.name(), other.name()));
        }
        if self.key_path() != other.key_path()
            || self.key_type() != other.key_type()
            || self.auto_increment() != other.auto_increment()
        {
            out.push(format!(
                "key {} -> {}",
                self.describe_key(),
                other.describe_key()
            ));
        }
        for index in self.indexes() {
            match other.index(index.name()) {
                None => out.push(format!("index {} removed", index.name())),
                Some(theirs) if !same_index(index, theirs) => out.push(format!(
                    "index {} -> {}",
                    index.describe(),
                    theirs.describe()
                )),
                Some(_) => {}
            }
        }
        for index in other.indexes() {
            if self.index(index.name()).is_none() {
                out.push(format!("index {} added", index.describe()));
            }
        }
        out.join("; ")
    }

    /// Whether the two stores have no structural difference.
    pub fn similar(&self, other: &StoreSchema) -> bool {
        self.difference(other).is_empty()
    }
}

fn same_index(a: &IndexSchema, b: &IndexSchema) -> bool {
    a.key_path() == b.key_path()
        && a.key_type() == b.key_type()
        && a.unique() == b.unique()
        && a.multi_entry() == b.multi_entry()
}

impl DatabaseSchema {
    /// Describe how `other` differs from `self`, store by store. The version
    /// is not compared.
    pub fn difference(&self, other: &DatabaseSchema) -> String {
        let mut out = Vec::new();
        for store in self.stores() {
            match other.store(store.name()) {
                None => out.push(format!("store {} removed", store.name())),
                Some(theirs) => {
                    let diff = store.difference(theirs);
                    if !diff.is_empty() {
                        out.push(format!("store {}: {diff}", store.name()));
                    }
                }
            }
        }
        for store in other.stores() {
            if !self.has_store(store.name()) {
                out.push(format!("store {} added", store.name()));
            }
        }
        out.join("\n")
    }

    /// Whether the two schemas have no structural difference.
    pub fn similar(&self, other: &DatabaseSchema) -> bool {
        self.difference(other).is_empty()
    }

    /// Names of stores present in both schemas whose definitions differ.
    pub fn changed_stores(&self, other: &DatabaseSchema) -> Vec<String> {
        self.stores()
            .iter()
            .filter_map(|s| {
                let theirs = other.store(s.name())?;
                (!s.similar(theirs)).then(|| s.name().to_string())
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::schema::{DataType, DatabaseSchema, IndexSchema, StoreSchema};

    #[test]
    fn extra_index_is_a_difference() {
        let a = StoreSchema::new("s").with_key_path("id");
        let b = a.clone().with_index(IndexSchema::new("name"));
        let diff = a.difference(&b);
        assert!(!diff.is_empty());
        assert!(diff.contains("name"));
        assert!(a.difference(&a.clone()).is_empty());
        assert!(a.similar(&a.clone()));
    }

    #[test]
    fn index_flags_are_compared() {
        let a = StoreSchema::new("s").with_index(IndexSchema::new("tags"));
        let b = StoreSchema::new("s").with_index(IndexSchema::new("tags").with_multi_entry(true));
        let c = StoreSchema::new("s").with_index(IndexSchema::new("tags").with_type(DataType::Text));
        assert!(!a.similar(&b));
        assert!(!a.similar(&c));
    }

    #[test]
    fn fixed_and_dispatch_flags_are_not_structural() {
        let a = StoreSchema::new("s").with_key_path("id");
        let b = a.clone().with_fixed(true).with_dispatch_events(true);
        assert!(a.similar(&b));
    }

    #[test]
    fn database_difference() {
        let a = DatabaseSchema::new(vec![StoreSchema::new("a"), StoreSchema::new("b")]).unwrap();
        let b = DatabaseSchema::new(vec![
            StoreSchema::new("a").with_key_path("id"),
            StoreSchema::new("c"),
        ])
        .unwrap();
        let diff = a.difference(&b);
        assert!(diff.contains("store b removed"));
        assert!(diff.contains("store c added"));
        assert!(diff.contains("store a:"));
        assert_eq!(a.changed_stores(&b), vec!["a".to_string()]);
        assert!(a.similar(&a.clone().with_version(7)));
    }
}
