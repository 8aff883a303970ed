//! Connect-time schema reconciliation shared by every backend.

use tessera_core::DatabaseSchema;

use crate::error::{StoreError, StoreResult};

/// Structural changes needed to move a database from one schema to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradePlan {
    /// Stores only present in the new schema.
    pub created: Vec<String>,
    /// Stores only present in the old schema.
    pub dropped: Vec<String>,
    /// Stores present in both whose definitions differ. Their records are
    /// read, the store is recreated and the records are written back.
    pub rebuilt: Vec<String>,
}

impl UpgradePlan {
    pub fn between(old: Option<&DatabaseSchema>, new: &DatabaseSchema) -> Self {
        let Some(old) = old else {
            return Self {
                created: new.stores().iter().map(|s| s.name().to_string()).collect(),
                ..Self::default()
            };
        };
        Self {
            created: new
                .stores()
                .iter()
                .filter(|s| !old.has_store(s.name()))
                .map(|s| s.name().to_string())
                .collect(),
            dropped: old
                .stores()
                .iter()
                .filter(|s| !new.has_store(s.name()))
                .map(|s| s.name().to_string())
                .collect(),
            rebuilt: old.changed_stores(new),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.dropped.is_empty() && self.rebuilt.is_empty()
    }
}

/// What connecting should do with the stored and configured schemas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconcile {
    /// The stored schema matches; adopt it as is.
    Adopt(DatabaseSchema),
    /// Upgrade to this schema, whose version is already assigned.
    Upgrade(DatabaseSchema),
}

/// Decide between adopting the stored schema and upgrading to the configured one.
///
/// * nothing stored: upgrade to `max(1, configured)`;
/// * stored and structurally equal: adopt the stored version;
/// * otherwise: upgrade to `max(stored + 1, configured)`.
///
/// A configured version below the stored one is a connection error.
pub fn reconcile(
    stored: Option<DatabaseSchema>,
    configured: &DatabaseSchema,
) -> StoreResult<Reconcile> {
    let Some(stored) = stored else {
        let version = configured.version().unwrap_or(1).max(1);
        return Ok(Reconcile::Upgrade(configured.clone().with_version(version)));
    };
    let stored_version = stored.version().unwrap_or(1);
    if let Some(v) = configured.version() {
        if v < stored_version {
            return Err(StoreError::Connection(format!(
                "configured schema version {v} is older than stored version {stored_version}"
            )));
        }
    }
    if stored.similar(configured) {
        return Ok(Reconcile::Adopt(stored));
    }
    let version = configured
        .version()
        .unwrap_or(0)
        .max(stored_version.saturating_add(1));
    Ok(Reconcile::Upgrade(configured.clone().with_version(version)))
}

/// The version to assign to an explicit upgrade from `current` to `next`.
pub fn next_version(current: &DatabaseSchema, next: &DatabaseSchema) -> StoreResult<u32> {
    let current_version = current.version().unwrap_or(0);
    match next.version() {
        Some(v) if v < current_version => Err(StoreError::InvalidArgument(format!(
            "schema version {v} is older than current version {current_version}"
        ))),
        Some(v) if v > current_version => Ok(v),
        _ => Ok(current_version.saturating_add(1)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{IndexSchema, StoreSchema};

    fn schema(stores: Vec<StoreSchema>) -> DatabaseSchema {
        DatabaseSchema::new(stores).unwrap()
    }

    #[test]
    fn plan_classifies_stores() {
        let old = schema(vec![StoreSchema::new("keep"), StoreSchema::new("gone"), StoreSchema::new("change")]);
        let new = schema(vec![
            StoreSchema::new("keep"),
            StoreSchema::new("change").with_index(IndexSchema::new("x")),
            StoreSchema::new("fresh"),
        ]);
        let plan = UpgradePlan::between(Some(&old), &new);
        assert_eq!(plan.created, vec!["fresh".to_string()]);
        assert_eq!(plan.dropped, vec!["gone".to_string()]);
        assert_eq!(plan.rebuilt, vec!["change".to_string()]);
        assert!(UpgradePlan::between(Some(&new), &new).is_empty());
    }

    #[test]
    fn first_connect_assigns_version_one() {
        let configured = schema(vec![StoreSchema::new("s")]);
        match reconcile(None, &configured).unwrap() {
            Reconcile::Upgrade(s) => assert_eq!(s.version(), Some(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn matching_schema_is_adopted() {
        let stored = schema(vec![StoreSchema::new("s")]).with_version(4);
        let configured = schema(vec![StoreSchema::new("s")]);
        assert_eq!(
            reconcile(Some(stored.clone()), &configured).unwrap(),
            Reconcile::Adopt(stored)
        );
    }

    #[test]
    fn changed_schema_bumps_version() {
        let stored = schema(vec![StoreSchema::new("s")]).with_version(4);
        let configured = schema(vec![StoreSchema::new("s"), StoreSchema::new("t")]);
        match reconcile(Some(stored.clone()), &configured).unwrap() {
            Reconcile::Upgrade(s) => assert_eq!(s.version(), Some(5)),
            other => panic!("unexpected {other:?}"),
        }
        let explicit = configured.clone().with_version(9);
        match reconcile(Some(stored.clone()), &explicit).unwrap() {
            Reconcile::Upgrade(s) => assert_eq!(s.version(), Some(9)),
            other => panic!("unexpected {other:?}"),
        }
        let older = configured.with_version(2);
        assert!(matches!(
            reconcile(Some(stored), &older),
            Err(StoreError::Connection(_))
        ));
    }

    #[test]
    fn explicit_upgrade_version() {
        let current = schema(vec![]).with_version(3);
        assert_eq!(next_version(&current, &schema(vec![])).unwrap(), 4);
        assert_eq!(next_version(&current, &schema(vec![]).with_version(7)).unwrap(), 7);
        assert!(next_version(&current, &schema(vec![]).with_version(1)).is_err());
    }
}
