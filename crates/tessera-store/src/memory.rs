//! In-memory ordered KV engine.
//!
//! All data lives in `BTreeMap`s; nothing touches disk. A transaction works
//! on a private copy of the tables and publishes it on commit.
//!
//! ```
//! use tessera_store::{KvEngine, KvTransaction, MemoryEngine};
//!
//! let engine = MemoryEngine::new();
//! let mut txn = engine.begin().unwrap();
//! txn.put("t", b"k", b"v").unwrap();
//! txn.commit().unwrap();
//!
//! let txn = engine.begin().unwrap();
//! assert_eq!(txn.get("t", b"k").unwrap(), Some(b"v".to_vec()));
//! ```

use std::collections::BTreeMap;
use std::ops::{Bound, ControlFlow};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{ErrorContext, StoreError, StoreResult};
use crate::traits::{KvEngine, KvTransaction, ScanVisitor};

type Tables = BTreeMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-memory engine. Clones share the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryEngine {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryEngine {
    /// Create a new empty engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a table.
    pub fn table_len(&self, table: &str) -> usize {
        self.lock()
            .map(|t| t.get(table).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::backend(ErrorContext::default(), "memory engine lock poisoned"))
    }
}

impl KvEngine for MemoryEngine {
    fn begin(&self) -> StoreResult<Box<dyn KvTransaction + '_>> {
        let working = self.lock()?.clone();
        Ok(Box::new(MemoryTransaction {
            engine: self,
            working,
        }))
    }
}

struct MemoryTransaction<'e> {
    engine: &'e MemoryEngine,
    working: Tables,
}

/// Whether a bound pair selects nothing; `BTreeMap::range` panics on these.
pub(crate) fn bounds_empty(lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> bool {
    match (lower, upper) {
        (Bound::Included(l), Bound::Included(u)) => l > u,
        (Bound::Included(l), Bound::Excluded(u))
        | (Bound::Excluded(l), Bound::Included(u))
        | (Bound::Excluded(l), Bound::Excluded(u)) => l >= u,
        _ => false,
    }
}

impl KvTransaction for MemoryTransaction<'_> {
    fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.working.get(table).and_then(|t| t.get(key)).cloned())
    }

    fn put(&mut self, table: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.working
            .entry(table.to_string())
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&mut self, table: &str, key: &[u8]) -> StoreResult<bool> {
        Ok(self
            .working
            .get_mut(table)
            .is_some_and(|t| t.remove(key).is_some()))
    }

    fn scan(
        &self,
        table: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
        visit: &mut ScanVisitor<'_>,
    ) -> StoreResult<()> {
        let Some(entries) = self.working.get(table) else {
            return Ok(());
        };
        if bounds_empty(lower, upper) {
            return Ok(());
        }
        let range = entries.range::<[u8], _>((lower, upper));
        if reverse {
            for (k, v) in range.rev() {
                if visit(k.as_slice(), v.as_slice()).is_break() {
                    break;
                }
            }
        } else {
            for (k, v) in range {
                if let ControlFlow::Break(()) = visit(k.as_slice(), v.as_slice()) {
                    break;
                }
            }
        }
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> StoreResult<()> {
        self.working.remove(table);
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut tables = self.engine.lock()?;
        *tables = self.working;
        Ok(())
    }

    fn abort(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}
