//! Persistent ordered KV engine on [`redb`](https://docs.rs/redb).
//!
//! Pure Rust, no C dependencies. Each logical table maps to one redb table
//! keyed and valued by raw bytes. Enable with `features = ["redb"]`.
//!
//! ```no_run
//! use tessera_store::{KvEngine, KvTransaction, RedbEngine};
//!
//! let engine = RedbEngine::open("/tmp/tessera.redb").unwrap();
//! let mut txn = engine.begin().unwrap();
//! txn.put("store:people", b"k", b"{}").unwrap();
//! txn.commit().unwrap();
//! ```

use std::ops::Bound;
use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use crate::error::{ErrorContext, StoreError, StoreResult};
use crate::memory::bounds_empty;
use crate::traits::{KvEngine, KvTransaction, ScanVisitor};

// ── Error type ──────────────────────────────────────────────────────

/// Errors returned by the redb engine.
#[derive(Debug)]
pub struct RedbError(String);

impl std::fmt::Display for RedbError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "redb error: {}", self.0)
    }
}

impl std::error::Error for RedbError {}

impl From<RedbError> for StoreError {
    fn from(e: RedbError) -> Self {
        StoreError::backend(ErrorContext::default(), e)
    }
}

fn err(e: impl std::fmt::Display) -> RedbError {
    RedbError(e.to_string())
}

fn table(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

// ── Engine ──────────────────────────────────────────────────────────

/// A redb database used as the cursor engine's byte store.
pub struct RedbEngine {
    db: Database,
}

impl RedbEngine {
    /// Open or create a redb database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RedbError> {
        let db = Database::create(path).map_err(err)?;
        Ok(Self { db })
    }

    /// Create an in-memory redb database (for testing).
    pub fn open_in_memory() -> Result<Self, RedbError> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(err)?;
        Ok(Self { db })
    }
}

impl KvEngine for RedbEngine {
    fn begin(&self) -> StoreResult<Box<dyn KvTransaction + '_>> {
        let txn = self.db.begin_write().map_err(err)?;
        Ok(Box::new(RedbTransaction { txn }))
    }
}

struct RedbTransaction {
    txn: WriteTransaction,
}

impl KvTransaction for RedbTransaction {
    fn get(&self, name: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let t = self.txn.open_table(table(name)).map_err(err)?;
        let value = t.get(key).map_err(err)?.map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn put(&mut self, name: &str, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut t = self.txn.open_table(table(name)).map_err(err)?;
        t.insert(key, value).map_err(err)?;
        Ok(())
    }

    fn delete(&mut self, name: &str, key: &[u8]) -> StoreResult<bool> {
        let mut t = self.txn.open_table(table(name)).map_err(err)?;
        let existed = t.remove(key).map_err(err)?.is_some();
        Ok(existed)
    }

    fn scan(
        &self,
        name: &str,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
        reverse: bool,
        visit: &mut ScanVisitor<'_>,
    ) -> StoreResult<()> {
        if bounds_empty(lower, upper) {
            return Ok(());
        }
        let t = self.txn.open_table(table(name)).map_err(err)?;
        let range = t.range::<&[u8]>((lower, upper)).map_err(err)?;
        let entries: Box<dyn Iterator<Item = _> + '_> = if reverse {
            Box::new(range.rev())
        } else {
            Box::new(range)
        };
        for item in entries {
            let (k, v) = item.map_err(err)?;
            if visit(k.value(), v.value()).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn drop_table(&mut self, name: &str) -> StoreResult<()> {
        self.txn.delete_table(table(name)).map_err(err)?;
        Ok(())
    }

    fn commit(self: Box<Self>) -> StoreResult<()> {
        self.txn.commit().map_err(err)?;
        Ok(())
    }

    fn abort(self: Box<Self>) -> StoreResult<()> {
        self.txn.abort().map_err(err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::ControlFlow;

    fn new_engine() -> RedbEngine {
        RedbEngine::open_in_memory().unwrap()
    }

    #[test]
    fn put_get_delete() {
        let engine = new_engine();
        let mut txn = engine.begin().unwrap();
        txn.put("t", b"k1", b"hello").unwrap();
        assert_eq!(txn.get("t", b"k1").unwrap(), Some(b"hello".to_vec()));
        assert!(txn.delete("t", b"k1").unwrap());
        assert!(!txn.delete("t", b"k1").unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn abort_discards_writes() {
        let engine = new_engine();
        let mut txn = engine.begin().unwrap();
        txn.put("t", b"k", b"v").unwrap();
        txn.abort().unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(txn.get("t", b"k").unwrap(), None);
    }

    #[test]
    fn scan_in_both_directions() {
        let engine = new_engine();
        let mut txn = engine.begin().unwrap();
        for k in [b"a", b"b", b"c"] {
            txn.put("t", k, b"").unwrap();
        }
        let mut seen = Vec::new();
        txn.scan("t", Bound::Unbounded, Bound::Excluded(b"c".as_slice()), true, &mut |k, _| {
            seen.push(k.to_vec());
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(seen, vec![b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn file_backed_data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.redb");
        {
            let engine = RedbEngine::open(&path).unwrap();
            let mut txn = engine.begin().unwrap();
            txn.put("t", b"k", b"v").unwrap();
            txn.commit().unwrap();
        }
        let engine = RedbEngine::open(&path).unwrap();
        let txn = engine.begin().unwrap();
        assert_eq!(txn.get("t", b"k").unwrap(), Some(b"v".to_vec()));
    }
}
