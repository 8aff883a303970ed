//! Backend selection and the per-backend connection.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tessera_core::DatabaseSchema;
use tracing::{info, warn};

use crate::config::DatabaseConfig;
use crate::cursor::CursorConnection;
use crate::error::{StoreError, StoreResult};
use crate::memory::MemoryEngine;
use crate::traits::{TransactionBody, TxMode};

/// The storage engines a database can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Cursor engine over a redb file.
    Redb,
    /// SQLite through rusqlite.
    Sqlite,
    /// Cursor engine over in-memory tables.
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Redb => "redb",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        })
    }
}

fn directory_exists(path: &Path) -> bool {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.is_dir(),
        _ => true,
    }
}

/// Whether `kind` can be opened with this configuration.
///
/// * redb needs the `redb` feature and a path whose directory exists;
/// * SQLite needs the `sqlite` feature;
/// * memory is always available.
pub fn probe(kind: BackendKind, config: &DatabaseConfig) -> bool {
    match kind {
        BackendKind::Redb => {
            cfg!(feature = "redb") && config.path.as_deref().is_some_and(directory_exists)
        }
        BackendKind::Sqlite => cfg!(feature = "sqlite"),
        BackendKind::Memory => true,
    }
}

/// Open one specific backend.
pub fn open(kind: BackendKind, config: &DatabaseConfig) -> StoreResult<Connection> {
    if !probe(kind, config) {
        return Err(StoreError::Connection(format!("backend {kind} is not available")));
    }
    match kind {
        #[cfg(feature = "redb")]
        BackendKind::Redb => {
            let path = config
                .path
                .as_deref()
                .ok_or_else(|| StoreError::Connection("redb needs a path".into()))?;
            let engine = crate::redb::RedbEngine::open(path)
                .map_err(|e| StoreError::Connection(e.to_string()))?;
            Ok(Connection::Redb(CursorConnection::new(engine, config.pipeline_window)))
        }
        #[cfg(feature = "sqlite")]
        BackendKind::Sqlite => {
            let conn = match config.path.as_deref() {
                Some(path) => crate::sqlite::SqliteConnection::open_with_config(path, &config.sqlite),
                None => crate::sqlite::SqliteConnection::open_in_memory_with_config(&config.sqlite),
            }
            .map_err(|e| StoreError::Connection(e.to_string()))?;
            Ok(Connection::Sqlite(conn))
        }
        BackendKind::Memory => Ok(Connection::Memory(CursorConnection::new(
            MemoryEngine::new(),
            config.pipeline_window,
        ))),
        #[allow(unreachable_patterns)]
        other => Err(StoreError::Connection(format!("backend {other} is not compiled in"))),
    }
}

/// Open the first backend of the configured preference list that probes
/// and opens successfully.
pub fn open_preferred(config: &DatabaseConfig) -> StoreResult<Connection> {
    let mut last_error = None;
    for &kind in &config.backends {
        if !probe(kind, config) {
            warn!(db = %config.name, backend = %kind, "backend unavailable, skipping");
            continue;
        }
        match open(kind, config) {
            Ok(conn) => {
                info!(db = %config.name, backend = %kind, "backend opened");
                return Ok(conn);
            }
            Err(e) => {
                warn!(db = %config.name, backend = %kind, error = %e, "backend failed to open");
                last_error = Some(e);
            }
        }
    }
    Err(last_error.unwrap_or_else(|| StoreError::Connection("no usable backend".into())))
}

/// An open backend. One transaction runs at a time.
pub enum Connection {
    Memory(CursorConnection),
    #[cfg(feature = "redb")]
    Redb(CursorConnection),
    #[cfg(feature = "sqlite")]
    Sqlite(crate::sqlite::SqliteConnection),
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Connection").field(&self.kind()).finish()
    }
}

impl Connection {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Memory(_) => BackendKind::Memory,
            #[cfg(feature = "redb")]
            Self::Redb(_) => BackendKind::Redb,
            #[cfg(feature = "sqlite")]
            Self::Sqlite(_) => BackendKind::Sqlite,
        }
    }

    /// The schema persisted by the last upgrade, if any.
    pub fn load_schema(&self) -> StoreResult<Option<DatabaseSchema>> {
        match self {
            Self::Memory(c) => c.load_schema(),
            #[cfg(feature = "redb")]
            Self::Redb(c) => c.load_schema(),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(c) => c.load_schema(),
        }
    }

    /// Run one transaction over `scope`.
    pub fn run(
        &mut self,
        schema: &DatabaseSchema,
        scope: &[String],
        mode: TxMode,
        body: &mut TransactionBody<'_>,
    ) -> StoreResult<()> {
        match self {
            Self::Memory(c) => c.run(schema, scope, mode, body),
            #[cfg(feature = "redb")]
            Self::Redb(c) => c.run(schema, scope, mode, body),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(c) => c.run(schema, scope, mode, body),
        }
    }

    /// Move the persisted layout from `old` to `new`, then run `body` in the
    /// same transaction.
    pub fn upgrade(
        &mut self,
        old: Option<&DatabaseSchema>,
        new: &DatabaseSchema,
        body: &mut TransactionBody<'_>,
    ) -> StoreResult<()> {
        match self {
            Self::Memory(c) => c.upgrade(old, new, body),
            #[cfg(feature = "redb")]
            Self::Redb(c) => c.upgrade(old, new, body),
            #[cfg(feature = "sqlite")]
            Self::Sqlite(c) => c.upgrade(old, new, body),
        }
    }
}
