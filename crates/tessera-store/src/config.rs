//! Database configuration.
//!
//! ```
//! use tessera_store::{BackendKind, DatabaseConfig};
//!
//! let config = DatabaseConfig::from_toml_str(r#"
//! name = "app"
//! backends = ["sqlite", "memory"]
//! pipeline_window = 8
//!
//! [scheduler]
//! queue_capacity = 64
//!
//! [schema]
//! version = 1
//!
//! [[schema.stores]]
//! name = "people"
//! keyPath = "id"
//! "#).unwrap();
//!
//! assert_eq!(config.backends, vec![BackendKind::Sqlite, BackendKind::Memory]);
//! assert_eq!(config.scheduler.queue_capacity, 64);
//! assert!(config.database_schema().unwrap().has_store("people"));
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tessera_core::{DatabaseSchema, SchemaConfig};

use crate::backend::BackendKind;
use crate::cursor::DEFAULT_PIPELINE_WINDOW;
use crate::error::{StoreError, StoreResult};

/// Default bound of the scheduler's pending queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default wait after which an admitted request is logged as stalled.
pub const DEFAULT_STALL_WARNING_MS: u64 = 5_000;

/// SQLite configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// SQLite journal mode. Defaults to WAL.
    pub journal_mode: JournalMode,
    /// Busy timeout in milliseconds. Defaults to 5000.
    pub busy_timeout_ms: u32,
    /// SQLite page size. Defaults to 4096.
    pub page_size: u32,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout_ms: 5000,
            page_size: 4096,
        }
    }
}

/// SQLite journal mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JournalMode {
    /// Write-Ahead Logging. Readers do not block the writer.
    Wal,
    /// Traditional rollback journal.
    Delete,
    /// In-memory journal (fastest, no crash recovery).
    Memory,
}

impl JournalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wal => "WAL",
            Self::Delete => "DELETE",
            Self::Memory => "MEMORY",
        }
    }
}

/// Scheduler limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Pending requests kept before the oldest is dropped.
    pub queue_capacity: usize,
    /// Requests that waited longer than this are logged when admitted.
    pub stall_warning_ms: u64,
}

impl SchedulerConfig {
    pub fn stall_warning(&self) -> Duration {
        Duration::from_millis(self.stall_warning_ms)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stall_warning_ms: DEFAULT_STALL_WARNING_MS,
        }
    }
}

/// Everything needed to open a database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Name used in log output.
    pub name: String,
    /// Database file. Without one, only in-memory backends are available.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Backends to try, most preferred first.
    pub backends: Vec<BackendKind>,
    /// Bulk requests in flight at once on cursor engines.
    pub pipeline_window: usize,
    pub scheduler: SchedulerConfig,
    pub sqlite: SqliteConfig,
    pub schema: SchemaConfig,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            name: "tessera".to_string(),
            path: None,
            backends: vec![BackendKind::Redb, BackendKind::Sqlite, BackendKind::Memory],
            pipeline_window: DEFAULT_PIPELINE_WINDOW,
            scheduler: SchedulerConfig::default(),
            sqlite: SqliteConfig::default(),
            schema: SchemaConfig::default(),
        }
    }
}

impl DatabaseConfig {
    /// Default configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_backends(mut self, backends: impl IntoIterator<Item = BackendKind>) -> Self {
        self.backends = backends.into_iter().collect();
        self
    }

    pub fn with_pipeline_window(mut self, window: usize) -> Self {
        self.pipeline_window = window;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.scheduler.queue_capacity = capacity;
        self
    }

    pub fn with_stall_warning_ms(mut self, millis: u64) -> Self {
        self.scheduler.stall_warning_ms = millis;
        self
    }

    pub fn with_sqlite(mut self, sqlite: SqliteConfig) -> Self {
        self.sqlite = sqlite;
        self
    }

    pub fn with_schema(mut self, schema: &DatabaseSchema) -> Self {
        self.schema = schema.to_config();
        self
    }

    /// Parse a TOML configuration.
    pub fn from_toml_str(text: &str) -> StoreResult<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| StoreError::InvalidArgument(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            StoreError::InvalidArgument(format!(
                "failed to read {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_toml_str(&text)
    }

    /// Check limits that serde cannot express.
    pub fn validate(&self) -> StoreResult<()> {
        if self.backends.is_empty() {
            return Err(StoreError::InvalidArgument("no backends configured".into()));
        }
        if self.pipeline_window == 0 {
            return Err(StoreError::InvalidArgument(
                "pipeline_window must be at least 1".into(),
            ));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(StoreError::InvalidArgument(
                "queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// The validated schema described by this configuration.
    pub fn database_schema(&self) -> StoreResult<DatabaseSchema> {
        Ok(DatabaseSchema::from_config(&self.schema)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::StoreSchema;

    #[test]
    fn defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.pipeline_window, 16);
        assert_eq!(config.scheduler.queue_capacity, 256);
        assert_eq!(config.sqlite.journal_mode, JournalMode::Wal);
        assert_eq!(config.backends.last(), Some(&BackendKind::Memory));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_and_toml_agree() {
        let schema = DatabaseSchema::new(vec![StoreSchema::new("s").with_key_path("id")]).unwrap();
        let built = DatabaseConfig::new("app")
            .with_backends([BackendKind::Memory])
            .with_pipeline_window(4)
            .with_queue_capacity(8)
            .with_stall_warning_ms(100)
            .with_sqlite(SqliteConfig {
                journal_mode: JournalMode::Delete,
                ..SqliteConfig::default()
            })
            .with_schema(&schema);
        let text = toml::to_string(&built).unwrap();
        let parsed = DatabaseConfig::from_toml_str(&text).unwrap();
        assert_eq!(parsed, built);
        assert_eq!(parsed.database_schema().unwrap(), schema);
    }

    #[test]
    fn rejects_bad_limits() {
        let err = DatabaseConfig::from_toml_str("pipeline_window = 0").unwrap_err();
        assert!(err.to_string().contains("pipeline_window"));
        let err = DatabaseConfig::from_toml_str("backends = []").unwrap_err();
        assert!(err.to_string().contains("no backends"));
        assert!(DatabaseConfig::from_toml_str("backends = [\"floppy\"]").is_err());
    }

    #[test]
    fn file_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tessera.toml");
        std::fs::write(&path, "name = \"disk\"\n[sqlite]\njournal_mode = \"memory\"\n").unwrap();
        let config = DatabaseConfig::from_file(&path).unwrap();
        assert_eq!(config.name, "disk");
        assert_eq!(config.sqlite.journal_mode, JournalMode::Memory);
        assert!(DatabaseConfig::from_file(dir.path().join("missing.toml")).is_err());
    }
}
