//! # tessera-store
//!
//! Transactions over object stores for [`tessera-core`](tessera_core)
//! schemas.
//!
//! A [`Database`] owns one backend connection and a FIFO [`Scheduler`]
//! that runs one transaction at a time. Each backend implements the same
//! logical operation set ([`RequestExecutor`]), so records, keys, index
//! queries and counts behave identically whichever engine is underneath.
//!
//! ## Quick Start
//!
//! ```
//! use serde_json::json;
//! use tessera_core::{DatabaseSchema, StoreSchema};
//! use tessera_store::{BackendKind, Database, DatabaseConfig};
//!
//! let schema = DatabaseSchema::new(vec![StoreSchema::new("sensors").with_key_path("id")]).unwrap();
//! let db = Database::open(
//!     DatabaseConfig::new("quickstart")
//!         .with_backends([BackendKind::Memory])
//!         .with_schema(&schema),
//! )
//! .unwrap();
//!
//! db.put("sensors", json!({"id": "sensor-42", "temp": 21.5})).wait().unwrap();
//! let record = db.get("sensors", "sensor-42").wait().unwrap();
//! assert_eq!(record, Some(json!({"id": "sensor-42", "temp": 21.5})));
//! ```
//!
//! ## Backends
//!
//! | Backend | Feature flag | Executor |
//! |---------|-------------|----------|
//! | [`MemoryEngine`] | *(always available)* | cursor engine |
//! | `RedbEngine` | `redb` | cursor engine |
//! | `SqliteConnection` | `sqlite` | compiled SQL |
//!
//! [`DatabaseConfig::backends`] lists the engines to try in order; the
//! first one that probes and opens wins.

pub mod backend;
pub mod codec;
pub mod collate;
mod config;
mod cursor;
mod db;
mod error;
mod memory;
#[cfg(feature = "redb")]
mod redb;
mod scheduler;
pub mod sql;
#[cfg(feature = "sqlite")]
mod sqlite;
mod traits;
pub mod upgrade;

pub use backend::{BackendKind, Connection};
pub use config::{
    DatabaseConfig, JournalMode, SchedulerConfig, SqliteConfig, DEFAULT_QUEUE_CAPACITY,
    DEFAULT_STALL_WARNING_MS,
};
pub use cursor::{CursorConnection, CursorExecutor, Pipeline, DEFAULT_PIPELINE_WINDOW};
pub use db::{Database, Request};
pub use error::{ErrorContext, ErrorKind, StoreError, StoreResult};
pub use memory::MemoryEngine;
#[cfg(feature = "redb")]
pub use redb::{RedbEngine, RedbError};
pub use scheduler::{
    ConnectionState, PendingRequest, RequestMode, Scheduler, SharedState, TransactionJob,
};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqlExecutor, SqliteConnection, SqliteError};
pub use traits::*;
