//! # tessera-core
//!
//! Schema model, key envelope and key ranges for the tessera storage layer.
//!
//! Everything in this crate is pure data: no backend is touched. The
//! storage crate (`tessera-store`) consumes these types to compile queries,
//! encode keys and run transactions.
//!
//! ## Quick Start
//!
//! ```
//! use tessera_core::{DataType, DatabaseSchema, IndexSchema, Key, KeyRange, StoreSchema};
//! use serde_json::json;
//!
//! let store = StoreSchema::new("S")
//!     .with_key_path("id")
//!     .with_key_type(DataType::Numeric)
//!     .with_index(IndexSchema::new("tags").with_multi_entry(true));
//! let schema = DatabaseSchema::new(vec![store]).unwrap();
//!
//! let s = schema.store("S").unwrap();
//! let record = json!({"id": 1, "tags": ["a", "b"]});
//! assert_eq!(s.extract_key(&record), Some(Key::from(1)));
//! assert_eq!(s.index("tags").unwrap().index_keys(&record).len(), 2);
//!
//! let range = KeyRange::only("a").unwrap();
//! assert!(range.contains(&Key::from("a")));
//! ```
//!
//! ## Key order
//!
//! Keys sort `Number < Date < Text < Array`. Numbers compare by value,
//! dates by epoch milliseconds, text by code point and arrays element by
//! element with a shorter prefix first.

mod config;
mod diff;
mod error;
mod key;
mod range;
mod schema;
mod validate;

pub use config::{IndexConfig, SchemaConfig, StoreConfig};
pub use error::{KeyRangeError, SchemaError, SchemaIssue};
pub use key::Key;
pub use range::{KeyRange, PREFIX_SENTINEL};
pub use schema::{
    key_matches_type, typed_key, DataType, DatabaseSchema, IndexSchema, KeyPath, StoreSchema,
    TypeSpec,
};
pub use validate::{validate_schema, RESERVED_PREFIX};
