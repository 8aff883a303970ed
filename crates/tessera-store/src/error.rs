//! Store error types.

use std::fmt;

use tessera_core::{Key, KeyRangeError, SchemaError};

/// Where an error happened: store, logical operation and key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub store: Option<String>,
    pub operation: Option<&'static str>,
    pub key: Option<String>,
}

impl ErrorContext {
    /// Context for a logical operation.
    pub fn op(operation: &'static str) -> Self {
        Self {
            operation: Some(operation),
            ..Self::default()
        }
    }

    pub fn store(mut self, store: &str) -> Self {
        self.store = Some(store.to_string());
        self
    }

    pub fn key(mut self, key: &Key) -> Self {
        self.key = Some(key.to_string());
        self
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if let Some(op) = self.operation {
            parts.push(format!("op={op}"));
        }
        if let Some(s) = &self.store {
            parts.push(format!("store={s}"));
        }
        if let Some(k) = &self.key {
            parts.push(format!("key={k}"));
        }
        f.write_str(&parts.join(", "))
    }
}

/// Errors from storage operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// A store or index reference does not exist or is outside the
    /// transaction scope.
    #[error("not found: {0}")]
    NotFound(String),

    /// A malformed range, key or request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Duplicate key on `add` or a unique index conflict.
    #[error("constraint violation [{context}]: {message}")]
    Constraint { context: ErrorContext, message: String },

    /// A key that the backend or the declared type does not accept.
    #[error("invalid key [{context}]: {message}")]
    InvalidKey { context: ErrorContext, message: String },

    /// A record that could not be serialized or deserialized.
    #[error("data clone error [{context}]: {message}")]
    DataClone { context: ErrorContext, message: String },

    /// Opening or upgrading the backend failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// The request was dropped from a full pending queue.
    #[error("request dropped: pending queue exceeded {0} entries")]
    QueueOverflow(usize),

    /// The database has been closed.
    #[error("database is closed")]
    Closed,

    /// Opaque lower-layer failure.
    #[error("backend error [{context}]: {message}")]
    Backend { context: ErrorContext, message: String },

    /// Schema construction or lookup failed.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// The error taxonomy without payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    Constraint,
    InvalidKey,
    DataClone,
    Connection,
    QueueOverflow,
    Closed,
    Backend,
    Schema,
}

impl StoreError {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Constraint { .. } => ErrorKind::Constraint,
            Self::InvalidKey { .. } => ErrorKind::InvalidKey,
            Self::DataClone { .. } => ErrorKind::DataClone,
            Self::Connection(_) => ErrorKind::Connection,
            Self::QueueOverflow(_) => ErrorKind::QueueOverflow,
            Self::Closed => ErrorKind::Closed,
            Self::Backend { .. } => ErrorKind::Backend,
            Self::Schema(_) => ErrorKind::Schema,
        }
    }

    pub fn constraint(context: ErrorContext, message: impl Into<String>) -> Self {
        Self::Constraint {
            context,
            message: message.into(),
        }
    }

    pub fn invalid_key(context: ErrorContext, message: impl Into<String>) -> Self {
        Self::InvalidKey {
            context,
            message: message.into(),
        }
    }

    pub fn data_clone(context: ErrorContext, message: impl fmt::Display) -> Self {
        Self::DataClone {
            context,
            message: message.to_string(),
        }
    }

    pub fn backend(context: ErrorContext, message: impl fmt::Display) -> Self {
        Self::Backend {
            context,
            message: message.to_string(),
        }
    }

    /// Attach context to an error that was raised without any.
    pub fn with_context(self, context: &ErrorContext) -> Self {
        let fill = |c: ErrorContext| {
            if c == ErrorContext::default() {
                context.clone()
            } else {
                c
            }
        };
        match self {
            Self::Constraint { context: c, message } => Self::Constraint {
                context: fill(c),
                message,
            },
            Self::InvalidKey { context: c, message } => Self::InvalidKey {
                context: fill(c),
                message,
            },
            Self::DataClone { context: c, message } => Self::DataClone {
                context: fill(c),
                message,
            },
            Self::Backend { context: c, message } => Self::Backend {
                context: fill(c),
                message,
            },
            other => other,
        }
    }
}

impl From<KeyRangeError> for StoreError {
    fn from(e: KeyRangeError) -> Self {
        Self::InvalidArgument(e.to_string())
    }
}

/// Result type for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;
