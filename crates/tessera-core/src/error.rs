use std::fmt;

/// A single schema problem with context about where it occurred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaIssue {
    /// Store the problem belongs to, if any.
    pub store: Option<String>,
    /// Index the problem belongs to, if any.
    pub index: Option<String>,
    /// Human-readable description.
    pub message: String,
}

impl SchemaIssue {
    pub(crate) fn global(message: impl Into<String>) -> Self {
        Self {
            store: None,
            index: None,
            message: message.into(),
        }
    }

    pub(crate) fn store(store: &str, message: impl Into<String>) -> Self {
        Self {
            store: Some(store.to_string()),
            index: None,
            message: message.into(),
        }
    }

    pub(crate) fn index(store: &str, index: &str, message: impl Into<String>) -> Self {
        Self {
            store: Some(store.to_string()),
            index: Some(index.to_string()),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ctx = Vec::new();
        if let Some(s) = &self.store {
            ctx.push(format!("store={s}"));
        }
        if let Some(i) = &self.index {
            ctx.push(format!("index={i}"));
        }
        if ctx.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "[{}] {}", ctx.join(", "), self.message)
        }
    }
}

fn join_issues(issues: &[SchemaIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced while building, parsing or applying a schema.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    /// Validation found one or more problems.
    #[error("invalid schema: {}", join_issues(.0))]
    Invalid(Vec<SchemaIssue>),

    /// The configuration text could not be parsed.
    #[error("schema parse error: {0}")]
    Parse(String),

    /// A store name was not found in the schema.
    #[error("store not found: {0}")]
    UnknownStore(String),

    /// An index name was not found on a store.
    #[error("index {index} not found on store {store}")]
    UnknownIndex {
        /// Store that was searched.
        store: String,
        /// Missing index name.
        index: String,
    },

    /// A key could not be written into a record.
    #[error("cannot set key on record: {0}")]
    KeyPath(String),
}

impl SchemaError {
    /// Issues carried by an [`SchemaError::Invalid`] error; empty otherwise.
    pub fn issues(&self) -> &[SchemaIssue] {
        match self {
            Self::Invalid(issues) => issues,
            _ => &[],
        }
    }
}

/// Errors produced while constructing a [`KeyRange`](crate::KeyRange).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyRangeError {
    /// A bound is not a valid key (for example it contains NaN).
    #[error("range bound is not a valid key")]
    InvalidBound,

    /// The lower bound sorts after the upper bound.
    #[error("lower bound is greater than upper bound")]
    LowerAboveUpper,

    /// Equal bounds with at least one open side match nothing.
    #[error("equal bounds cannot be open")]
    EmptyOpenRange,
}
