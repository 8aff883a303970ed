//! Key ranges: inclusive or exclusive lower/upper bounds over [`Key`].

use crate::error::KeyRangeError;
use crate::key::Key;

/// Highest Unicode scalar value, appended to a prefix to form the upper
/// bound of a starts-with range.
pub const PREFIX_SENTINEL: char = char::MAX;

/// A lower/upper bound pair over the key domain. Either bound may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRange {
    lower: Option<Key>,
    upper: Option<Key>,
    lower_open: bool,
    upper_open: bool,
}

impl KeyRange {
    /// A range matching exactly `key`.
    pub fn only(key: impl Into<Key>) -> Result<Self, KeyRangeError> {
        let key = key.into();
        if !key.is_valid() {
            return Err(KeyRangeError::InvalidBound);
        }
        Ok(Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        })
    }

    /// All keys above `key` (strictly above when `open`).
    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Result<Self, KeyRangeError> {
        let key = key.into();
        if !key.is_valid() {
            return Err(KeyRangeError::InvalidBound);
        }
        Ok(Self {
            lower: Some(key),
            upper: None,
            lower_open: open,
            upper_open: false,
        })
    }

    /// All keys below `key` (strictly below when `open`).
    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Result<Self, KeyRangeError> {
        let key = key.into();
        if !key.is_valid() {
            return Err(KeyRangeError::InvalidBound);
        }
        Ok(Self {
            lower: None,
            upper: Some(key),
            lower_open: false,
            upper_open: open,
        })
    }

    /// A range with both bounds.
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> Result<Self, KeyRangeError> {
        let lower = lower.into();
        let upper = upper.into();
        if !lower.is_valid() || !upper.is_valid() {
            return Err(KeyRangeError::InvalidBound);
        }
        if lower > upper {
            return Err(KeyRangeError::LowerAboveUpper);
        }
        if lower == upper && (lower_open || upper_open) {
            return Err(KeyRangeError::EmptyOpenRange);
        }
        Ok(Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        })
    }

    /// All text keys starting with `prefix`.
    pub fn starts_with(prefix: &str) -> Self {
        let mut upper = String::with_capacity(prefix.len() + 4);
        upper.push_str(prefix);
        upper.push(PREFIX_SENTINEL);
        Self {
            lower: Some(Key::Text(prefix.to_string())),
            upper: Some(Key::Text(upper)),
            lower_open: false,
            upper_open: false,
        }
    }

    /// The lower bound, if any.
    pub fn lower(&self) -> Option<&Key> {
        self.lower.as_ref()
    }

    /// The upper bound, if any.
    pub fn upper(&self) -> Option<&Key> {
        self.upper.as_ref()
    }

    /// Whether the lower bound is exclusive.
    pub fn lower_open(&self) -> bool {
        self.lower_open
    }

    /// Whether the upper bound is exclusive.
    pub fn upper_open(&self) -> bool {
        self.upper_open
    }

    /// The single key matched by a closed range with equal bounds.
    pub fn single_key(&self) -> Option<&Key> {
        match (&self.lower, &self.upper) {
            (Some(l), Some(u)) if !self.lower_open && !self.upper_open && l == u => Some(l),
            _ => None,
        }
    }

    /// The prefix of a starts-with range.
    ///
    /// This is the one predicate deciding whether a range is a prefix scan:
    /// the lower bound is a closed `Text(p)` and the upper bound is the closed
    /// `Text(p + U+10FFFF)`.
    pub fn as_text_prefix(&self) -> Option<&str> {
        if self.lower_open || self.upper_open {
            return None;
        }
        let lower = self.lower.as_ref()?.as_text()?;
        let upper = self.upper.as_ref()?.as_text()?;
        let rest = upper.strip_prefix(lower)?;
        let mut chars = rest.chars();
        match (chars.next(), chars.next()) {
            (Some(PREFIX_SENTINEL), None) => Some(lower),
            _ => None,
        }
    }

    /// Whether `key` falls inside the range.
    pub fn contains(&self, key: &Key) -> bool {
        if let Some(lower) = &self.lower {
            if self.lower_open {
                if key <= lower {
                    return false;
                }
            } else if key < lower {
                return false;
            }
        }
        if let Some(upper) = &self.upper {
            if self.upper_open {
                if key >= upper {
                    return false;
                }
            } else if key > upper {
                return false;
            }
        }
        true
    }
}
