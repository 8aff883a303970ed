//! The logical key envelope shared by every backend.
//!
//! A key is a number, a date, a text value, or an ordered tuple of keys.
//! Keys are totally ordered with the cursor-store convention
//! `Number < Date < Text < Array`, so every backend can reproduce the same
//! result order.

use core::cmp::Ordering;
use core::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value;

use crate::schema::DataType;

/// Largest integer that survives an `f64` round trip.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// A logical key.
///
/// `NaN` is representable but never valid; see [`Key::is_valid`].
#[derive(Debug, Clone)]
pub enum Key {
    /// A finite or infinite number.
    Number(f64),
    /// A point in time as milliseconds since the Unix epoch.
    Date(i64),
    /// A text value, ordered by code point.
    Text(String),
    /// An ordered tuple of keys.
    Array(Vec<Key>),
}

impl Key {
    /// Build a number key, rejecting `NaN`. `-0.0` is folded into `0.0`.
    pub fn number(value: f64) -> Option<Self> {
        if value.is_nan() {
            None
        } else {
            Some(Self::Number(canonical(value)))
        }
    }

    /// Build a date key from an RFC 3339 timestamp.
    pub fn date_from_rfc3339(text: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|dt| Self::Date(dt.timestamp_millis()))
    }

    /// Whether the key (and every element of a tuple) is usable as a key.
    pub fn is_valid(&self) -> bool {
        match self {
            Self::Number(n) => !n.is_nan(),
            Self::Date(_) | Self::Text(_) => true,
            Self::Array(items) => items.iter().all(Key::is_valid),
        }
    }

    /// Whether this key is a tuple.
    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// The text value, if this is a text key.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// The numeric value, if this is a number key.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Convert an untyped JSON value into a key.
    ///
    /// Numbers, strings and arrays of valid keys convert; everything else
    /// (null, booleans, objects, empty nesting of invalid values) does not.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_f64().and_then(Self::number),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Array(items) => items
                .iter()
                .map(Self::from_json)
                .collect::<Option<Vec<_>>>()
                .map(Self::Array),
            _ => None,
        }
    }

    /// Convert a JSON value into a key of the declared type.
    ///
    /// A `DATE` accepts epoch milliseconds or an RFC 3339 string. `BLOB`
    /// accepts any key. Other types accept only the matching JSON shape and
    /// `INTEGER` additionally requires an integral number.
    pub fn from_json_typed(value: &Value, data_type: DataType) -> Option<Self> {
        match data_type {
            DataType::Date => match value {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
                    .map(Self::Date),
                Value::String(s) => Self::date_from_rfc3339(s),
                _ => None,
            },
            DataType::Integer => match value {
                Value::Number(n) => n
                    .as_f64()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .and_then(Self::number),
                _ => None,
            },
            DataType::Numeric => match value {
                Value::Number(n) => n.as_f64().and_then(Self::number),
                _ => None,
            },
            DataType::Text => match value {
                Value::String(s) => Some(Self::Text(s.clone())),
                _ => None,
            },
            DataType::Blob => Self::from_json(value),
        }
    }

    /// Whether the key satisfies the declared scalar type.
    pub fn conforms_to(&self, data_type: DataType) -> bool {
        match (data_type, self) {
            (DataType::Blob, key) => key.is_valid(),
            (DataType::Integer, Self::Number(n)) => n.is_finite() && n.fract() == 0.0,
            (DataType::Numeric, Self::Number(n)) => !n.is_nan(),
            (DataType::Date, Self::Date(_)) => true,
            (DataType::Text, Self::Text(_)) => true,
            _ => false,
        }
    }

    /// Convert the key back into JSON.
    ///
    /// Integral numbers within the safe range become JSON integers and dates
    /// become RFC 3339 strings. Infinite numbers have no JSON form and map to
    /// `null`.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Number(n) => {
                if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                    Value::from(*n as i64)
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(Value::Number)
                        .unwrap_or(Value::Null)
                }
            }
            Self::Date(ms) => match DateTime::<Utc>::from_timestamp_millis(*ms) {
                Some(dt) => Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)),
                None => Value::from(*ms),
            },
            Self::Text(s) => Value::String(s.clone()),
            Self::Array(items) => Value::Array(items.iter().map(Key::to_json).collect()),
        }
    }

    /// Position of the key's type in the key order: number, date, text, tuple.
    pub fn type_rank(&self) -> u8 {
        match self {
            Self::Number(_) => 0,
            Self::Date(_) => 1,
            Self::Text(_) => 2,
            Self::Array(_) => 3,
        }
    }
}

/// Fold `-0.0` into `0.0` so both compare and encode identically.
pub(crate) fn canonical(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => canonical(*a).total_cmp(&canonical(*b)),
            (Self::Date(a), Self::Date(b)) => a.cmp(b),
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Date(_) => match self.to_json() {
                Value::String(s) => write!(f, "{s}"),
                other => write!(f, "date({other})"),
            },
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Array(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
        }
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<f64> for Key {
    fn from(value: f64) -> Self {
        Self::Number(canonical(value))
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<u32> for Key {
    fn from(value: u32) -> Self {
        Self::Number(f64::from(value))
    }
}

impl From<Vec<Key>> for Key {
    fn from(value: Vec<Key>) -> Self {
        Self::Array(value)
    }
}
