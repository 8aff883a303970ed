//! Key codec: logical keys to backend-native values and back.
//!
//! The cursor engine stores [`collate`](crate::collate) bytes directly, so
//! its codec only validates keys against the declared type. The SQL engine
//! has scalar columns only: typed scalars map to typed columns, untyped keys
//! to a hex text column, and composite keys to a tagged tuple string.

use tessera_core::{key_matches_type, DataType, Key, KeyPath, TypeSpec};

use crate::collate;
use crate::error::{ErrorContext, StoreError, StoreResult};

/// Separator between tuple segments (U+001F, unit separator).
pub const TUPLE_SEP: char = '\u{1f}';

// Element tags sort in key order: number < date < text.
const TAG_NUMBER: char = 'n';
const TAG_DATE: char = 'p';
const TAG_TEXT: char = 's';

/// Starts a two-character escape in tuple text elements. Control characters
/// up to the separator become `ESC, c + 0x20`; `ESC` itself becomes
/// `ESC, '@'`. Every escaped form sorts above the separator and below `'!'`,
/// so escaped text keeps code point order.
const TUPLE_ESC: char = ' ';

/// A scalar SQL value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// How a key is laid out in one SQL column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnEncoding {
    /// `INTEGER` holding an integral number.
    Integer,
    /// `REAL` holding any number.
    Real,
    /// `INTEGER` holding epoch milliseconds.
    Date,
    /// `TEXT` holding a text key.
    Text,
    /// `BLOB` holding collation bytes.
    Blob,
    /// `TEXT` holding lowercase hex of the collation bytes.
    Generic,
    /// `TEXT` holding a tagged tuple, with optional per-element types.
    Tuple(Option<Vec<DataType>>),
}

impl ColumnEncoding {
    /// Encoding of a column holding keys of `key_path` with the declared type.
    pub fn for_key(key_path: Option<&KeyPath>, spec: Option<&TypeSpec>) -> Self {
        if key_path.is_some_and(KeyPath::is_composite) {
            return Self::Tuple(match spec {
                Some(TypeSpec::Composite(types)) => Some(types.clone()),
                _ => None,
            });
        }
        match spec.and_then(TypeSpec::scalar) {
            Some(DataType::Integer) => Self::Integer,
            Some(DataType::Numeric) => Self::Real,
            Some(DataType::Date) => Self::Date,
            Some(DataType::Text) => Self::Text,
            Some(DataType::Blob) => Self::Blob,
            None => Self::Generic,
        }
    }

    /// Encoding of the value column of a multiEntry synthetic table.
    pub fn for_entry(spec: Option<&TypeSpec>) -> Self {
        Self::for_key(None, spec)
    }

    /// Declared SQL column type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Integer | Self::Date => "INTEGER",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
            Self::Text | Self::Generic | Self::Tuple(_) => "TEXT",
        }
    }

    /// Whether values are plain text keys, so `LIKE 'prefix%'` is a prefix match.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text)
    }

    /// Type rank (see [`Key::type_rank`]) of every key the column holds, or
    /// `None` when the column holds keys of any type.
    fn key_rank(&self) -> Option<u8> {
        match self {
            Self::Integer | Self::Real => Some(0),
            Self::Date => Some(1),
            Self::Text => Some(2),
            Self::Tuple(_) => Some(3),
            Self::Blob | Self::Generic => None,
        }
    }

    /// Whether `key` can be stored in the column as is.
    pub fn accepts(&self, key: &Key) -> bool {
        match self {
            Self::Integer => key.conforms_to(DataType::Integer),
            Self::Real => key.conforms_to(DataType::Numeric),
            Self::Date => key.conforms_to(DataType::Date),
            Self::Text => key.conforms_to(DataType::Text),
            Self::Blob | Self::Generic => key.is_valid(),
            Self::Tuple(Some(types)) => {
                key_matches_type(key, Some(&TypeSpec::Composite(types.clone())))
            }
            Self::Tuple(None) => matches!(key, Key::Array(_)) && key.is_valid(),
        }
    }
}

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::invalid_key(ErrorContext::default(), message)
}

/// Validate a key for the cursor engine and return its native bytes.
pub fn encode_native(key: &Key, spec: Option<&TypeSpec>) -> StoreResult<Vec<u8>> {
    if !key_matches_type(key, spec) {
        return Err(invalid(format!("{key} does not match the declared key type")));
    }
    Ok(collate::encode(key))
}

/// Decode cursor-engine bytes.
pub fn decode_native(bytes: &[u8]) -> StoreResult<Key> {
    collate::decode(bytes).map_err(|e| StoreError::backend(ErrorContext::default(), e))
}

/// Encode a key into one SQL column.
pub fn encode_sql(key: &Key, encoding: &ColumnEncoding) -> StoreResult<SqlValue> {
    if !encoding.accepts(key) {
        return Err(invalid(format!(
            "{key} cannot be stored in a {} column",
            encoding.sql_type()
        )));
    }
    match (encoding, key) {
        (ColumnEncoding::Integer, Key::Number(n)) => Ok(SqlValue::Integer(*n as i64)),
        (ColumnEncoding::Real, Key::Number(n)) => Ok(SqlValue::Real(*n)),
        (ColumnEncoding::Date, Key::Date(ms)) => Ok(SqlValue::Integer(*ms)),
        (ColumnEncoding::Text, Key::Text(s)) => Ok(SqlValue::Text(s.clone())),
        (ColumnEncoding::Blob, key) => Ok(SqlValue::Blob(collate::encode(key))),
        (ColumnEncoding::Generic, key) => Ok(SqlValue::Text(encode_generic(key))),
        (ColumnEncoding::Tuple(_), key) => encode_tuple(Some(key)).map(SqlValue::Text),
        _ => Err(invalid(format!("{key} does not fit the column"))),
    }
}

/// Which end of a key range a bound sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundSide {
    Lower,
    Upper,
}

/// A range bound translated into the value domain of one column.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlBound {
    /// Compare against `value`, strictly when `open`.
    Value { value: SqlValue, open: bool },
    /// Every value of the column is on the inner side of the bound.
    Unbounded,
    /// No value of the column is on the inner side of the bound.
    Empty,
}

/// Translate a range bound so a column answers it the way the key order
/// would.
///
/// Keys of a type the column cannot hold sort entirely below or above the
/// column's keys, so that side of the range becomes unbounded or empty.
/// Bounds on integer columns round toward the inside of the range.
pub fn encode_bound(
    key: &Key,
    open: bool,
    side: BoundSide,
    encoding: &ColumnEncoding,
) -> StoreResult<SqlBound> {
    match (encoding, key) {
        (ColumnEncoding::Integer, Key::Number(n)) if !n.is_nan() => {
            return Ok(integer_bound(*n, open, side))
        }
        (ColumnEncoding::Tuple(_), Key::Array(_)) => {
            let value = SqlValue::Text(encode_tuple(Some(key))?);
            return Ok(SqlBound::Value { value, open });
        }
        _ => {}
    }
    if encoding.accepts(key) {
        let value = encode_sql(key, encoding)?;
        return Ok(SqlBound::Value { value, open });
    }
    let rank = match encoding.key_rank() {
        Some(rank) if key.is_valid() => rank,
        _ => return encode_sql(key, encoding).map(|value| SqlBound::Value { value, open }),
    };
    let below = key.type_rank() < rank;
    Ok(match (side, below) {
        (BoundSide::Lower, true) | (BoundSide::Upper, false) => SqlBound::Unbounded,
        (BoundSide::Lower, false) | (BoundSide::Upper, true) => SqlBound::Empty,
    })
}

fn integer_bound(n: f64, open: bool, side: BoundSide) -> SqlBound {
    // 2^63, the first value above i64::MAX
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;
    let rounded = match side {
        BoundSide::Lower => n.ceil(),
        BoundSide::Upper => n.floor(),
    };
    if rounded >= LIMIT {
        return match side {
            BoundSide::Lower => SqlBound::Empty,
            BoundSide::Upper => SqlBound::Unbounded,
        };
    }
    if rounded < -LIMIT {
        return match side {
            BoundSide::Lower => SqlBound::Unbounded,
            BoundSide::Upper => SqlBound::Empty,
        };
    }
    SqlBound::Value {
        value: SqlValue::Integer(rounded as i64),
        open: open && rounded == n,
    }
}

/// Decode one SQL column value.
pub fn decode_sql(value: &SqlValue, encoding: &ColumnEncoding) -> StoreResult<Key> {
    match (encoding, value) {
        (ColumnEncoding::Integer | ColumnEncoding::Real, SqlValue::Integer(i)) => {
            Ok(Key::Number(*i as f64))
        }
        (ColumnEncoding::Integer | ColumnEncoding::Real, SqlValue::Real(f)) => {
            Key::number(*f).ok_or_else(|| invalid("NaN in numeric column"))
        }
        (ColumnEncoding::Date, SqlValue::Integer(ms)) => Ok(Key::Date(*ms)),
        (ColumnEncoding::Text, SqlValue::Text(s)) => Ok(Key::Text(s.clone())),
        (ColumnEncoding::Blob, SqlValue::Blob(b)) => decode_native(b),
        (ColumnEncoding::Generic, SqlValue::Text(s)) => decode_generic(s),
        (ColumnEncoding::Tuple(_), SqlValue::Text(s)) => decode_tuple(s),
        (enc, other) => Err(invalid(format!(
            "unexpected {other:?} in {} column",
            enc.sql_type()
        ))),
    }
}

/// Binary-safe, order-preserving text form of any key.
pub fn encode_generic(key: &Key) -> String {
    hex::encode(collate::encode(key))
}

/// Inverse of [`encode_generic`].
pub fn decode_generic(text: &str) -> StoreResult<Key> {
    let bytes = hex::decode(text).map_err(|e| invalid(format!("bad generic key text: {e}")))?;
    decode_native(&bytes)
}

/// Encode a tuple as `<tags><SEP><elem><SEP>...<SEP>`.
///
/// An absent value encodes as the one-element tuple `[""]`. Tuples with the
/// same tags sort like the keys they encode.
pub fn encode_tuple(key: Option<&Key>) -> StoreResult<String> {
    let empty = [Key::Text(String::new())];
    let items: &[Key] = match key {
        None => &empty,
        Some(Key::Array(items)) => items,
        Some(other) => std::slice::from_ref(other),
    };
    let mut tags = String::with_capacity(items.len());
    let mut body = String::new();
    for item in items {
        match item {
            Key::Number(n) if !n.is_nan() => {
                tags.push(TAG_NUMBER);
                body.push_str(&format!("{:016x}", collate::number_bits(*n)));
            }
            Key::Date(ms) => {
                tags.push(TAG_DATE);
                body.push_str(&format!("{:016x}", collate::date_bits(*ms)));
            }
            Key::Text(s) => {
                tags.push(TAG_TEXT);
                escape_text(s, &mut body);
            }
            Key::Array(_) => return Err(invalid("nested tuples are not supported")),
            Key::Number(_) => return Err(invalid("NaN tuple element")),
        }
        body.push(TUPLE_SEP);
    }
    Ok(format!("{tags}{TUPLE_SEP}{body}"))
}

/// Inverse of [`encode_tuple`].
pub fn decode_tuple(text: &str) -> StoreResult<Key> {
    let mut segments: Vec<&str> = text.split(TUPLE_SEP).collect();
    if segments.last() == Some(&"") {
        segments.pop();
    }
    let (tags, elements) = segments
        .split_first()
        .ok_or_else(|| invalid("empty tuple text"))?;
    if tags.chars().count() != elements.len() {
        return Err(invalid(format!(
            "tuple tag {tags:?} does not match {} elements",
            elements.len()
        )));
    }
    let mut items = Vec::with_capacity(elements.len());
    for (tag, element) in tags.chars().zip(elements) {
        let item = match tag {
            TAG_NUMBER => Key::Number(collate::number_from_bits(parse_word(element)?)),
            TAG_DATE => Key::Date(collate::date_from_bits(parse_word(element)?)),
            TAG_TEXT => Key::Text(unescape_text(element)?),
            other => return Err(invalid(format!("unknown tuple tag {other:?}"))),
        };
        items.push(item);
    }
    Ok(Key::Array(items))
}

fn escape_text(text: &str, out: &mut String) {
    for c in text.chars() {
        if c <= TUPLE_SEP {
            out.push(TUPLE_ESC);
            out.push(char::from(c as u8 + 0x20));
        } else if c == TUPLE_ESC {
            out.push(TUPLE_ESC);
            out.push('@');
        } else {
            out.push(c);
        }
    }
}

fn unescape_text(text: &str) -> StoreResult<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != TUPLE_ESC {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('@') => out.push(TUPLE_ESC),
            Some(e @ ' '..='?') => out.push(char::from(e as u8 - 0x20)),
            other => return Err(invalid(format!("bad escape {other:?} in tuple text"))),
        }
    }
    Ok(out)
}

fn parse_word(text: &str) -> StoreResult<u64> {
    u64::from_str_radix(text, 16).map_err(|e| invalid(format!("bad tuple number {text:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn absent_value_is_single_empty_text() {
        let text = encode_tuple(None).unwrap();
        assert_eq!(text, "s\u{1f}\u{1f}");
        assert_eq!(
            decode_tuple(&text).unwrap(),
            Key::Array(vec![Key::Text(String::new())])
        );
    }

    #[test]
    fn typed_columns() {
        assert_eq!(
            encode_sql(&Key::from(3), &ColumnEncoding::Integer).unwrap(),
            SqlValue::Integer(3)
        );
        assert_eq!(
            encode_sql(&Key::from(2.5), &ColumnEncoding::Real).unwrap(),
            SqlValue::Real(2.5)
        );
        assert_eq!(
            encode_sql(&Key::Date(99), &ColumnEncoding::Date).unwrap(),
            SqlValue::Integer(99)
        );
        assert_eq!(
            decode_sql(&SqlValue::Integer(4), &ColumnEncoding::Real).unwrap(),
            Key::from(4)
        );
        let err = encode_sql(&Key::from(2.5), &ColumnEncoding::Integer).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidKey);
        assert!(encode_sql(&Key::from("x"), &ColumnEncoding::Date).is_err());
    }

    #[test]
    fn tuple_rejects_nested_tuples() {
        let nested = Key::Array(vec![Key::Array(vec![])]);
        assert!(encode_tuple(Some(&nested)).is_err());
    }

    #[test]
    fn tuple_text_escapes_control_characters() {
        let key = Key::Array(vec![Key::from("a\u{1f}b c\u{0}")]);
        let text = encode_tuple(Some(&key)).unwrap();
        assert_eq!(text, "s\u{1f}a ?b @c \u{20}\u{1f}");
        assert_eq!(decode_tuple(&text).unwrap(), key);

        let mut keys: Vec<Key> = ["a", "a\u{1}", "a\u{1f}", "a ", "a!", "ab", ""]
            .into_iter()
            .map(|s| Key::Array(vec![Key::from(s)]))
            .collect();
        let mut texts: Vec<String> = keys.iter().map(|k| encode_tuple(Some(k)).unwrap()).collect();
        keys.sort();
        texts.sort();
        let decoded: Vec<Key> = texts.iter().map(|t| decode_tuple(t).unwrap()).collect();
        assert_eq!(decoded, keys);
    }

    #[test]
    fn tuple_tags_follow_key_order() {
        let number = Key::Array(vec![Key::from(5)]);
        let date = Key::Array(vec![Key::Date(1)]);
        let text = Key::Array(vec![Key::from("a")]);
        let n = encode_tuple(Some(&number)).unwrap();
        let d = encode_tuple(Some(&date)).unwrap();
        let t = encode_tuple(Some(&text)).unwrap();
        assert!(n < d && d < t);
    }

    fn value(bound: SqlBound) -> Option<(SqlValue, bool)> {
        match bound {
            SqlBound::Value { value, open } => Some((value, open)),
            _ => None,
        }
    }

    #[test]
    fn integer_bounds_round_inward() {
        let enc = ColumnEncoding::Integer;
        let lower = encode_bound(&Key::from(1.5), true, BoundSide::Lower, &enc).unwrap();
        assert_eq!(value(lower), Some((SqlValue::Integer(2), false)));
        let upper = encode_bound(&Key::from(3.5), true, BoundSide::Upper, &enc).unwrap();
        assert_eq!(value(upper), Some((SqlValue::Integer(3), false)));
        let whole = encode_bound(&Key::from(-4.0), true, BoundSide::Lower, &enc).unwrap();
        assert_eq!(value(whole), Some((SqlValue::Integer(-4), true)));
        let upper = encode_bound(&Key::from(-0.5), false, BoundSide::Upper, &enc).unwrap();
        assert_eq!(value(upper), Some((SqlValue::Integer(-1), false)));

        let huge = Key::from(f64::INFINITY);
        assert_eq!(encode_bound(&huge, false, BoundSide::Lower, &enc).unwrap(), SqlBound::Empty);
        assert_eq!(encode_bound(&huge, false, BoundSide::Upper, &enc).unwrap(), SqlBound::Unbounded);
        let tiny = Key::from(f64::NEG_INFINITY);
        assert_eq!(encode_bound(&tiny, false, BoundSide::Lower, &enc).unwrap(), SqlBound::Unbounded);
        assert_eq!(encode_bound(&tiny, false, BoundSide::Upper, &enc).unwrap(), SqlBound::Empty);
    }

    #[test]
    fn foreign_typed_bounds_follow_key_order() {
        // text sorts above every number
        let text = Key::from("x");
        assert_eq!(
            encode_bound(&text, false, BoundSide::Lower, &ColumnEncoding::Real).unwrap(),
            SqlBound::Empty
        );
        assert_eq!(
            encode_bound(&text, false, BoundSide::Upper, &ColumnEncoding::Real).unwrap(),
            SqlBound::Unbounded
        );
        // numbers sort below every text and date
        let number = Key::from(7);
        for enc in [ColumnEncoding::Text, ColumnEncoding::Date] {
            assert_eq!(
                encode_bound(&number, true, BoundSide::Lower, &enc).unwrap(),
                SqlBound::Unbounded
            );
            assert_eq!(
                encode_bound(&number, true, BoundSide::Upper, &enc).unwrap(),
                SqlBound::Empty
            );
        }
        // every valid key fits a generic column
        let generic = encode_bound(&text, true, BoundSide::Lower, &ColumnEncoding::Generic).unwrap();
        assert_eq!(value(generic), Some((SqlValue::Text(encode_generic(&text)), true)));
    }

    #[test]
    fn encoding_selection() {
        let composite = KeyPath::from(vec!["a", "b"]);
        assert_eq!(
            ColumnEncoding::for_key(Some(&composite), None),
            ColumnEncoding::Tuple(None)
        );
        assert_eq!(
            ColumnEncoding::for_key(Some(&KeyPath::from("id")), Some(&TypeSpec::Scalar(DataType::Numeric))),
            ColumnEncoding::Real
        );
        assert_eq!(ColumnEncoding::for_key(None, None), ColumnEncoding::Generic);
    }

    fn scalar() -> impl Strategy<Value = Key> {
        prop_oneof![
            (-1.0e15f64..1.0e15).prop_map(Key::from),
            any::<i64>().prop_map(Key::Date),
            "[\\x00-~]{0,12}".prop_map(Key::from),
        ]
    }

    fn any_key() -> impl Strategy<Value = Key> {
        scalar().prop_recursive(2, 12, 4, |inner| {
            prop::collection::vec(inner, 0..4).prop_map(Key::Array)
        })
    }

    proptest! {
        #[test]
        fn collation_round_trip(key in any_key()) {
            prop_assert_eq!(decode_native(&encode_native(&key, None).unwrap()).unwrap(), key);
        }

        #[test]
        fn generic_round_trip_and_order(a in any_key(), b in any_key()) {
            let ea = encode_generic(&a);
            let eb = encode_generic(&b);
            prop_assert_eq!(decode_generic(&ea).unwrap(), a.clone());
            prop_assert_eq!(ea.cmp(&eb), a.cmp(&b));
        }

        #[test]
        fn tuple_round_trip(items in prop::collection::vec(scalar(), 1..5)) {
            let key = Key::Array(items);
            let text = encode_tuple(Some(&key)).unwrap();
            prop_assert_eq!(decode_tuple(&text).unwrap(), key);
        }

        #[test]
        fn tuple_order_within_one_shape(a in (-1.0e9f64..1.0e9, "[a-z]{0,6}"), b in (-1.0e9f64..1.0e9, "[a-z]{0,6}")) {
            let ka = Key::Array(vec![Key::from(a.0), Key::from(a.1)]);
            let kb = Key::Array(vec![Key::from(b.0), Key::from(b.1)]);
            let ta = encode_tuple(Some(&ka)).unwrap();
            let tb = encode_tuple(Some(&kb)).unwrap();
            prop_assert_eq!(ta.cmp(&tb), ka.cmp(&kb));
        }

        #[test]
        fn typed_scalar_round_trip(n in any::<i32>(), ms in any::<i64>(), s in ".{0,10}") {
            for (key, enc) in [
                (Key::from(n), ColumnEncoding::Integer),
                (Key::from(n), ColumnEncoding::Real),
                (Key::Date(ms), ColumnEncoding::Date),
                (Key::from(s.as_str()), ColumnEncoding::Text),
                (Key::from(s.as_str()), ColumnEncoding::Blob),
            ] {
                let value = encode_sql(&key, &enc).unwrap();
                prop_assert_eq!(decode_sql(&value, &enc).unwrap(), key);
            }
        }
    }
}
