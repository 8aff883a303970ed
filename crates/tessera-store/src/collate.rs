//! Order-preserving binary key encoding.
//!
//! `encode(a) < encode(b)` (bytewise) exactly when `a < b`, and no encoding
//! is a proper prefix of another. The cursor engine stores these bytes as
//! raw keys of an ordered KV store so its native iteration order is the
//! logical key order.
//!
//! Layout:
//!
//! | Key | Bytes |
//! |-----|-------|
//! | number | `0x10` + 8 bytes of order-preserving `f64` bits |
//! | date | `0x20` + 8 bytes of `i64` millis with the sign bit flipped |
//! | text | `0x30` + UTF-8 with `0x00` escaped as `00 FF`, then `00 00` |
//! | array | `0x50` + element encodings, then `00` |

use tessera_core::Key;

const TAG_NUMBER: u8 = 0x10;
const TAG_DATE: u8 = 0x20;
const TAG_TEXT: u8 = 0x30;
const TAG_ARRAY: u8 = 0x50;
const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0xFF;

/// Malformed collation bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed key bytes: {0}")]
pub struct DecodeError(&'static str);

/// Order-preserving bit pattern of a number.
pub fn number_bits(value: f64) -> u64 {
    let value = if value == 0.0 { 0.0 } else { value };
    let bits = value.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits ^ (1 << 63)
    }
}

/// Inverse of [`number_bits`].
pub fn number_from_bits(bits: u64) -> f64 {
    if bits & (1 << 63) != 0 {
        f64::from_bits(bits ^ (1 << 63))
    } else {
        f64::from_bits(!bits)
    }
}

/// Order-preserving bit pattern of a date.
pub fn date_bits(millis: i64) -> u64 {
    (millis as u64) ^ (1 << 63)
}

/// Inverse of [`date_bits`].
pub fn date_from_bits(bits: u64) -> i64 {
    (bits ^ (1 << 63)) as i64
}

/// Encode a key.
pub fn encode(key: &Key) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    encode_into(key, &mut out);
    out
}

/// Append the encoding of `key` to `out`.
pub fn encode_into(key: &Key, out: &mut Vec<u8>) {
    match key {
        Key::Number(n) => {
            out.push(TAG_NUMBER);
            out.extend_from_slice(&number_bits(*n).to_be_bytes());
        }
        Key::Date(ms) => {
            out.push(TAG_DATE);
            out.extend_from_slice(&date_bits(*ms).to_be_bytes());
        }
        Key::Text(s) => {
            out.push(TAG_TEXT);
            for &b in s.as_bytes() {
                out.push(b);
                if b == TERMINATOR {
                    out.push(ESCAPE);
                }
            }
            out.extend_from_slice(&[TERMINATOR, TERMINATOR]);
        }
        Key::Array(items) => {
            out.push(TAG_ARRAY);
            for item in items {
                encode_into(item, out);
            }
            out.push(TERMINATOR);
        }
    }
}

/// Decode a complete key. Trailing bytes are an error.
pub fn decode(bytes: &[u8]) -> Result<Key, DecodeError> {
    let (key, rest) = decode_prefix(bytes)?;
    if rest.is_empty() {
        Ok(key)
    } else {
        Err(DecodeError("trailing bytes"))
    }
}

/// Decode one key from the front of `bytes`, returning the remainder.
pub fn decode_prefix(bytes: &[u8]) -> Result<(Key, &[u8]), DecodeError> {
    let (&tag, rest) = bytes.split_first().ok_or(DecodeError("empty input"))?;
    match tag {
        TAG_NUMBER => {
            let (word, rest) = take_u64(rest)?;
            Ok((Key::Number(number_from_bits(word)), rest))
        }
        TAG_DATE => {
            let (word, rest) = take_u64(rest)?;
            Ok((Key::Date(date_from_bits(word)), rest))
        }
        TAG_TEXT => {
            let mut text = Vec::new();
            let mut i = 0;
            loop {
                match (rest.get(i), rest.get(i + 1)) {
                    (Some(&TERMINATOR), Some(&TERMINATOR)) => break,
                    (Some(&TERMINATOR), Some(&ESCAPE)) => {
                        text.push(TERMINATOR);
                        i += 2;
                    }
                    (Some(&TERMINATOR), _) => return Err(DecodeError("bad text escape")),
                    (Some(&b), _) => {
                        text.push(b);
                        i += 1;
                    }
                    (None, _) => return Err(DecodeError("unterminated text")),
                }
            }
            let text = String::from_utf8(text).map_err(|_| DecodeError("text is not UTF-8"))?;
            Ok((Key::Text(text), &rest[i + 2..]))
        }
        TAG_ARRAY => {
            let mut items = Vec::new();
            let mut rest = rest;
            loop {
                match rest.first() {
                    Some(&TERMINATOR) => return Ok((Key::Array(items), &rest[1..])),
                    Some(_) => {
                        let (item, next) = decode_prefix(rest)?;
                        items.push(item);
                        rest = next;
                    }
                    None => return Err(DecodeError("unterminated array")),
                }
            }
        }
        _ => Err(DecodeError("unknown tag")),
    }
}

fn take_u64(bytes: &[u8]) -> Result<(u64, &[u8]), DecodeError> {
    if bytes.len() < 8 {
        return Err(DecodeError("truncated number"));
    }
    let (head, rest) = bytes.split_at(8);
    let mut word = [0u8; 8];
    word.copy_from_slice(head);
    Ok((u64::from_be_bytes(word), rest))
}

/// Raw key of an index entry: the pair `[index_key, primary_key]`.
pub fn index_entry(index_key: &Key, primary_key: &Key) -> Vec<u8> {
    let mut out = index_prefix(index_key);
    encode_into(primary_key, &mut out);
    out.push(TERMINATOR);
    out
}

/// Prefix shared by every index entry whose index key is `index_key`.
pub fn index_prefix(index_key: &Key) -> Vec<u8> {
    let mut out = vec![TAG_ARRAY];
    encode_into(index_key, &mut out);
    out
}

/// Split an index entry into `(index_key, primary_key)`.
pub fn split_index_entry(bytes: &[u8]) -> Result<(Key, Key), DecodeError> {
    match decode(bytes)? {
        Key::Array(mut pair) if pair.len() == 2 => {
            let primary = pair.pop().ok_or(DecodeError("index entry"))?;
            let index = pair.pop().ok_or(DecodeError("index entry"))?;
            Ok((index, primary))
        }
        _ => Err(DecodeError("index entry is not a pair")),
    }
}

/// Exclusive upper bound covering every encoding that starts with `prefix`.
pub fn past_prefix(mut prefix: Vec<u8>) -> Vec<u8> {
    prefix.push(ESCAPE);
    prefix
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sorted_by_bytes(keys: &[Key]) -> Vec<Key> {
        let mut encoded: Vec<_> = keys.iter().map(encode).collect();
        encoded.sort();
        encoded.iter().map(|b| decode(b).unwrap()).collect()
    }

    #[test]
    fn byte_order_matches_key_order() {
        let keys = vec![
            Key::from("b"),
            Key::from(f64::INFINITY),
            Key::from(-1.5),
            Key::from(f64::NEG_INFINITY),
            Key::from(0),
            Key::Date(-5),
            Key::Date(5),
            Key::from("a\u{0}"),
            Key::from("a"),
            Key::from(""),
            Key::Array(vec![]),
            Key::Array(vec![Key::from(1)]),
            Key::Array(vec![Key::from(1), Key::from("x")]),
            Key::Array(vec![Key::from("a")]),
        ];
        let mut expected = keys.clone();
        expected.sort();
        assert_eq!(sorted_by_bytes(&keys), expected);
    }

    #[test]
    fn negative_zero_encodes_as_zero() {
        assert_eq!(encode(&Key::Number(-0.0)), encode(&Key::from(0)));
    }

    #[test]
    fn index_entries_group_by_index_key() {
        let a1 = index_entry(&Key::from("a"), &Key::from(1));
        let a2 = index_entry(&Key::from("a"), &Key::from(2));
        let b1 = index_entry(&Key::from("b"), &Key::from(1));
        let prefix = index_prefix(&Key::from("a"));
        let upper = past_prefix(prefix.clone());
        for entry in [&a1, &a2] {
            assert!(entry.as_slice() >= prefix.as_slice() && entry.as_slice() < upper.as_slice());
        }
        assert!(b1.as_slice() > upper.as_slice());
        assert_eq!(
            split_index_entry(&a2).unwrap(),
            (Key::from("a"), Key::from(2))
        );
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[TAG_NUMBER, 1, 2]).is_err());
        assert!(decode(&[TAG_TEXT, b'a']).is_err());
        assert!(decode(&[TAG_ARRAY]).is_err());
        assert!(decode(&[0x99]).is_err());
        let mut extra = encode(&Key::from(1));
        extra.push(0);
        assert!(decode(&extra).is_err());
    }
}
