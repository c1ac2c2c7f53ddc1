// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

use serde_json::{Map, Number, Value};
use unicode_normalization::UnicodeNormalization;

const TAG_NULL: u8 = 0xc0;
const TAG_FALSE: u8 = 0xc1;
const TAG_TRUE: u8 = 0xc2;
const TAG_INT_POS: u8 = 0xc3;
const TAG_INT_NEG: u8 = 0xc4;
const TAG_FLOAT: u8 = 0xc5;
const TAG_STRING: u8 = 0xc6;
const TAG_ARRAY: u8 = 0xc7;
const TAG_MAP: u8 = 0xc8;

/// Multihash code for blake3-256.
const MULTIHASH_BLAKE3: u8 = 0x1e;
/// Digest length in bytes.
const DIGEST_LEN: u8 = 0x20;

/// Nesting depth cap for both encoding and decoding.
const MAX_DEPTH: usize = 128;

/// Errors produced while encoding a value to canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// A float was NaN or infinite.
    #[error("non-finite number is not representable")]
    NonFinite,
    /// Two map keys collapsed to the same string after NFC normalization.
    #[error("duplicate map key after normalization: {key}")]
    DuplicateKey {
        /// The colliding key.
        key: String,
    },
    /// The value nests deeper than the supported limit.
    #[error("value nests deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

/// Errors produced while decoding canonical bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// The input ended before a complete value was read.
    #[error("unexpected end of input at offset {offset}")]
    Truncated {
        /// Byte offset at which more input was expected.
        offset: usize,
    },
    /// An unknown type tag was encountered.
    #[error("unknown tag {tag:#04x} at offset {offset}")]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
        /// Byte offset of the tag.
        offset: usize,
    },
    /// A string segment was not valid UTF-8.
    #[error("invalid utf-8 in string at offset {offset}")]
    InvalidUtf8 {
        /// Byte offset of the string payload.
        offset: usize,
    },
    /// Map keys were not strictly increasing, or a number was malformed.
    #[error("non-canonical encoding: {reason}")]
    NonCanonical {
        /// What rule was violated.
        reason: String,
    },
    /// Bytes remained after the top-level value.
    #[error("{0} trailing bytes after value")]
    TrailingBytes(usize),
    /// The input nests deeper than the supported limit.
    #[error("input nests deeper than {MAX_DEPTH} levels")]
    TooDeep,
}

/// Normalize a JSON-like value into its canonical form.
///
/// Strings (including map keys) are NFC-normalized and map keys are sorted
/// by code point. Array order is preserved. The result is the value that
/// [`decode`] returns for `encode(v)`.
///
/// # Errors
///
/// Returns [`EncodeError::DuplicateKey`] if two keys collide after
/// normalization, or [`EncodeError::TooDeep`] past the nesting limit.
pub fn normalize(value: &Value) -> Result<Value, EncodeError> {
    normalize_at(value, 0)
}

fn normalize_at(value: &Value, depth: usize) -> Result<Value, EncodeError> {
    if depth > MAX_DEPTH {
        return Err(EncodeError::TooDeep);
    }
    Ok(match value {
        Value::Null => Value::Null,
        Value::Bool(b) => Value::Bool(*b),
        Value::Number(n) => Value::Number(n.clone()),
        Value::String(s) => Value::String(nfc(s)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| normalize_at(v, depth + 1))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(obj) => {
            let mut pairs: Vec<(String, Value)> = Vec::with_capacity(obj.len());
            for (k, v) in obj {
                pairs.push((nfc(k), normalize_at(v, depth + 1)?));
            }
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            for w in pairs.windows(2) {
                if w[0].0 == w[1].0 {
                    return Err(EncodeError::DuplicateKey { key: w[0].0.clone() });
                }
            }
            let mut out = Map::new();
            for (k, v) in pairs {
                out.insert(k, v);
            }
            Value::Object(out)
        }
    })
}

fn nfc(s: &str) -> String {
    s.nfc().collect()
}

/// Encode a JSON-like value to canonical bytes (OML-C).
///
/// The encoding is deterministic: byte-identical for equal values across
/// runs and implementations.
///
/// # Examples
///
/// ```
/// let a = serde_json::json!({"b": 1, "a": 2});
/// let b = serde_json::json!({"a": 2, "b": 1});
/// assert_eq!(odin_oml::encode(&a).unwrap(), odin_oml::encode(&b).unwrap());
/// ```
///
/// # Errors
///
/// Returns an [`EncodeError`] for non-finite floats, colliding map keys,
/// or values nested past the depth limit.
pub fn encode(value: &Value) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::new();
    encode_into(value, &mut out, 0)?;
    Ok(out)
}

fn encode_into(value: &Value, out: &mut Vec<u8>, depth: usize) -> Result<(), EncodeError> {
    if depth > MAX_DEPTH {
        return Err(EncodeError::TooDeep);
    }
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Number(n) => encode_number(n, out)?,
        Value::String(s) => encode_string(&nfc(s), out),
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            write_uvarint(items.len() as u64, out);
            for item in items {
                encode_into(item, out, depth + 1)?;
            }
        }
        Value::Object(obj) => {
            let mut pairs: Vec<(String, &Value)> = obj.iter().map(|(k, v)| (nfc(k), v)).collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0));
            for w in pairs.windows(2) {
                if w[0].0 == w[1].0 {
                    return Err(EncodeError::DuplicateKey { key: w[0].0.clone() });
                }
            }
            out.push(TAG_MAP);
            write_uvarint(pairs.len() as u64, out);
            for (k, v) in pairs {
                encode_string(&k, out);
                encode_into(v, out, depth + 1)?;
            }
        }
    }
    Ok(())
}

fn encode_number(n: &Number, out: &mut Vec<u8>) -> Result<(), EncodeError> {
    if let Some(i) = n.as_i64() {
        if i >= 0 {
            out.push(TAG_INT_POS);
            write_uvarint(i as u64, out);
        } else {
            out.push(TAG_INT_NEG);
            write_uvarint(i.unsigned_abs(), out);
        }
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        out.push(TAG_INT_POS);
        write_uvarint(u, out);
        return Ok(());
    }
    let f = n.as_f64().ok_or(EncodeError::NonFinite)?;
    if !f.is_finite() {
        return Err(EncodeError::NonFinite);
    }
    // Rust's Display for f64 is the shortest text that round-trips.
    let text = format!("{f}");
    out.push(TAG_FLOAT);
    write_uvarint(text.len() as u64, out);
    out.extend_from_slice(text.as_bytes());
    Ok(())
}

fn encode_string(s: &str, out: &mut Vec<u8>) {
    out.push(TAG_STRING);
    write_uvarint(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

fn write_uvarint(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decode canonical bytes back into a value.
///
/// Strict inverse of [`encode`]: unsorted or duplicate map keys, malformed
/// numbers, and trailing bytes are all rejected.
///
/// # Errors
///
/// Returns a [`DecodeError`] describing the first violation found.
pub fn decode(bytes: &[u8]) -> Result<Value, DecodeError> {
    let mut cursor = Cursor { buf: bytes, pos: 0 };
    let value = decode_value(&mut cursor, 0)?;
    if cursor.pos != bytes.len() {
        return Err(DecodeError::TrailingBytes(bytes.len() - cursor.pos));
    }
    Ok(value)
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Result<u8, DecodeError> {
        let b = *self
            .buf
            .get(self.pos)
            .ok_or(DecodeError::Truncated { offset: self.pos })?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.buf.len())
            .ok_or(DecodeError::Truncated { offset: self.pos })?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn uvarint(&mut self) -> Result<u64, DecodeError> {
        let mut value: u64 = 0;
        let mut shift = 0u32;
        loop {
            let b = self.byte()?;
            if shift >= 64 {
                return Err(DecodeError::NonCanonical {
                    reason: "varint overflows u64".into(),
                });
            }
            value |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                if b == 0 && shift > 0 {
                    return Err(DecodeError::NonCanonical {
                        reason: "varint has redundant trailing zero".into(),
                    });
                }
                return Ok(value);
            }
            shift += 7;
        }
    }
}

fn decode_value(c: &mut Cursor<'_>, depth: usize) -> Result<Value, DecodeError> {
    if depth > MAX_DEPTH {
        return Err(DecodeError::TooDeep);
    }
    let offset = c.pos;
    let tag = c.byte()?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_INT_POS => {
            let u = c.uvarint()?;
            Ok(Value::Number(Number::from(u)))
        }
        TAG_INT_NEG => {
            let mag = c.uvarint()?;
            if mag == 0 {
                return Err(DecodeError::NonCanonical {
                    reason: "negative zero integer".into(),
                });
            }
            if mag > (i64::MAX as u64) + 1 {
                return Err(DecodeError::NonCanonical {
                    reason: "negative integer out of range".into(),
                });
            }
            let i = (mag as i128).wrapping_neg() as i64;
            Ok(Value::Number(Number::from(i)))
        }
        TAG_FLOAT => {
            let len = c.uvarint()? as usize;
            let text_pos = c.pos;
            let raw = c.take(len)?;
            let text = std::str::from_utf8(raw)
                .map_err(|_| DecodeError::InvalidUtf8 { offset: text_pos })?;
            let f: f64 = text.parse().map_err(|_| DecodeError::NonCanonical {
                reason: format!("unparseable float text {text:?}"),
            })?;
            let n = Number::from_f64(f).ok_or(DecodeError::NonCanonical {
                reason: "non-finite float".into(),
            })?;
            Ok(Value::Number(n))
        }
        TAG_STRING => Ok(Value::String(decode_string(c)?)),
        TAG_ARRAY => {
            let count = c.uvarint()? as usize;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(decode_value(c, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        TAG_MAP => {
            let count = c.uvarint()? as usize;
            let mut out = Map::new();
            let mut prev: Option<String> = None;
            for _ in 0..count {
                let key_offset = c.pos;
                let key_tag = c.byte()?;
                if key_tag != TAG_STRING {
                    return Err(DecodeError::UnknownTag {
                        tag: key_tag,
                        offset: key_offset,
                    });
                }
                let key = decode_string(c)?;
                if let Some(p) = &prev {
                    if *p >= key {
                        return Err(DecodeError::NonCanonical {
                            reason: format!("map keys not strictly increasing at {key:?}"),
                        });
                    }
                }
                let value = decode_value(c, depth + 1)?;
                prev = Some(key.clone());
                out.insert(key, value);
            }
            Ok(Value::Object(out))
        }
        other => Err(DecodeError::UnknownTag { tag: other, offset }),
    }
}

fn decode_string(c: &mut Cursor<'_>) -> Result<String, DecodeError> {
    let len = c.uvarint()? as usize;
    let pos = c.pos;
    let raw = c.take(len)?;
    let s = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8 { offset: pos })?;
    Ok(s.to_owned())
}

/// Compute the content-addressed identifier of canonical bytes.
///
/// `base32_lower(0x1e || 0x20 || blake3_256(bytes))` — the multihash prefix
/// names blake3-256 and the 32-byte digest length.
///
/// # Examples
///
/// ```
/// let bytes = odin_oml::encode(&serde_json::json!({"hello": "world"})).unwrap();
/// let cid = odin_oml::cid(&bytes);
/// assert_eq!(cid, odin_oml::cid(&bytes));
/// assert!(cid.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
/// ```
#[must_use]
pub fn cid(bytes: &[u8]) -> String {
    let digest = blake3::hash(bytes);
    let mut prefixed = Vec::with_capacity(2 + digest.as_bytes().len());
    prefixed.push(MULTIHASH_BLAKE3);
    prefixed.push(DIGEST_LEN);
    prefixed.extend_from_slice(digest.as_bytes());
    data_encoding::BASE32_NOPAD
        .encode(&prefixed)
        .to_ascii_lowercase()
}

/// Encode a value and return its CID in one step.
///
/// # Errors
///
/// Propagates [`EncodeError`] from [`encode`].
pub fn cid_of(value: &Value) -> Result<String, EncodeError> {
    Ok(cid(&encode(value)?))
}
