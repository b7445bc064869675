//! Canonical JSON encoding for hash preimages and ledger lines.
//!
//! Every byte sequence the kernel hashes or signs goes through this
//! encoder, so two runs that agree on the value must agree on the bytes.
//! The profile is deliberately strict:
//!
//! - Object keys are sorted lexicographically (byte order).
//! - No insignificant whitespace.
//! - Numbers must be integers within signed 64-bit range; floats are
//!   rejected because their shortest-round-trip form is platform folklore.
//! - Strings are emitted in Unicode NFC form with minimal escaping (only
//!   `"` and `\` and the C0 control range).
//! - Nesting deeper than [`MAX_DEPTH`] is rejected.
//!
//! Strings are *normalized* to NFC rather than rejected: captured process
//! output is outside the kernel's control, and an audit record that refuses
//! to record is worse than one that normalizes. Normalization is idempotent,
//! so re-encoding a parsed ledger line reproduces the same bytes.

use std::fmt::Write as _;

use serde::Serialize;
use serde_json::{Map, Number, Value};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;
use unicode_normalization::is_nfc;

/// Maximum nesting depth accepted by the encoder.
pub const MAX_DEPTH: usize = 128;

/// Errors from canonical encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// A floating-point number was encountered.
    #[error("float not allowed: canonical values are integer-only")]
    FloatNotAllowed,

    /// A number is outside the signed 64-bit integer range.
    #[error("number out of range: {value} does not fit in i64")]
    NumberOutOfRange {
        /// Decimal rendering of the offending number.
        value: String,
    },

    /// The value nests deeper than [`MAX_DEPTH`].
    #[error("max depth exceeded: nested deeper than {MAX_DEPTH} levels")]
    MaxDepthExceeded,

    /// The value could not be converted to JSON at all.
    #[error("not representable as JSON: {message}")]
    NotJson {
        /// Description from the serializer.
        message: String,
    },
}

/// Encodes any serializable value into canonical JSON bytes.
///
/// # Errors
///
/// Returns [`CanonicalError`] if the value contains floats, out-of-range
/// numbers, or nests deeper than [`MAX_DEPTH`].
pub fn to_canonical_string<T: Serialize>(value: &T) -> Result<String, CanonicalError> {
    let value = serde_json::to_value(value).map_err(|e| CanonicalError::NotJson {
        message: e.to_string(),
    })?;
    canonicalize_value(&value)
}

/// Encodes an already-parsed JSON value into canonical form.
///
/// # Errors
///
/// Returns [`CanonicalError`] on floats, out-of-range numbers, or excessive
/// nesting.
pub fn canonicalize_value(value: &Value) -> Result<String, CanonicalError> {
    check_value(value, 0)?;
    let mut out = String::new();
    emit_value(value, &mut out);
    Ok(out)
}

/// Returns true if `input` parses to a value whose canonical encoding is
/// byte-identical to `input`.
#[must_use]
pub fn is_canonical(input: &str) -> bool {
    serde_json::from_str::<Value>(input)
        .ok()
        .and_then(|v| canonicalize_value(&v).ok())
        .is_some_and(|c| c == input)
}

fn check_value(value: &Value, depth: usize) -> Result<(), CanonicalError> {
    if depth > MAX_DEPTH {
        return Err(CanonicalError::MaxDepthExceeded);
    }
    match value {
        Value::Null | Value::Bool(_) | Value::String(_) => Ok(()),
        Value::Number(n) => check_number(n),
        Value::Array(items) => {
            for item in items {
                check_value(item, depth + 1)?;
            }
            Ok(())
        },
        Value::Object(map) => {
            for v in map.values() {
                check_value(v, depth + 1)?;
            }
            Ok(())
        },
    }
}

fn check_number(n: &Number) -> Result<(), CanonicalError> {
    if n.is_i64() {
        return Ok(());
    }
    if let Some(u) = n.as_u64() {
        if u > i64::MAX as u64 {
            return Err(CanonicalError::NumberOutOfRange {
                value: u.to_string(),
            });
        }
        return Ok(());
    }
    Err(CanonicalError::FloatNotAllowed)
}

fn emit_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => {
            // check_number already confirmed an integer representation.
            let _ = write!(out, "{n}");
        },
        Value::String(s) => emit_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_value(item, out);
            }
            out.push(']');
        },
        Value::Object(map) => emit_object(map, out),
    }
}

fn emit_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_string(key, out);
        out.push(':');
        emit_value(&map[*key], out);
    }
    out.push('}');
}

/// Emits a string NFC-normalized with minimal escaping: `"`, `\`, and the
/// C0 control range only. U+007F and C1 controls pass through raw.
fn emit_string(s: &str, out: &mut String) {
    out.push('"');
    if is_nfc(s) {
        emit_chars(s.chars(), out);
    } else {
        emit_chars(s.nfc(), out);
    }
    out.push('"');
}

fn emit_chars(chars: impl Iterator<Item = char>, out: &mut String) {
    for c in chars {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{0008}' => out.push_str("\\b"),
            '\u{000C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c <= '\u{001F}' => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            },
            c => out.push(c),
        }
    }
}
