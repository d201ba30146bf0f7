//! Canonical serialization of entry content.
//!
//! The canonical form is compact JSON with object keys sorted by byte order
//! at every nesting level. Keys are sorted by the writer itself, so the
//! output does not depend on which map type serde_json was built with.

use serde_json::Value;

use crate::audit::entry::EntryContent;
use crate::error::AuditError;

/// Deepest nesting accepted inside a snapshot or metadata value.
pub const MAX_DEPTH: usize = 64;

/// Canonical bytes of an entry's content fields.
pub fn canonicalize(content: &EntryContent) -> Result<Vec<u8>, AuditError> {
    let value = serde_json::to_value(content)
        .map_err(|e| AuditError::serialization(format!("entry content: {}", e)))?;
    canonicalize_value(&value)
}

/// Canonical bytes of an arbitrary JSON value.
pub fn canonicalize_value(value: &Value) -> Result<Vec<u8>, AuditError> {
    let mut out = Vec::with_capacity(256);
    write_value(value, 0, &mut out)?;
    Ok(out)
}

fn write_value(value: &Value, depth: usize, out: &mut Vec<u8>) -> Result<(), AuditError> {
    if depth > MAX_DEPTH {
        return Err(AuditError::serialization(format!(
            "value nested deeper than {} levels",
            MAX_DEPTH
        )));
    }

    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => out.extend_from_slice(n.to_string().as_bytes()),
        Value::String(s) => write_string(s, out)?,
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, depth + 1, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

            out.push(b'{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_string(key, out)?;
                out.push(b':');
                write_value(item, depth + 1, out)?;
            }
            out.push(b'}');
        }
    }

    Ok(())
}

fn write_string(s: &str, out: &mut Vec<u8>) -> Result<(), AuditError> {
    serde_json::to_writer(&mut *out, s)
        .map_err(|e| AuditError::serialization(format!("string encoding: {}", e)))
}
