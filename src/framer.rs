//! One JSON value per line.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::ClientError;

/// Maximum bytes per inbound message (8 MiB). Larger lines are skipped.
pub const MAX_MESSAGE_BYTES: usize = 8 * 1024 * 1024;

/// Serialize a message to a single line, without the trailing newline.
///
/// serde_json escapes control characters inside strings, so the output never
/// contains a raw `\n`.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, ClientError> {
    Ok(serde_json::to_vec(message)?)
}

/// Parse one line into a JSON object.
///
/// Fails with [`ClientError::MalformedMessage`] when the line is too long,
/// not valid JSON, or a JSON value other than an object.
pub fn decode(line: &[u8]) -> Result<Map<String, Value>, ClientError> {
    if line.len() > MAX_MESSAGE_BYTES {
        return Err(ClientError::malformed(format!(
            "message too large: {} bytes (limit {MAX_MESSAGE_BYTES})",
            line.len()
        )));
    }

    match serde_json::from_slice::<Value>(line) {
        Ok(Value::Object(obj)) => Ok(obj),
        Ok(other) => Err(ClientError::malformed(format!(
            "expected a JSON object, got {}",
            kind_of(&other)
        ))),
        Err(e) => Err(ClientError::malformed(format!("invalid JSON: {e}"))),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
