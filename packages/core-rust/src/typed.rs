//! Typed-value codec for primitive wire fields.
//!
//! Some frame data fields carry a single primitive whose runtime type must
//! survive the text wire. The first character is a type prefix, the rest is
//! the payload: `T`/`F` booleans, `L` null, `U` undefined, `N` numbers,
//! `S` strings, `O` JSON-encoded objects and arrays.

use serde_json::Value;
use thiserror::Error;

/// Error returned when a typed field cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TypedError {
    /// The field was empty.
    #[error("empty typed value")]
    Empty,
    /// The type prefix is not part of the protocol.
    #[error("unknown typed prefix `{0}`")]
    UnknownPrefix(char),
    /// An `N` payload was not a number.
    #[error("invalid number payload `{0}`")]
    InvalidNumber(String),
    /// An `O` payload was not valid JSON.
    #[error("invalid object payload: {0}")]
    InvalidObject(String),
}

/// Encodes a JSON value into its typed wire form.
#[must_use]
pub fn encode_typed(value: &Value) -> String {
    match value {
        Value::Null => "L".to_owned(),
        Value::Bool(true) => "T".to_owned(),
        Value::Bool(false) => "F".to_owned(),
        Value::Number(n) => format!("N{n}"),
        Value::String(s) => format!("S{s}"),
        Value::Object(_) | Value::Array(_) => format!("O{value}"),
    }
}

/// Decodes a typed wire field back into a JSON value.
///
/// `U` (undefined) decodes to null; the distinction does not survive into
/// the document model.
///
/// # Errors
///
/// [`TypedError`] for an empty field, unknown prefix, or bad payload.
pub fn parse_typed(raw: &str) -> Result<Value, TypedError> {
    let mut chars = raw.chars();
    let prefix = chars.next().ok_or(TypedError::Empty)?;
    let payload = chars.as_str();
    match prefix {
        'T' => Ok(Value::Bool(true)),
        'F' => Ok(Value::Bool(false)),
        'L' | 'U' => Ok(Value::Null),
        'S' => Ok(Value::String(payload.to_owned())),
        'N' => serde_json::from_str::<serde_json::Number>(payload)
            .map(Value::Number)
            .map_err(|_| TypedError::InvalidNumber(payload.to_owned())),
        'O' => serde_json::from_str(payload)
            .map_err(|err| TypedError::InvalidObject(err.to_string())),
        other => Err(TypedError::UnknownPrefix(other)),
    }
}
