//! Assertion namespace exposed to bundles as `assert.*`.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct AssertionError {
    pub message: String,
}

impl AssertionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub fn fail(message: &str) -> Result<(), AssertionError> {
    Err(AssertionError::new(message))
}

pub fn is_true(value: &Value, message: Option<&str>) -> Result<(), AssertionError> {
    if is_truthy(value) {
        return Ok(());
    }
    Err(AssertionError::new(message.map(str::to_string).unwrap_or_else(
        || format!("Expected truthy value but received {value}"),
    )))
}

pub fn equal(expected: &Value, actual: &Value, message: Option<&str>) -> Result<(), AssertionError> {
    if expected == actual {
        return Ok(());
    }
    Err(AssertionError::new(message.map(str::to_string).unwrap_or_else(
        || format!("Expected {expected} but received {actual}"),
    )))
}

/// `false`, `null`, `0` and `""` are falsy; everything else is truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}
