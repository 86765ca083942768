use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Stable error codes carried across the kernel↔worker boundary.
pub mod codes {
    pub const VAT_ALREADY_EXISTS: &str = "VAT_ALREADY_EXISTS";
    pub const VAT_NOT_FOUND: &str = "VAT_NOT_FOUND";
    pub const VAT_DELETED: &str = "VAT_DELETED";
    pub const VAT_CONNECTION_EXISTS: &str = "VAT_CONNECTION_EXISTS";
    pub const VAT_CONNECTION_NOT_FOUND: &str = "VAT_CONNECTION_NOT_FOUND";
    pub const STREAM_READ_ERROR: &str = "STREAM_READ_ERROR";
    pub const UNMARSHAL_FAILED: &str = "UNMARSHAL_FAILED";
    pub const VAT_TERMINATED: &str = "VAT_TERMINATED";
}

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("unmarshal validation failed: {0}")]
    Invalid(String),
}

/// Wire form of an error crossing a process boundary.
///
/// `sentinel` distinguishes a marshaled error from ordinary payload data;
/// receivers reconstruct a typed error when `code` is recognized and a
/// generic one otherwise.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MarshaledError {
    pub sentinel: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<MarshaledError>>,
}

impl MarshaledError {
    pub fn new(message: impl Into<String>) -> Self {
        MarshaledError {
            sentinel: true,
            message: message.into(),
            code: None,
            data: None,
            stack: None,
            cause: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_cause(mut self, cause: MarshaledError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Decode a wire value into a marshaled error, validating the sentinel.
    pub fn from_value(value: &Value) -> Result<Self, MarshalError> {
        if value.get("sentinel").and_then(Value::as_bool) != Some(true) {
            return Err(MarshalError::Invalid(
                "missing error sentinel".to_string(),
            ));
        }
        serde_json::from_value(value.clone()).map_err(|err| MarshalError::Invalid(err.to_string()))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Null)
    }
}

/// True when a wire value carries the marshaled-error sentinel.
pub fn is_marshaled_error(value: &Value) -> bool {
    value.get("sentinel").and_then(Value::as_bool) == Some(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_wire_value() {
        let err = MarshaledError::new("vat v3 not found")
            .with_code(codes::VAT_NOT_FOUND)
            .with_data(serde_json::json!({ "vatId": "v3" }));
        let value = err.to_value();
        assert!(is_marshaled_error(&value));
        let back = MarshaledError::from_value(&value).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn rejects_value_without_sentinel() {
        let value = serde_json::json!({ "message": "nope" });
        assert!(MarshaledError::from_value(&value).is_err());
        assert!(!is_marshaled_error(&value));
    }

    #[test]
    fn carries_nested_cause() {
        let err = MarshaledError::new("read failed")
            .with_code(codes::STREAM_READ_ERROR)
            .with_cause(MarshaledError::new("connection reset"));
        let back = MarshaledError::from_value(&err.to_value()).unwrap();
        assert_eq!(back.cause.unwrap().message, "connection reset");
    }
}
