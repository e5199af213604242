//! Error types for hearth-client

use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, HearthError>;

#[derive(Error, Debug)]
pub enum HearthError {
    /// The socket failed or closed before authentication completed and the
    /// retry budget ran out.
    #[error("Unable to connect to the hub: {0}")]
    CannotConnect(String),

    /// The hub rejected the credentials. Never retried.
    #[error("Invalid authentication: {0}")]
    InvalidAuth(String),

    /// The socket dropped while commands were in flight, or a send was
    /// attempted while disconnected.
    #[error("Connection lost")]
    ConnectionLost,

    /// Redirect-flow state mismatch, produced by exterior auth flows.
    #[error("Invalid auth callback state")]
    InvalidAuthCallback,

    /// The hub answered a command with `success: false`.
    #[error("Command failed ({code}): {message}")]
    Command { code: String, message: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// API misuse caught at runtime, such as suspending without a resume
    /// future or passing a non-object command payload.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl HearthError {
    /// Build a [`HearthError::Command`] from a `result` frame's error
    /// payload, tolerating both string and numeric codes.
    pub(crate) fn from_result_error(error: Option<serde_json::Value>) -> Self {
        let (code, message) = match error {
            Some(serde_json::Value::Object(map)) => {
                let code = match map.get("code") {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => "unknown".to_string(),
                };
                let message = match map.get("message") {
                    Some(serde_json::Value::String(s)) => s.clone(),
                    _ => "command failed".to_string(),
                };
                (code, message)
            }
            _ => ("unknown".to_string(), "command failed".to_string()),
        };
        HearthError::Command { code, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_result_error_with_string_code() {
        let err = HearthError::from_result_error(Some(json!({
            "code": "unknown_command",
            "message": "Unknown command.",
        })));
        match err {
            HearthError::Command { code, message } => {
                assert_eq!(code, "unknown_command");
                assert_eq!(message, "Unknown command.");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_result_error_with_numeric_code() {
        let err = HearthError::from_result_error(Some(json!({ "code": 3, "message": "nope" })));
        match err {
            HearthError::Command { code, .. } => assert_eq!(code, "3"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_result_error_missing_payload() {
        let err = HearthError::from_result_error(None);
        match err {
            HearthError::Command { code, message } => {
                assert_eq!(code, "unknown");
                assert_eq!(message, "command failed");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
