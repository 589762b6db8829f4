//! # Codec Errors
//!
//! Error types for the wire codec.

use thiserror::Error;

/// Result type for codec operations
pub type DdpResult<T> = Result<T, DdpError>;

/// Codec errors
#[derive(Debug, Clone, Error)]
pub enum DdpError {
    /// Payload is not valid JSON, or not the expected message shape
    #[error("Invalid JSON: {0}")]
    Json(String),

    /// Payload is JSON but violates the extended JSON encoding
    #[error("Invalid extended JSON: {0}")]
    InvalidEJson(String),

    /// Transport frame could not be decoded
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
}

impl From<serde_json::Error> for DdpError {
    fn from(e: serde_json::Error) -> Self {
        DdpError::Json(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_serde_error() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let ddp: DdpError = err.into();
        assert!(matches!(ddp, DdpError::Json(_)));
        assert!(ddp.to_string().starts_with("Invalid JSON"));
    }
}
