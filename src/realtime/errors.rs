//! # Real-Time Errors
//!
//! Error types for the real-time module.

use thiserror::Error;

use crate::ddp::{DdpError, ErrorCode, ErrorPayload};
use crate::engine::EngineError;

/// Result type for real-time operations
pub type RealtimeResult<T> = Result<T, RealtimeError>;

/// Result type for method and publication handlers
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Real-time errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RealtimeError {
    // ==================
    // Connection Errors
    // ==================
    /// Invalid message format
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    /// Session-level message before the handshake
    #[error("Must connect first")]
    NotConnected,

    // ==================
    // Reconciliation Errors
    // ==================
    /// `added` for a (subscription, document) pair that is already presented
    #[error("Subscription {sub_id} already added {collection}/{id}")]
    DuplicateAdded {
        collection: String,
        id: String,
        sub_id: String,
    },

    /// `changed`/`removed` for a document nobody presented
    #[error("Unknown document {collection}/{id}")]
    UnknownDocument { collection: String, id: String },

    /// `changed`/`removed` from a subscription that never added the document
    #[error("Subscription {sub_id} does not present {collection}/{id}")]
    NotPresented {
        collection: String,
        id: String,
        sub_id: String,
    },

    // ==================
    // Internal Errors
    // ==================
    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connection error
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl From<DdpError> for RealtimeError {
    fn from(e: DdpError) -> Self {
        RealtimeError::InvalidMessage(e.to_string())
    }
}

/// Failure reported by a method or publication handler
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HandlerError {
    /// Error meant for the client, sent with its code and reason
    #[error("{reason} [{error}]")]
    ClientSafe {
        error: ErrorCode,
        reason: String,
        details: Option<String>,
    },

    /// Anything else
    #[error("{0}")]
    Internal(String),
}

impl HandlerError {
    pub fn client_safe(error: impl Into<ErrorCode>, reason: impl Into<String>) -> Self {
        HandlerError::ClientSafe {
            error: error.into(),
            reason: reason.into(),
            details: None,
        }
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::client_safe(404, reason)
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::client_safe(400, reason)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError::Internal(message.into())
    }

    /// Payload for a method `result`. Internal errors carry only a code and
    /// a message.
    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            HandlerError::ClientSafe { error, reason, details } => {
                ErrorPayload::client_safe(error.clone(), reason.clone(), details.clone())
            }
            HandlerError::Internal(message) => ErrorPayload::opaque(message.as_str(), message.clone()),
        }
    }

    /// Payload for a subscription `nosub`
    pub fn to_nosub_payload(&self) -> ErrorPayload {
        match self {
            HandlerError::ClientSafe { .. } => self.to_payload(),
            HandlerError::Internal(message) => {
                ErrorPayload::client_safe("server-error", message.clone(), None)
            }
        }
    }
}

impl From<EngineError> for HandlerError {
    fn from(e: EngineError) -> Self {
        match &e {
            EngineError::NotFound(_) | EngineError::NoSuchApi(_) => {
                HandlerError::client_safe(404, e.to_string())
            }
            EngineError::AlreadyExists(_)
            | EngineError::Conflict(_)
            | EngineError::RetriesExhausted(_) => HandlerError::client_safe(409, e.to_string()),
            _ => HandlerError::Internal(e.to_string()),
        }
    }
}

impl From<DdpError> for HandlerError {
    fn from(e: DdpError) -> Self {
        HandlerError::bad_request(e.to_string())
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        HandlerError::bad_request(e.to_string())
    }
}

impl From<RealtimeError> for HandlerError {
    fn from(e: RealtimeError) -> Self {
        HandlerError::Internal(e.to_string())
    }
}
