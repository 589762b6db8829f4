//! # Entity Engine Errors

use thiserror::Error;

/// Result type for entity operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Entity engine and storage errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    // ==================
    // Routing Errors
    // ==================
    /// No storage registered for the API group
    #[error("No API registered for group {0}")]
    NoSuchApi(String),

    /// API group registered twice
    #[error("API {0} already exists")]
    ApiAlreadyExists(String),

    // ==================
    // Entity Errors
    // ==================
    #[error("Entity doesn't exist: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    /// Conditional update lost against a concurrent writer
    #[error("Generation conflict on {0}")]
    Conflict(String),

    #[error("Ran out of retries for mutation on {0}")]
    RetriesExhausted(String),

    // ==================
    // Backend Errors
    // ==================
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::NoSuchApi(_) => "no-such-api",
            EngineError::ApiAlreadyExists(_) => "api-exists",
            EngineError::NotFound(_) => "not-found",
            EngineError::AlreadyExists(_) => "already-exists",
            EngineError::Conflict(_) => "no-update",
            EngineError::RetriesExhausted(_) => "no-mutate",
            EngineError::Storage(_) => "storage",
            EngineError::Internal(_) => "internal",
        }
    }
}
