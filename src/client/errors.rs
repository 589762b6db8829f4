//! # Client Errors

use thiserror::Error;

use crate::ddp::DdpError;

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Client errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClientError {
    // ==================
    // Connection Errors
    // ==================
    /// The inbound loop ended before a reply arrived
    #[error("Connection closed")]
    ConnectionClosed,

    /// Socket-level failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server did not complete the handshake
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Server closed the connection with a close frame
    #[error("DDP connection closed by server: {reason} [{code}]")]
    ClosedByServer { code: u16, reason: String },

    // ==================
    // Protocol Errors
    // ==================
    /// Unexpected or malformed server traffic
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server sent an `error` frame
    #[error("DDP error: {0}")]
    Server(String),

    // ==================
    // Call Errors
    // ==================
    /// Method returned an error result
    #[error("{0}")]
    Method(String),

    /// Subscription was refused or stopped with an error
    #[error("{0}")]
    Subscription(String),

    // ==================
    // Query Errors
    // ==================
    /// Selector or projection shape the local cache cannot evaluate
    #[error("Unsupported selector: {0}")]
    UnsupportedSelector(String),
}

impl From<DdpError> for ClientError {
    fn from(err: DdpError) -> Self {
        ClientError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_error_displays_server_message() {
        let err = ClientError::Method("Not allowed [403]".to_string());
        assert_eq!(err.to_string(), "Not allowed [403]");
    }

    #[test]
    fn test_close_frame_display() {
        let err = ClientError::ClosedByServer {
            code: 3000,
            reason: "Go away!".to_string(),
        };
        assert_eq!(err.to_string(), "DDP connection closed by server: Go away! [3000]");
    }
}
