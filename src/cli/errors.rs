//! Errors surfaced by the `livesync` binary
//!
//! Every one is fatal: `main` prints it and exits non-zero.

use std::io;

use thiserror::Error;

/// Stable codes printed ahead of the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Unreadable, malformed or invalid configuration
    ConfigError,
    IoError,
    /// Runtime or logging setup failed
    BootFailed,
    /// Server stopped with an error
    ServeFailed,
}

impl CliErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigError => "LIVESYNC_CLI_CONFIG_ERROR",
            Self::IoError => "LIVESYNC_CLI_IO_ERROR",
            Self::BootFailed => "LIVESYNC_CLI_BOOT_FAILED",
            Self::ServeFailed => "LIVESYNC_CLI_SERVE_FAILED",
        }
    }
}

#[derive(Debug, Error)]
#[error("{}: {message}", .code.as_str())]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    fn with_code(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::with_code(CliErrorCode::ConfigError, msg)
    }

    pub fn boot_failed(msg: impl Into<String>) -> Self {
        Self::with_code(CliErrorCode::BootFailed, msg)
    }

    pub fn serve_failed(msg: impl Into<String>) -> Self {
        Self::with_code(CliErrorCode::ServeFailed, msg)
    }

    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::with_code(CliErrorCode::IoError, e.to_string())
    }
}

pub type CliResult<T> = Result<T, CliError>;
