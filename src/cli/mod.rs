//! CLI module for livesync
//!
//! Provides command-line interface for:
//! - serve: load configuration, install logging and serve DDP over WebSocket

mod args;
mod commands;
mod errors;

pub use args::{Cli, Command};
pub use commands::{register_builtin_methods, run, run_command, serve, Config, SERVER_TIME_METHOD};
pub use errors::{CliError, CliErrorCode, CliResult};
