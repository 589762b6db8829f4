//! CLI command implementations

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::ddp::EJson;
use crate::realtime::{method_fn, DdpInterface, RealtimeResult, WebSocketConfig, WebSocketServer};

use super::args::Command;
use super::errors::{CliError, CliResult};

/// Method returning the server clock as epoch milliseconds
pub const SERVER_TIME_METHOD: &str = "server-time";

/// Configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket listen address (default 0.0.0.0:3000)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Server `ping` interval, 0 disables (default 30)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// tracing filter directive, used when RUST_LOG is unset (default "info")
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}
fn default_heartbeat_interval() -> u64 {
    30
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load(path: &Path) -> CliResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| CliError::config_error(format!("Failed to read config: {}", e)))?;

        let config: Config = serde_json::from_str(&content)
            .map_err(|e| CliError::config_error(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Load from `path`, or start from defaults when no path is given
    pub fn load_or_default(path: Option<&Path>) -> CliResult<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> CliResult<()> {
        self.bind_addr.parse::<SocketAddr>().map_err(|e| {
            CliError::config_error(format!("Invalid bind_addr '{}': {}", self.bind_addr, e))
        })?;

        EnvFilter::try_new(&self.log_filter).map_err(|e| {
            CliError::config_error(format!("Invalid log_filter '{}': {}", self.log_filter, e))
        })?;

        Ok(())
    }

    /// WebSocket settings derived from this configuration
    pub fn websocket_config(&self) -> WebSocketConfig {
        WebSocketConfig {
            bind_addr: self.bind_addr.clone(),
            heartbeat_interval_secs: self.heartbeat_interval_secs,
        }
    }
}

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Serve { config, bind } => serve(config.as_deref(), bind),
    }
}

/// Register the methods every server exposes
pub fn register_builtin_methods(interface: &DdpInterface) -> RealtimeResult<()> {
    interface.add_method(
        SERVER_TIME_METHOD,
        method_fn(|_ctx, _params| async move { Ok(EJson::from(Utc::now().timestamp_millis())) }),
    )
}

fn init_logging(config: &Config) -> CliResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .map_err(|e| CliError::boot_failed(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| CliError::boot_failed(format!("Failed to install logger: {}", e)))
}

/// Serve DDP over WebSocket until interrupted
///
/// 1. Load and validate configuration
/// 2. Install logging
/// 3. Register built-in methods
/// 4. Run the WebSocket server until Ctrl-C
pub fn serve(config_path: Option<&Path>, bind: Option<String>) -> CliResult<()> {
    let mut config = Config::load_or_default(config_path)?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
        config.validate()?;
    }

    init_logging(&config)?;

    let interface = Arc::new(DdpInterface::new());
    register_builtin_methods(&interface)
        .map_err(|e| CliError::boot_failed(format!("Failed to register methods: {}", e)))?;

    let server = WebSocketServer::new(config.websocket_config(), interface);

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| CliError::boot_failed(format!("Failed to create tokio runtime: {}", e)))?;

    rt.block_on(async {
        tokio::select! {
            result = server.run() => {
                result.map_err(|e| CliError::serve_failed(format!("WebSocket server failed: {}", e)))
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                server.shutdown();
                Ok(())
            }
        }
    })
}
