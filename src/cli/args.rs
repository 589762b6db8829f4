//! CLI argument definitions using clap
//!
//! Commands:
//! - livesync serve [--config <path>] [--bind <addr>]

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// livesync - real-time document synchronization server
#[derive(Parser, Debug)]
#[command(name = "livesync")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve DDP over WebSocket
    Serve {
        /// Path to configuration file; defaults apply when omitted
        #[arg(long)]
        config: Option<PathBuf>,

        /// Listen address, overriding the configuration file
        #[arg(long)]
        bind: Option<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}
