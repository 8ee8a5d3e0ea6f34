//! CLI argument definitions using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Tether - session recovery core for real-time publish/subscribe channels.
#[derive(Parser)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Session recovery core and diagnostic tools")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a configuration file and print the effective settings
    Check(CheckArgs),

    /// Feed a scripted sequence of transport events through the coordinator
    Replay(ReplayArgs),

    /// Run the coordinator over JSON lines on stdin/stdout
    Serve(ServeArgs),
}

#[derive(Args)]
pub struct CheckArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tether.toml")]
    pub config: PathBuf,
}

#[derive(Args)]
pub struct ReplayArgs {
    /// Path to configuration file (defaults apply when omitted)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// JSON-lines script of transport events, clock advances and ticks
    #[arg(short, long)]
    pub script: PathBuf,

    /// Print session snapshots and counters after the last step
    #[arg(long)]
    pub summary: bool,
}

#[derive(Args)]
pub struct ServeArgs {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/tether.toml")]
    pub config: PathBuf,

    /// Outbound event buffer between the coordinator and stdout
    #[arg(long, default_value_t = 1024)]
    pub buffer: usize,
}
