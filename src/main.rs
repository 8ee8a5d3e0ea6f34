//! Tether - unified CLI entrypoint.
//!
//! Usage:
//!   tether check --config config/tether.toml
//!   tether replay --script session.jsonl --summary
//!   tether serve --config config/tether.toml

use anyhow::Result;
use clap::Parser;
use tether::cli::commands::{run_check, run_replay, run_serve};
use tether::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check(args) => run_check(args),
        Commands::Replay(args) => run_replay(args).await,
        Commands::Serve(args) => run_serve(args).await,
    }
}
