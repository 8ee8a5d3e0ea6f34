//! Tether CLI.
//!
//! - `tether check` - Validate configuration
//! - `tether replay` - Deterministic scripted replay
//! - `tether serve` - Coordinator over stdin/stdout JSON lines

mod args;
pub mod commands;

pub use args::{CheckArgs, Cli, Commands, ReplayArgs, ServeArgs};
