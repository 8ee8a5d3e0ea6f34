//! CLI command implementations.

mod check;
mod replay;
mod serve;

pub use check::run_check;
pub use replay::{run_replay, ScriptStep};
pub use serve::run_serve;
