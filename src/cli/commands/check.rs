//! Check command - load and validate a configuration file.

use crate::cli::args::CheckArgs;
use crate::config::Config;
use anyhow::{Context, Result};

pub fn run_check(args: CheckArgs) -> Result<()> {
    let config = Config::load(&args.config)?;
    config
        .validate()
        .with_context(|| format!("invalid config {}", args.config.display()))?;
    let rendered = toml::to_string_pretty(&config).context("render effective config")?;
    println!("# {} is valid", args.config.display());
    print!("{rendered}");
    Ok(())
}
