//! `sockaudit check-config`: Validate a sensor configuration file.

use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use clap::Args;
use sockaudit_common::config::SensorConfig;

/// Arguments for the `check-config` command.
#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Path to the JSON configuration file.
    pub file: PathBuf,

    /// Print the effective configuration, defaults included.
    #[arg(long)]
    pub print: bool,
}

/// Executes the `check-config` command.
///
/// # Errors
///
/// Returns an error if the file cannot be loaded or fails validation.
pub fn execute(args: &CheckConfigArgs) -> anyhow::Result<()> {
    let config = SensorConfig::load(&args.file)
        .with_context(|| format!("invalid configuration {}", args.file.display()))?;
    tracing::info!(
        path = %args.file.display(),
        max_flow_retention_ms = config.max_flow_retention().as_millis(),
        "configuration is valid"
    );

    if args.print {
        let mut out = std::io::stdout().lock();
        serde_json::to_writer_pretty(&mut out, &config)?;
        writeln!(out)?;
    }
    Ok(())
}
