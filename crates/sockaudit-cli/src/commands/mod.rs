//! CLI command definitions and dispatch.

pub mod check_config;
pub mod procs;
pub mod replay;

use clap::{Parser, Subcommand};

/// Host socket audit sensor.
#[derive(Parser, Debug)]
#[command(name = "sockaudit", version, about, long_about = None)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Emit diagnostics as JSON lines on stderr.
    #[arg(long, global = true, env = "SOCKAUDIT_JSON_LOGS")]
    pub json_logs: bool,
}

/// Available CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Feed a JSON-lines capture through the flow engine and print the
    /// emitted flow records.
    Replay(replay::ReplayArgs),
    /// Validate a sensor configuration file.
    CheckConfig(check_config::CheckConfigArgs),
    /// List the processes the sensor would bootstrap from procfs.
    Procs(procs::ProcsArgs),
}

/// Dispatches the parsed CLI command to its handler.
///
/// # Errors
///
/// Returns an error if the command execution fails.
pub fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Replay(args) => replay::execute(&args),
        Command::CheckConfig(args) => check_config::execute(&args),
        Command::Procs(args) => procs::execute(&args),
    }
}
