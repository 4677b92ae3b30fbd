//! `sockaudit procs`: List processes discovered from procfs.

use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Args;
use sockaudit_common::constants::MACHINE_ID_PATH;
use sockaudit_ebpf::bootstrap::{default_proc_root, resolve_host_id, scan_proc};

/// Arguments for the `procs` command.
#[derive(Args, Debug)]
pub struct ProcsArgs {
    /// procfs mount point.
    #[arg(long, default_value_os_t = default_proc_root())]
    pub root: PathBuf,

    /// Host identifier for entity IDs; defaults to the machine ID.
    #[arg(long)]
    pub host_id: Option<String>,
}

/// Executes the `procs` command.
///
/// # Errors
///
/// Returns an error if the procfs root cannot be listed.
pub fn execute(args: &ProcsArgs) -> anyhow::Result<()> {
    let host_id = args
        .host_id
        .clone()
        .or_else(|| resolve_host_id(Path::new(MACHINE_ID_PATH)));
    let mut processes = scan_proc(&args.root)?;
    processes.sort_by_key(|p| p.pid);

    let mut out = std::io::stdout().lock();
    writeln!(out, "{:<8} {:<16} {:<6} {:<24} COMMAND", "PID", "NAME", "UID", "ENTITY ID")?;
    for p in &processes {
        writeln!(
            out,
            "{:<8} {:<16} {:<6} {:<24} {}",
            p.pid,
            p.name.as_deref().unwrap_or("-"),
            p.credentials().map_or_else(|| "-".to_string(), |c| c.uid.to_string()),
            p.entity_id(host_id.as_deref()).unwrap_or("-"),
            p.args.join(" "),
        )?;
    }
    Ok(())
}
