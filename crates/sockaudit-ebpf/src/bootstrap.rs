//! Startup discovery: processes already running and the host identity.
//!
//! Processes that started before the kernel hooks were attached never produce an
//! exec event, so the table is seeded from `/proc`. Entries that vanish or
//! cannot be read mid-scan are skipped.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use sockaudit_common::constants::TASK_COMM_LEN;
use sockaudit_common::error::{Result, SockauditError};
use sockaudit_common::types::Credentials;

use crate::process::Process;

/// Scans a procfs mount for running processes.
///
/// # Errors
///
/// Returns an error if the directory itself cannot be listed.
pub fn scan_proc(root: &Path) -> Result<Vec<Process>> {
    scan_proc_with(root, clock_ticks())
}

/// Like [`scan_proc`] with an explicit `USER_HZ`.
///
/// # Errors
///
/// Returns an error if the directory itself cannot be listed.
pub fn scan_proc_with(root: &Path, ticks_per_sec: u64) -> Result<Vec<Process>> {
    let entries = fs::read_dir(root).map_err(|e| SockauditError::Io {
        path: root.to_path_buf(),
        source: e,
    })?;
    let boot = boot_time(root);
    if boot.is_none() {
        tracing::debug!(root = %root.display(), "no btime in stat, process start times unavailable");
    }

    let mut processes = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        match read_process(&entry.path(), pid, boot, ticks_per_sec) {
            Some(process) => processes.push(process),
            None => tracing::trace!(pid, "process vanished during scan"),
        }
    }
    tracing::info!(count = processes.len(), "bootstrapped processes from procfs");
    Ok(processes)
}

fn read_process(
    dir: &Path,
    pid: u32,
    boot: Option<DateTime<Utc>>,
    ticks_per_sec: u64,
) -> Option<Process> {
    let stat = fs::read_to_string(dir.join("stat")).ok()?;
    let (comm, start_ticks) = parse_stat(&stat)?;

    let args: Vec<String> = fs::read(dir.join("cmdline"))
        .unwrap_or_default()
        .split(|b| *b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();

    // comm is cut to TASK_COMM_LEN - 1 bytes; argv[0] has the full name.
    let name = match args.first() {
        Some(argv0) if comm.len() >= TASK_COMM_LEN - 1 => Path::new(argv0)
            .file_name()
            .map_or_else(|| comm.clone(), |n| n.to_string_lossy().into_owned()),
        _ => comm,
    };

    let mut process = Process::new(pid).with_name(name).with_args(args);
    if let Ok(exe) = fs::read_link(dir.join("exe")) {
        process = process.with_exe(exe);
    }
    if let Some(start) = boot.and_then(|b| start_time(b, start_ticks, ticks_per_sec)) {
        process = process.with_start_time(start);
    }
    if let Some(creds) = fs::read_to_string(dir.join("status"))
        .ok()
        .and_then(|s| parse_credentials(&s))
    {
        process = process.with_credentials(creds);
    }
    Some(process)
}

/// Extracts `comm` and `starttime` (in clock ticks since boot) from a
/// `/proc/<pid>/stat` line.
fn parse_stat(stat: &str) -> Option<(String, u64)> {
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let comm = stat.get(open + 1..close)?.to_string();
    // starttime is field 22; after "pid (comm)" that is index 19
    let start = stat
        .get(close + 1..)?
        .split_whitespace()
        .nth(19)?
        .parse()
        .ok()?;
    Some((comm, start))
}

fn parse_credentials(status: &str) -> Option<Credentials> {
    let ids = |key: &str| -> Option<(u32, u32)> {
        let line = status.lines().find(|l| l.starts_with(key))?;
        let mut fields = line.get(key.len()..)?.split_whitespace();
        let real = fields.next()?.parse().ok()?;
        let effective = fields.next()?.parse().ok()?;
        Some((real, effective))
    };
    let (uid, euid) = ids("Uid:")?;
    let (gid, egid) = ids("Gid:")?;
    Some(Credentials {
        uid,
        euid,
        gid,
        egid,
    })
}

fn boot_time(root: &Path) -> Option<DateTime<Utc>> {
    let stat = fs::read_to_string(root.join("stat")).ok()?;
    let secs = stat
        .lines()
        .find_map(|l| l.strip_prefix("btime "))?
        .trim()
        .parse()
        .ok()?;
    DateTime::from_timestamp(secs, 0)
}

fn start_time(boot: DateTime<Utc>, ticks: u64, ticks_per_sec: u64) -> Option<DateTime<Utc>> {
    if ticks_per_sec == 0 {
        return None;
    }
    let nanos = u128::from(ticks) * 1_000_000_000 / u128::from(ticks_per_sec);
    boot.checked_add_signed(TimeDelta::nanoseconds(i64::try_from(nanos).ok()?))
}

#[allow(unsafe_code)]
fn clock_ticks() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    u64::try_from(ticks).ok().filter(|t| *t > 0).unwrap_or(100)
}

/// Resolves the host identifier: the machine ID if readable, otherwise the
/// host name.
#[must_use]
pub fn resolve_host_id(machine_id: &Path) -> Option<String> {
    if let Some(id) = fs::read_to_string(machine_id)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
    {
        return Some(id);
    }
    tracing::debug!(path = %machine_id.display(), "machine id unavailable, using host name");
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
}

/// Default procfs mount point.
#[must_use]
pub fn default_proc_root() -> PathBuf {
    PathBuf::from("/proc")
}
