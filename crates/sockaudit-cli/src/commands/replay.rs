//! `sockaudit replay`: Run a recorded capture through the flow engine.
//!
//! The capture is JSON lines, one object per line:
//!
//! ```text
//! {"event": {"kind": "uname", "meta": {...}, "magic": ..., "wall_ns": ...}}
//! {"dns": {"query": "example.com", "answers": ["10.0.0.5"], "observed_at": "..."}}
//! {"lost": 12}
//! ```
//!
//! Expiry runs against event time, so a replay yields the same records
//! every time. Captures should start with a clock calibration `uname`
//! event; before one, timestamps are estimated against the system clock.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use chrono::TimeDelta;
use clap::Args;
use serde::Deserialize;
use sockaudit_common::config::SensorConfig;
use sockaudit_ebpf::dispatch::{Dispatcher, StatsSnapshot, SweepMode};
use sockaudit_ebpf::dns::DnsTransaction;
use sockaudit_ebpf::events::TraceEvent;
use sockaudit_ebpf::report::Reporter;
use sockaudit_ebpf::state::FlowState;

use crate::output::{OutputFormat, StdoutReporter};

/// Arguments for the `replay` command.
#[derive(Args, Debug)]
pub struct ReplayArgs {
    /// Capture file, or `-` for stdin.
    pub input: PathBuf,

    /// Sensor configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host identifier for process entity IDs.
    #[arg(long)]
    pub host_id: Option<String>,

    /// Output format for flow records.
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    pub format: OutputFormat,

    /// Keep flows still open at the end of the capture instead of
    /// expiring them.
    #[arg(long)]
    pub no_flush: bool,
}

/// One line of a capture file.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReplayLine {
    Event(TraceEvent),
    Dns(DnsTransaction),
    Lost(u64),
}

/// Totals of one replay.
#[derive(Debug, Clone, Copy)]
pub struct ReplaySummary {
    /// Capture lines applied.
    pub lines: u64,
    /// DNS transactions fed to the index.
    pub dns: u64,
    /// Dispatcher counters.
    pub stats: StatsSnapshot,
    /// Flow records emitted.
    pub emitted: u64,
    /// Flows left open (only with `--no-flush` or on interrupt).
    pub open: usize,
    /// Whether Ctrl+C stopped the replay early.
    pub interrupted: bool,
}

/// Executes the `replay` command.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the capture cannot
/// be read, or a line is malformed.
pub fn execute(args: &ReplayArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => SensorConfig::load(path)
            .with_context(|| format!("invalid configuration {}", path.display()))?,
        None => SensorConfig::default(),
    };
    if args.host_id.is_some() {
        config.host_id.clone_from(&args.host_id);
    }

    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow::anyhow!("failed to set Ctrl+C handler: {e}"))?;

    let input = open_input(&args.input)?;
    let summary = replay(
        input,
        &config,
        Box::new(StdoutReporter::new(args.format)),
        !args.no_flush,
        &interrupted,
    )?;

    tracing::info!(
        lines = summary.lines,
        events = summary.stats.events,
        update_errors = summary.stats.update_errors,
        dropped = summary.stats.dropped,
        dns = summary.dns,
        emitted = summary.emitted,
        open = summary.open,
        interrupted = summary.interrupted,
        "replay finished"
    );
    Ok(())
}

fn open_input(path: &Path) -> anyhow::Result<Box<dyn BufRead>> {
    if path == Path::new("-") {
        return Ok(Box::new(io::stdin().lock()));
    }
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

/// Feeds every line of `input` to a fresh engine reporting into
/// `reporter`. Blank lines and lines starting with `#` are skipped.
///
/// With `flush`, the engine is finally expired as of the last event time
/// plus the longest flow retention, so every flow is emitted.
///
/// # Errors
///
/// Returns an error naming the line number of the first unreadable or
/// malformed line.
pub fn replay(
    input: impl BufRead,
    config: &SensorConfig,
    reporter: Box<dyn Reporter>,
    flush: bool,
    interrupted: &AtomicBool,
) -> anyhow::Result<ReplaySummary> {
    let state = FlowState::new(config, reporter);
    let mut dispatcher = Dispatcher::new(state, SweepMode::EventTime(config.reap_interval));
    let mut lines = 0;
    let mut dns = 0;
    let mut stopped = false;

    for (index, line) in input.lines().enumerate() {
        if interrupted.load(Ordering::SeqCst) {
            tracing::warn!(line = index + 1, "replay interrupted");
            stopped = true;
            break;
        }
        let line = line.with_context(|| format!("failed to read line {}", index + 1))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let parsed: ReplayLine = serde_json::from_str(line)
            .with_context(|| format!("malformed capture line {}", index + 1))?;
        lines += 1;
        match parsed {
            ReplayLine::Event(event) => dispatcher.dispatch(&event),
            ReplayLine::Dns(tr) => {
                dns += 1;
                dispatcher.state().on_dns_transaction(&tr);
            }
            ReplayLine::Lost(count) => dispatcher.on_lost(count),
        }
    }

    if flush && !stopped {
        if let Some(last) = dispatcher.state().last_event_time() {
            let retention =
                TimeDelta::from_std(config.max_flow_retention()).unwrap_or(TimeDelta::MAX);
            let horizon = last.checked_add_signed(retention).unwrap_or(last);
            let _ = dispatcher.sweep(horizon);
        }
    }

    Ok(ReplaySummary {
        lines,
        dns,
        stats: dispatcher.stats().snapshot(),
        emitted: dispatcher.state().emitted(),
        open: dispatcher.state().flow_count(),
        interrupted: stopped,
    })
}
