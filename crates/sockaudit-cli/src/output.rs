//! Formatted output helpers for CLI commands.
//!
//! Flow records go to stdout, one per line; diagnostics go through
//! `tracing` on stderr.

use std::io::{self, Write};

use clap::ValueEnum;
use sockaudit_common::types::Direction;
use sockaudit_ebpf::report::{FlowRecord, Reporter};

/// Rendering of emitted flow records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable summary line.
    Text,
}

/// Writes each record to stdout as soon as it is emitted.
#[derive(Debug, Clone, Copy)]
pub struct StdoutReporter {
    format: OutputFormat,
}

impl StdoutReporter {
    /// Creates a reporter printing in `format`.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }
}

impl Reporter for StdoutReporter {
    fn report(&mut self, record: FlowRecord) {
        let mut out = io::stdout().lock();
        let written = match self.format {
            OutputFormat::Json => serde_json::to_writer(&mut out, &record)
                .map_err(io::Error::from)
                .and_then(|()| writeln!(out)),
            OutputFormat::Text => writeln!(out, "{}", format_record(&record)),
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, socket = %record.socket, "failed to write flow record");
        }
    }
}

/// Renders a record as a single summary line.
#[must_use]
pub fn format_record(record: &FlowRecord) -> String {
    let local = record
        .local
        .map_or_else(|| "-".to_string(), |addr| addr.to_string());
    let remote = record.dns_hostname.as_ref().map_or_else(
        || record.remote.to_string(),
        |host| format!("{}({host})", record.remote),
    );
    let process = match (record.process.pid, record.process.name.as_deref()) {
        (Some(pid), Some(name)) => format!("{name}[{pid}]"),
        (Some(pid), None) => format!("[{pid}]"),
        _ => "-".to_string(),
    };
    format!(
        "{} {} {:<8} {local} -> {remote} sent={} recv={} {process} {}",
        record.end.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
        record.transport,
        direction_label(record.direction),
        format_bytes(record.sent.bytes),
        format_bytes(record.received.bytes),
        record.termination,
    )
}

const fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Unknown => "unknown",
        Direction::Inbound => "inbound",
        Direction::Outbound => "outbound",
    }
}

/// Formats a byte count into a human-readable string (e.g., "128 MiB").
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const KIB: u64 = 1024;
    const MIB: u64 = KIB * 1024;
    const GIB: u64 = MIB * 1024;

    if bytes >= GIB {
        format!("{:.1} GiB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB as f64)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes as f64 / KIB as f64)
    } else {
        format!("{bytes} B")
    }
}
