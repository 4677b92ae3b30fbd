//! Finalized flow records and the reporter seam.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sockaudit_common::types::{Counters, Direction, Family, SocketId, TerminationReason, Transport};
use tokio::sync::mpsc;

use crate::process::ProcessIdentity;

/// A flow that has completed its termination grace period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlowRecord {
    /// Kernel socket the flow belonged to.
    pub socket: SocketId,
    /// Transport protocol.
    pub transport: Transport,
    /// Address family.
    pub family: Family,
    /// Which side initiated the connection.
    pub direction: Direction,
    /// Local endpoint, if observed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local: Option<SocketAddr>,
    /// Remote endpoint.
    pub remote: SocketAddr,
    /// Local to remote totals.
    pub sent: Counters,
    /// Remote to local totals.
    pub received: Counters,
    /// First activity.
    pub start: DateTime<Utc>,
    /// Last activity.
    pub end: DateTime<Utc>,
    /// Owning process, as much as is known.
    pub process: ProcessIdentity,
    /// Host name the remote address was resolved from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_hostname: Option<String>,
    /// Why the flow ended.
    pub termination: TerminationReason,
}

/// Destination for finalized flows.
pub trait Reporter: Send {
    /// Delivers one record. Called from the dispatcher task.
    fn report(&mut self, record: FlowRecord);
}

impl Reporter for mpsc::UnboundedSender<FlowRecord> {
    fn report(&mut self, record: FlowRecord) {
        if self.send(record).is_err() {
            tracing::debug!("flow record receiver dropped");
        }
    }
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn report(&mut self, _record: FlowRecord) {}
}
