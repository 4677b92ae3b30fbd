//! Per-tuple flow aggregation.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sockaudit_common::types::{Counters, Direction, FlowPhase, SocketId, TerminationReason, Transport};

use crate::process::Process;

/// Arena key of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(u64);

impl FlowId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "flow-{}", self.0)
    }
}

/// Identity of a flow within its socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Transport protocol.
    pub transport: Transport,
    /// Remote endpoint.
    pub remote: SocketAddr,
}

/// Traffic direction of a single data event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Traffic {
    /// Local to remote.
    Sent,
    /// Remote to local.
    Received,
}

/// Payload observed by a send or receive hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    /// Direction of the payload.
    pub traffic: Traffic,
    /// Transport, when the hook read it.
    pub transport: Option<Transport>,
    /// Local endpoint, when the hook read it.
    pub local: Option<SocketAddr>,
    /// Peer endpoint; connected sockets may omit it.
    pub remote: Option<SocketAddr>,
    /// Payload length.
    pub bytes: u64,
    /// Packets or datagrams.
    pub packets: u64,
}

/// Activity aggregated for one (transport, remote) tuple of one socket.
///
/// Timestamps are kept on the kernel clock and translated when the flow is
/// evaluated or emitted, so later calibrations still apply.
#[derive(Debug, Clone)]
pub struct Flow {
    pub(crate) id: FlowId,
    pub(crate) sock: SocketId,
    pub(crate) key: FlowKey,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) direction: Direction,
    pub(crate) sent: Counters,
    pub(crate) received: Counters,
    pub(crate) first_ns: u64,
    pub(crate) last_ns: u64,
    pub(crate) phase: FlowPhase,
    pub(crate) termination: Option<TerminationReason>,
    pub(crate) pending_since: Option<DateTime<Utc>>,
    pub(crate) process: Option<Arc<Process>>,
}

impl Flow {
    pub(crate) const fn new(id: FlowId, sock: SocketId, key: FlowKey, timestamp: u64) -> Self {
        Self {
            id,
            sock,
            key,
            local: None,
            direction: Direction::Unknown,
            sent: Counters {
                bytes: 0,
                packets: 0,
            },
            received: Counters {
                bytes: 0,
                packets: 0,
            },
            first_ns: timestamp,
            last_ns: timestamp,
            phase: FlowPhase::Open,
            termination: None,
            pending_since: None,
            process: None,
        }
    }

    /// Arena key.
    #[must_use]
    pub const fn id(&self) -> FlowId {
        self.id
    }

    /// Owning socket.
    #[must_use]
    pub const fn socket(&self) -> SocketId {
        self.sock
    }

    /// Transport and remote endpoint.
    #[must_use]
    pub const fn key(&self) -> FlowKey {
        self.key
    }

    /// Emission state.
    #[must_use]
    pub const fn phase(&self) -> FlowPhase {
        self.phase
    }

    /// Why the flow ended, once it has.
    #[must_use]
    pub const fn termination(&self) -> Option<TerminationReason> {
        self.termination
    }

    /// Bytes and packets sent so far.
    #[must_use]
    pub const fn sent(&self) -> Counters {
        self.sent
    }

    /// Bytes and packets received so far.
    #[must_use]
    pub const fn received(&self) -> Counters {
        self.received
    }

    /// Records a data event. Applies to open and pending flows alike; the
    /// phase is never touched.
    pub(crate) const fn record(&mut self, traffic: Traffic, bytes: u64, packets: u64, timestamp: u64) {
        match traffic {
            Traffic::Sent => self.sent.add(bytes, packets),
            Traffic::Received => self.received.add(bytes, packets),
        }
        self.touch(timestamp);
    }

    pub(crate) const fn touch(&mut self, timestamp: u64) {
        if timestamp > self.last_ns {
            self.last_ns = timestamp;
        }
        if timestamp < self.first_ns {
            self.first_ns = timestamp;
        }
    }

    /// Moves an open flow to pending termination. Returns `false` if it was
    /// already past the open phase.
    pub(crate) fn terminate(&mut self, reason: TerminationReason, since: DateTime<Utc>) -> bool {
        if self.phase != FlowPhase::Open {
            return false;
        }
        self.phase = FlowPhase::PendingTermination;
        self.termination = Some(reason);
        self.pending_since = Some(since);
        true
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn flow() -> Flow {
        let key = FlowKey {
            transport: Transport::Tcp,
            remote: "10.0.0.5:443".parse().unwrap(),
        };
        Flow::new(FlowId::new(1), SocketId::new(0xabc), key, 1_000)
    }

    #[test]
    fn terminate_is_one_way() {
        let mut f = flow();
        let t0 = DateTime::from_timestamp(10, 0).unwrap();
        assert!(f.terminate(TerminationReason::Closed, t0));
        assert!(!f.terminate(TerminationReason::TimedOut, t0));
        assert_eq!(f.termination(), Some(TerminationReason::Closed));
        assert_eq!(f.phase(), FlowPhase::PendingTermination);
    }

    #[test]
    fn late_traffic_counts_without_reopening() {
        let mut f = flow();
        let _ = f.terminate(TerminationReason::Closed, DateTime::UNIX_EPOCH);
        f.record(Traffic::Received, 100, 1, 2_000);
        assert_eq!(f.received().bytes, 100);
        assert_eq!(f.last_ns, 2_000);
        assert_eq!(f.phase(), FlowPhase::PendingTermination);
    }

    #[test]
    fn out_of_order_timestamps_widen_the_window() {
        let mut f = flow();
        f.record(Traffic::Sent, 1, 1, 500);
        assert_eq!((f.first_ns, f.last_ns), (500, 1_000));
    }
}
