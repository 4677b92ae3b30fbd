//! Flow, socket, and process state engine.
//!
//! [`FlowState`] owns every live entity. It is mutated only from the
//! dispatcher task: kernel events arrive through [`Event::update`],
//! expiry runs through [`FlowState::expire`]. The DNS index is the sole
//! structure shared with other tasks.
//!
//! [`Event::update`]: crate::events::Event::update

pub mod flow;
pub mod socket;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use sockaudit_common::config::SensorConfig;
use sockaudit_common::constants::DETAIL_TARGET;
use sockaudit_common::types::{
    Credentials, Direction, Family, FlowPhase, SocketId, SocketState, TerminationReason, Transport,
};

use self::flow::{Flow, FlowId, FlowKey, Traffic, Transfer};
use self::socket::Socket;
use crate::clock::KernelClock;
use crate::dns::{DnsCorrelator, DnsTransaction};
use crate::error::FlowError;
use crate::events::{EventMeta, ProcessExec};
use crate::process::{Process, ProcessIdentity, ProcessTable};
use crate::report::{FlowRecord, Reporter};

#[derive(Debug, Clone, Copy)]
struct Timeouts {
    flow_inactive: TimeDelta,
    socket_inactive: TimeDelta,
    termination: TimeDelta,
}

impl Timeouts {
    fn from_config(config: &SensorConfig) -> Self {
        let delta = |d| TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX);
        Self {
            flow_inactive: delta(config.flow_inactive_timeout),
            socket_inactive: delta(config.socket_inactive_timeout),
            termination: delta(config.flow_termination_timeout),
        }
    }
}

/// All live processes, sockets and flows.
pub struct FlowState {
    timeouts: Timeouts,
    clock: KernelClock,
    processes: ProcessTable,
    sockets: HashMap<SocketId, Socket>,
    flows: HashMap<FlowId, Flow>,
    next_flow: u64,
    dns: DnsCorrelator,
    host_id: Option<String>,
    reporter: Box<dyn Reporter>,
    emitted: u64,
    last_wall: Option<DateTime<Utc>>,
}

impl FlowState {
    /// Creates an empty state with its own DNS index.
    #[must_use]
    pub fn new(config: &SensorConfig, reporter: Box<dyn Reporter>) -> Self {
        let dns = DnsCorrelator::new(config.max_flow_retention());
        Self::with_dns(config, reporter, dns)
    }

    /// Creates an empty state that enriches flows from `dns`.
    #[must_use]
    pub fn with_dns(config: &SensorConfig, reporter: Box<dyn Reporter>, dns: DnsCorrelator) -> Self {
        Self {
            timeouts: Timeouts::from_config(config),
            clock: KernelClock::new(config.clock_max_drift),
            processes: ProcessTable::new(config.max_processes),
            sockets: HashMap::new(),
            flows: HashMap::new(),
            next_flow: 0,
            dns,
            host_id: config.host_id.clone(),
            reporter,
            emitted: 0,
            last_wall: None,
        }
    }

    /// Handle to the DNS index used for enrichment.
    #[must_use]
    pub fn dns_correlator(&self) -> DnsCorrelator {
        self.dns.clone()
    }

    /// Sets the host identifier used for entity IDs.
    pub fn set_host_id(&mut self, host_id: impl Into<String>) {
        self.host_id = Some(host_id.into());
    }

    /// Inserts or replaces a process by pid. Sockets already attached to an
    /// older process with the same pid keep their snapshot.
    pub fn create_process(&mut self, process: Process) -> Arc<Process> {
        self.processes.insert(process)
    }

    /// Feeds a DNS transaction to the index. Malformed transactions are
    /// logged and dropped.
    pub fn on_dns_transaction(&self, tr: &DnsTransaction) {
        if let Err(e) = self.dns.on_transaction(tr) {
            tracing::debug!(target: DETAIL_TARGET, error = %e, "discarding DNS transaction");
        }
    }

    /// Clock translation state.
    #[must_use]
    pub const fn clock(&self) -> &KernelClock {
        &self.clock
    }

    /// Latest wall-clock time reached by any event.
    #[must_use]
    pub const fn last_event_time(&self) -> Option<DateTime<Utc>> {
        self.last_wall
    }

    /// Looks up a tracked socket.
    #[must_use]
    pub fn socket(&self, id: SocketId) -> Option<&Socket> {
        self.sockets.get(&id)
    }

    /// Looks up the unemitted flow for a tuple of a socket.
    #[must_use]
    pub fn flow(&self, sock: SocketId, transport: Transport, remote: SocketAddr) -> Option<&Flow> {
        let id = self.sockets.get(&sock)?.flows.get(&FlowKey { transport, remote })?;
        self.flows.get(id)
    }

    /// Every flow not yet emitted, including those orphaned by socket reuse.
    pub fn flows(&self) -> impl Iterator<Item = &Flow> {
        self.flows.values()
    }

    /// Number of tracked processes.
    #[must_use]
    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    /// Number of tracked sockets.
    #[must_use]
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Number of flows not yet emitted.
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Total flows handed to the reporter.
    #[must_use]
    pub const fn emitted(&self) -> u64 {
        self.emitted
    }

    fn wall(&mut self, timestamp: u64) -> Result<DateTime<Utc>, FlowError> {
        if self.clock.current().is_none() {
            self.clock.estimate(timestamp, Utc::now());
        }
        let wall = self
            .clock
            .to_wall(timestamp)
            .ok_or(FlowError::Untranslatable { timestamp })?;
        self.advance(wall);
        Ok(wall)
    }

    fn advance(&mut self, wall: DateTime<Utc>) {
        if self.last_wall.is_none_or(|w| wall > w) {
            self.last_wall = Some(wall);
        }
    }

    fn socket_entry(
        sockets: &mut HashMap<SocketId, Socket>,
        sock: SocketId,
        timestamp: u64,
    ) -> &mut Socket {
        sockets.entry(sock).or_insert_with(|| {
            tracing::trace!(target: DETAIL_TARGET, %sock, "traffic on unknown socket, tracking stand-in");
            Socket::stand_in(sock, timestamp)
        })
    }

    /// Attaches the process `pid` to `sock` unless it already has an owner.
    /// Flows of the socket without a process inherit it.
    fn attach(&mut self, sock: SocketId, pid: u32) {
        if pid == 0 || self.sockets.get(&sock).is_none_or(|s| s.process.is_some()) {
            return;
        }
        let process = self.processes.get_or_create(pid);
        let Some(socket) = self.sockets.get_mut(&sock) else {
            return;
        };
        if let Some(owner) = socket.attach(process) {
            for id in socket.flows.values() {
                if let Some(flow) = self.flows.get_mut(id) {
                    let _ = flow.process.get_or_insert_with(|| Arc::clone(&owner));
                }
            }
        }
    }

    /// Returns the live flow for `key`, creating it unless the socket is
    /// closing.
    fn flow_id(&mut self, sock: SocketId, key: FlowKey, timestamp: u64) -> Result<FlowId, FlowError> {
        let socket = self
            .sockets
            .entry(sock)
            .or_insert_with(|| Socket::stand_in(sock, timestamp));
        if let Some(id) = socket.flows.get(&key) {
            return Ok(*id);
        }
        if socket.state == SocketState::Closing {
            return Err(FlowError::SocketClosing { sock });
        }

        let id = FlowId::new(self.next_flow);
        self.next_flow += 1;
        let mut flow = Flow::new(id, sock, key, timestamp);
        flow.local = socket.local;
        flow.direction = socket.direction;
        flow.process.clone_from(&socket.process);
        let _ = socket.flows.insert(key, id);
        let _ = self.flows.insert(id, flow);
        tracing::trace!(target: DETAIL_TARGET, %sock, %id, remote = %key.remote, "flow opened");
        Ok(id)
    }

    /// Handles socket allocation. A known id means the kernel reused the
    /// address: the previous socket is retired first.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Untranslatable`] if the timestamp overflows.
    pub fn on_socket_created(
        &mut self,
        meta: &EventMeta,
        sock: SocketId,
        family: Family,
        transport: Transport,
    ) -> Result<(), FlowError> {
        let wall = self.wall(meta.timestamp)?;
        if let Some(old) = self.sockets.remove(&sock) {
            self.retire(old, wall);
        }
        let _ = self
            .sockets
            .insert(sock, Socket::created(sock, family, transport, meta.timestamp));
        self.attach(sock, meta.pid);
        Ok(())
    }

    fn retire(&mut self, old: Socket, wall: DateTime<Utc>) {
        tracing::debug!(target: DETAIL_TARGET, sock = %old.id, flows = old.flows.len(), "socket id reused, retiring previous socket");
        for id in old.flows.values() {
            if let Some(flow) = self.flows.get_mut(id) {
                if flow.process.is_none() {
                    flow.process.clone_from(&old.process);
                }
                let _ = flow.terminate(TerminationReason::Closed, wall);
            }
        }
    }

    /// Handles an outbound connect.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::SocketClosing`] if the socket is closing and has
    /// no flow to the destination.
    pub fn on_connected(
        &mut self,
        meta: &EventMeta,
        sock: SocketId,
        transport: Transport,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<(), FlowError> {
        self.on_endpoints(meta, sock, transport, local, remote, Direction::Outbound)
    }

    /// Handles an accepted inbound connection.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::SocketClosing`] if the socket is closing and has
    /// no flow from the peer.
    pub fn on_accepted(
        &mut self,
        meta: &EventMeta,
        sock: SocketId,
        transport: Transport,
        local: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<(), FlowError> {
        self.on_endpoints(meta, sock, transport, local, remote, Direction::Inbound)
    }

    fn on_endpoints(
        &mut self,
        meta: &EventMeta,
        sock: SocketId,
        transport: Transport,
        local: Option<SocketAddr>,
        remote: SocketAddr,
        direction: Direction,
    ) -> Result<(), FlowError> {
        let _ = self.wall(meta.timestamp)?;
        let socket = Self::socket_entry(&mut self.sockets, sock, meta.timestamp);
        socket.touch(meta.timestamp);
        socket.learn(Some(transport), local, Some(remote));
        if socket.direction == Direction::Unknown {
            socket.direction = direction;
        }
        self.attach(sock, meta.pid);

        let id = self.flow_id(sock, FlowKey { transport, remote }, meta.timestamp)?;
        if let Some(flow) = self.flows.get_mut(&id) {
            if flow.direction == Direction::Unknown {
                flow.direction = direction;
            }
            if local.is_some() {
                flow.local = local;
            }
            flow.touch(meta.timestamp);
        }
        Ok(())
    }

    /// Handles a send or receive.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::MissingTransport`] or
    /// [`FlowError::MissingEndpoint`] when the tuple cannot be determined,
    /// and [`FlowError::SocketClosing`] for a new tuple on a closing socket.
    pub fn on_data(&mut self, meta: &EventMeta, sock: SocketId, transfer: Transfer) -> Result<(), FlowError> {
        let _ = self.wall(meta.timestamp)?;
        let socket = Self::socket_entry(&mut self.sockets, sock, meta.timestamp);
        socket.touch(meta.timestamp);
        let transport = transfer
            .transport
            .or(socket.transport)
            .ok_or(FlowError::MissingTransport { sock })?;
        let remote = transfer
            .remote
            .or(socket.remote)
            .ok_or(FlowError::MissingEndpoint { sock })?;
        // Unconnected datagram sockets talk to many peers; only the first
        // one becomes the socket's remote endpoint.
        let learned_remote = socket.remote.is_none().then_some(remote);
        socket.learn(Some(transport), transfer.local, learned_remote);
        if transfer.traffic == Traffic::Sent {
            self.attach(sock, meta.pid);
        }

        let id = self.flow_id(sock, FlowKey { transport, remote }, meta.timestamp)?;
        if let Some(flow) = self.flows.get_mut(&id) {
            if flow.local.is_none() {
                flow.local = transfer.local;
            }
            flow.record(transfer.traffic, transfer.bytes, transfer.packets, meta.timestamp);
        }
        Ok(())
    }

    /// Handles socket release. Every open flow of the socket starts its
    /// termination grace period.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::AlreadyClosed`] for a repeated close.
    pub fn on_closed(&mut self, meta: &EventMeta, sock: SocketId, reset: bool) -> Result<(), FlowError> {
        let wall = self.wall(meta.timestamp)?;
        let socket = Self::socket_entry(&mut self.sockets, sock, meta.timestamp);
        if socket.state == SocketState::Closing {
            return Err(FlowError::AlreadyClosed { sock });
        }
        socket.state = SocketState::Closing;
        socket.touch(meta.timestamp);

        let reason = if reset {
            TerminationReason::Reset
        } else {
            TerminationReason::Closed
        };
        for id in socket.flows.values() {
            if let Some(flow) = self.flows.get_mut(id) {
                let _ = flow.terminate(reason, wall);
            }
        }
        Ok(())
    }

    /// Handles `execve(2)`: the pid now names a new process image.
    /// Credentials carry over from the previous image.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::MissingPid`] for an event without a pid.
    pub fn on_exec(&mut self, exec: &ProcessExec) -> Result<(), FlowError> {
        let pid = exec.meta.pid;
        if pid == 0 {
            return Err(FlowError::MissingPid);
        }
        let _ = self.wall(exec.meta.timestamp)?;

        let mut process = Process::new(pid)
            .with_name(exec.name.clone())
            .with_args(exec.args.clone());
        if let Some(exe) = &exec.exe {
            process = process.with_exe(exe.clone());
        }
        if let Some(start) = exec.start_time_ns.and_then(|ns| self.clock.to_wall(ns)) {
            process = process.with_start_time(start);
        }
        if let Some(creds) = self.processes.get(pid).and_then(|p| p.credentials()) {
            process = process.with_credentials(creds);
        }
        let _ = self.create_process(process);
        Ok(())
    }

    /// Handles `commit_creds`: backfills credentials of the current process.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::MissingPid`] for an event without a pid.
    pub fn on_creds(&mut self, meta: &EventMeta, creds: Credentials) -> Result<(), FlowError> {
        if meta.pid == 0 {
            return Err(FlowError::MissingPid);
        }
        let _ = self.wall(meta.timestamp)?;
        let process = self.processes.get_or_create(meta.pid);
        if !process.backfill_credentials(creds) {
            tracing::trace!(target: DETAIL_TARGET, pid = meta.pid, "credentials already known");
        }
        Ok(())
    }

    /// Applies a clock calibration sample.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError::Untranslatable`] when the wall-clock value does
    /// not fit a timestamp.
    pub fn on_clock_sync(&mut self, kernel_ns: u64, wall_ns: u64) -> Result<(), FlowError> {
        let wall = i64::try_from(wall_ns)
            .map(DateTime::from_timestamp_nanos)
            .map_err(|_| FlowError::Untranslatable { timestamp: kernel_ns })?;
        let _ = self.clock.calibrate(kernel_ns, wall);
        self.advance(wall);
        Ok(())
    }

    /// Runs time-based expiry as of `now`.
    ///
    /// Idle open flows start their grace period, flows whose grace period
    /// has elapsed are emitted in order of termination, and sockets with
    /// nothing left to emit are dropped once closed or idle. Returns the
    /// number of flows emitted.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let Timeouts {
            flow_inactive,
            socket_inactive,
            termination,
        } = self.timeouts;

        for flow in self.flows.values_mut() {
            if flow.phase != FlowPhase::Open {
                continue;
            }
            let Some(last) = self.clock.to_wall(flow.last_ns) else {
                continue;
            };
            if now - last >= flow_inactive {
                let since = last.checked_add_signed(flow_inactive).unwrap_or(now);
                let _ = flow.terminate(TerminationReason::TimedOut, since);
            }
        }

        let mut due: Vec<(DateTime<Utc>, FlowId)> = self
            .flows
            .values()
            .filter(|f| f.phase == FlowPhase::PendingTermination)
            .filter_map(|f| {
                let since = f.pending_since?;
                let deadline = since.checked_add_signed(termination)?;
                (deadline <= now).then_some((since, f.id))
            })
            .collect();
        due.sort_unstable();
        for (_, id) in &due {
            if let Some(flow) = self.flows.remove(id) {
                self.finalize(flow, now);
            }
        }

        let clock = &self.clock;
        self.sockets.retain(|id, socket| {
            if !socket.flows.is_empty() {
                return true;
            }
            if socket.state == SocketState::Closing {
                socket.state = SocketState::Closed;
                tracing::trace!(target: DETAIL_TARGET, sock = %id, "closed socket released");
                return false;
            }
            let idle = clock
                .to_wall(socket.last_ns)
                .is_some_and(|last| now - last >= socket_inactive);
            if idle {
                tracing::trace!(target: DETAIL_TARGET, sock = %id, "idle socket released");
            }
            !idle
        });

        due.len()
    }

    fn finalize(&mut self, flow: Flow, now: DateTime<Utc>) {
        if let Some(socket) = self.sockets.get_mut(&flow.sock) {
            if socket.flows.get(&flow.key) == Some(&flow.id) {
                let _ = socket.flows.remove(&flow.key);
            }
        }

        let start = self.clock.to_wall(flow.first_ns).unwrap_or(now);
        let end = self.clock.to_wall(flow.last_ns).unwrap_or(now);
        let termination = flow.termination.unwrap_or(TerminationReason::TimedOut);
        let record = FlowRecord {
            socket: flow.sock,
            transport: flow.key.transport,
            family: Family::of(&flow.key.remote),
            direction: flow.direction,
            local: flow.local,
            remote: flow.key.remote,
            sent: flow.sent,
            received: flow.received,
            start,
            end,
            process: flow
                .process
                .as_deref()
                .map(|p| ProcessIdentity::of(p, self.host_id.as_deref()))
                .unwrap_or_default(),
            dns_hostname: self.dns.resolve(flow.key.remote.ip(), end, now),
            termination,
        };
        self.emitted += 1;
        tracing::debug!(
            target: DETAIL_TARGET,
            sock = %flow.sock,
            id = %flow.id,
            remote = %flow.key.remote,
            %termination,
            "flow emitted"
        );
        self.reporter.report(record);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::*;

    const SEC: u64 = 1_000_000_000;
    const SOCK: SocketId = SocketId::new(0xffff_8880_0000_1000);

    fn base() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn meta(secs: u64, pid: u32) -> EventMeta {
        EventMeta {
            timestamp: secs * SEC,
            pid,
            tid: pid,
        }
    }

    fn state() -> (FlowState, mpsc::UnboundedReceiver<FlowRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = SensorConfig {
            flow_inactive_timeout: Duration::from_secs(30),
            flow_termination_timeout: Duration::from_secs(5),
            socket_inactive_timeout: Duration::from_secs(60),
            host_id: Some("test-host".into()),
            ..SensorConfig::default()
        };
        let mut state = FlowState::new(&config, Box::new(tx));
        state.on_clock_sync(0, u64::try_from(base().timestamp_nanos_opt().unwrap()).unwrap()).unwrap();
        (state, rx)
    }

    fn remote() -> SocketAddr {
        "10.0.0.5:443".parse().unwrap()
    }

    fn sent(bytes: u64) -> Transfer {
        Transfer {
            traffic: Traffic::Sent,
            transport: None,
            local: None,
            remote: None,
            bytes,
            packets: 1,
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        base() + TimeDelta::seconds(secs)
    }

    #[test]
    fn close_moves_flows_to_pending_until_grace_elapses() {
        let (mut s, mut rx) = state();
        s.on_socket_created(&meta(1, 100), SOCK, Family::Ipv4, Transport::Tcp).unwrap();
        s.on_connected(&meta(2, 100), SOCK, Transport::Tcp, None, remote()).unwrap();
        s.on_data(&meta(3, 100), SOCK, sent(10)).unwrap();
        s.on_closed(&meta(4, 100), SOCK, false).unwrap();

        let flow = s.flow(SOCK, Transport::Tcp, remote()).unwrap();
        assert_eq!(flow.phase(), FlowPhase::PendingTermination);
        assert_eq!(s.expire(at(8)), 0);
        assert_eq!(s.expire(at(9)), 1);
        let record = rx.try_recv().unwrap();
        assert_eq!(record.direction, Direction::Outbound);
        assert_eq!(record.sent.bytes, 10);
        assert_eq!(record.start, at(2));
        assert_eq!(record.end, at(3));
        assert_eq!(s.socket_count(), 0);
        assert_eq!(s.flow_count(), 0);
    }

    #[test]
    fn second_close_is_rejected() {
        let (mut s, _rx) = state();
        s.on_closed(&meta(1, 0), SOCK, false).unwrap();
        assert_eq!(s.on_closed(&meta(2, 0), SOCK, false), Err(FlowError::AlreadyClosed { sock: SOCK }));
    }

    #[test]
    fn new_tuple_on_closing_socket_is_rejected() {
        let (mut s, _rx) = state();
        s.on_connected(&meta(1, 100), SOCK, Transport::Udp, None, remote()).unwrap();
        s.on_closed(&meta(2, 100), SOCK, false).unwrap();
        let other: SocketAddr = "10.0.0.6:53".parse().unwrap();
        let mut late = sent(5);
        late.remote = Some(other);
        assert_eq!(
            s.on_data(&meta(3, 100), SOCK, late),
            Err(FlowError::SocketClosing { sock: SOCK })
        );
        // the existing tuple still counts late traffic
        s.on_data(&meta(3, 100), SOCK, sent(7)).unwrap();
        assert_eq!(s.flow(SOCK, Transport::Udp, remote()).unwrap().sent().bytes, 7);
    }

    #[test]
    fn traffic_without_endpoint_or_transport_is_rejected() {
        let (mut s, _rx) = state();
        assert_eq!(
            s.on_data(&meta(1, 1), SOCK, sent(1)),
            Err(FlowError::MissingTransport { sock: SOCK })
        );
        let mut tcp = sent(1);
        tcp.transport = Some(Transport::Tcp);
        assert_eq!(
            s.on_data(&meta(1, 1), SOCK, tcp),
            Err(FlowError::MissingEndpoint { sock: SOCK })
        );
    }

    #[test]
    fn receive_does_not_attach_process() {
        let (mut s, _rx) = state();
        let mut recv = sent(1);
        recv.traffic = Traffic::Received;
        recv.transport = Some(Transport::Udp);
        recv.remote = Some(remote());
        s.on_data(&meta(1, 4242), SOCK, recv).unwrap();
        assert!(s.socket(SOCK).unwrap().process().is_none());
        s.on_data(&meta(2, 7), SOCK, sent(1)).unwrap();
        assert_eq!(s.socket(SOCK).unwrap().process().unwrap().pid, 7);
        assert_eq!(s.flow(SOCK, Transport::Udp, remote()).unwrap().process.as_ref().unwrap().pid, 7);
    }

    #[test]
    fn socket_reuse_retires_previous_flows() {
        let (mut s, mut rx) = state();
        s.on_socket_created(&meta(1, 100), SOCK, Family::Ipv4, Transport::Tcp).unwrap();
        s.on_connected(&meta(2, 100), SOCK, Transport::Tcp, None, remote()).unwrap();
        s.on_socket_created(&meta(3, 200), SOCK, Family::Ipv4, Transport::Tcp).unwrap();

        assert_eq!(s.socket(SOCK).unwrap().process().unwrap().pid, 200);
        assert!(s.flow(SOCK, Transport::Tcp, remote()).is_none());
        assert_eq!(s.flow_count(), 1);

        assert_eq!(s.expire(at(8)), 1);
        let record = rx.try_recv().unwrap();
        assert_eq!(record.termination, TerminationReason::Closed);
        assert_eq!(record.process.pid, Some(100));
        assert!(s.socket(SOCK).is_some());
    }

    #[test]
    fn process_replacement_keeps_socket_snapshot() {
        let (mut s, _rx) = state();
        let _ = s.create_process(Process::new(100).with_name("curl"));
        s.on_socket_created(&meta(1, 100), SOCK, Family::Ipv4, Transport::Tcp).unwrap();
        let _ = s.create_process(Process::new(100).with_name("nginx"));
        let owner = s.socket(SOCK).unwrap().process().unwrap();
        assert_eq!(owner.name.as_deref(), Some("curl"));
    }

    #[test]
    fn exec_and_creds_populate_the_process_table() {
        let (mut s, _rx) = state();
        let creds = Credentials {
            uid: 1000,
            euid: 1000,
            gid: 1000,
            egid: 1000,
        };
        s.on_creds(&meta(1, 55), creds).unwrap();
        let exec = ProcessExec {
            meta: meta(2, 55),
            name: "ssh".into(),
            args: vec!["ssh".into(), "host".into()],
            exe: Some("/usr/bin/ssh".into()),
            start_time_ns: Some(2 * SEC),
        };
        s.on_exec(&exec).unwrap();
        s.on_connected(&meta(3, 55), SOCK, Transport::Tcp, None, remote()).unwrap();

        let owner = s.socket(SOCK).unwrap().process().unwrap();
        assert_eq!(owner.name.as_deref(), Some("ssh"));
        assert_eq!(owner.credentials(), Some(creds));
        assert_eq!(owner.start_time, Some(at(2)));
        assert!(owner.entity_id(Some("test-host")).is_some());
        assert_eq!(s.on_creds(&meta(4, 0), creds), Err(FlowError::MissingPid));
    }

    #[test]
    fn idle_socket_without_flows_is_released() {
        let (mut s, _rx) = state();
        s.on_socket_created(&meta(1, 100), SOCK, Family::Ipv6, Transport::Udp).unwrap();
        let _ = s.expire(at(60));
        assert_eq!(s.socket_count(), 1);
        let _ = s.expire(at(61));
        assert_eq!(s.socket_count(), 0);
    }

    #[test]
    fn events_before_calibration_are_estimated() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut s = FlowState::new(&SensorConfig::default(), Box::new(tx));
        s.on_socket_created(&meta(1, 1), SOCK, Family::Ipv4, Transport::Tcp).unwrap();
        assert!(!s.clock().is_calibrated());
        assert!(s.last_event_time().is_some());
    }
}
