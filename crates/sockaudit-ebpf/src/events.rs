//! Decoded kernel trace events.
//!
//! Each kernel hook yields one of these types. The dispatcher applies them to the
//! state through [`Event::update`]; `Display` renders the compact one-line
//! form used in detail logs.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sockaudit_common::constants::CLOCK_SYNC_MAGIC;
use sockaudit_common::types::{Credentials, Family, SocketId, Transport};

use crate::error::FlowError;
use crate::state::flow::{Traffic, Transfer};
use crate::state::FlowState;

/// A decoded kernel event.
pub trait Event: fmt::Display + Send {
    /// Kernel trace clock timestamp in nanoseconds.
    fn timestamp(&self) -> u64;

    /// Applies the event to the state.
    ///
    /// # Errors
    ///
    /// Returns a [`FlowError`] when the event cannot be applied. The
    /// condition is benign and processing continues.
    fn update(&self, state: &mut FlowState) -> Result<(), FlowError>;
}

/// Fields every kernel hook captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    /// Kernel trace clock in nanoseconds.
    pub timestamp: u64,
    /// Thread group ID of the current task, 0 in interrupt context.
    pub pid: u32,
    /// Thread ID of the current task.
    #[serde(default)]
    pub tid: u32,
}

impl fmt::Display for EventMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pid={} tid={}", self.timestamp, self.pid, self.tid)
    }
}

const fn default_packets() -> u64 {
    1
}

/// A socket was allocated (`inet_create` and friends).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketCreated {
    /// Common fields.
    pub meta: EventMeta,
    /// Socket pointer.
    pub sock: SocketId,
    /// Address family.
    pub family: Family,
    /// Transport protocol.
    pub transport: Transport,
}

/// An outbound connection was initiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connected {
    /// Common fields.
    pub meta: EventMeta,
    /// Socket pointer.
    pub sock: SocketId,
    /// Transport protocol.
    pub transport: Transport,
    /// Local endpoint, when already bound.
    #[serde(default)]
    pub local: Option<SocketAddr>,
    /// Destination.
    pub remote: SocketAddr,
}

/// An inbound connection was accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Accepted {
    /// Common fields.
    pub meta: EventMeta,
    /// Socket pointer of the accepted connection.
    pub sock: SocketId,
    /// Transport protocol.
    pub transport: Transport,
    /// Listening endpoint.
    #[serde(default)]
    pub local: Option<SocketAddr>,
    /// Peer.
    pub remote: SocketAddr,
}

/// Payload handed to the stack for transmission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSent {
    /// Common fields.
    pub meta: EventMeta,
    /// Socket pointer.
    pub sock: SocketId,
    /// Transport protocol, if the hook could read it.
    #[serde(default)]
    pub transport: Option<Transport>,
    /// Local endpoint.
    #[serde(default)]
    pub local: Option<SocketAddr>,
    /// Destination; absent for connected sockets.
    #[serde(default)]
    pub remote: Option<SocketAddr>,
    /// Payload length.
    pub bytes: u64,
    /// Packets or datagrams.
    #[serde(default = "default_packets")]
    pub packets: u64,
}

/// Payload delivered to the socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataReceived {
    /// Common fields.
    pub meta: EventMeta,
    /// Socket pointer.
    pub sock: SocketId,
    /// Transport protocol, if the hook could read it.
    #[serde(default)]
    pub transport: Option<Transport>,
    /// Local endpoint.
    #[serde(default)]
    pub local: Option<SocketAddr>,
    /// Source; absent for connected sockets.
    #[serde(default)]
    pub remote: Option<SocketAddr>,
    /// Payload length.
    pub bytes: u64,
    /// Packets or datagrams.
    #[serde(default = "default_packets")]
    pub packets: u64,
}

/// The socket was released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SocketClosed {
    /// Common fields.
    pub meta: EventMeta,
    /// Socket pointer.
    pub sock: SocketId,
    /// Whether the connection was reset rather than closed in order.
    #[serde(default)]
    pub reset: bool,
}

/// A process image was replaced by `execve(2)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExec {
    /// Common fields; `pid` is the executing process.
    pub meta: EventMeta,
    /// Command name.
    pub name: String,
    /// Argument vector.
    #[serde(default)]
    pub args: Vec<String>,
    /// Executable path.
    #[serde(default)]
    pub exe: Option<PathBuf>,
    /// Process start on the kernel clock, if captured.
    #[serde(default)]
    pub start_time_ns: Option<u64>,
}

/// New credentials were committed for the current task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredsCommitted {
    /// Common fields.
    pub meta: EventMeta,
    /// Committed credentials.
    pub creds: Credentials,
}

/// A `uname(2)` call, possibly carrying a clock calibration sample.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnameCall {
    /// Common fields.
    pub meta: EventMeta,
    /// First 8 bytes of the caller's buffer.
    pub magic: u64,
    /// Next 8 bytes: wall-clock Unix nanoseconds for calibration calls.
    pub wall_ns: u64,
}

impl UnameCall {
    /// Decodes the buffer prefix captured by the hook. Values are native
    /// endian, as written by the calling process.
    ///
    /// Returns `None` when fewer than 16 bytes were captured.
    #[must_use]
    pub fn from_buffer(meta: EventMeta, buf: &[u8]) -> Option<Self> {
        let magic = buf.get(..8)?.try_into().ok().map(u64::from_ne_bytes)?;
        let wall_ns = buf.get(8..16)?.try_into().ok().map(u64::from_ne_bytes)?;
        Some(Self {
            meta,
            magic,
            wall_ns,
        })
    }

    /// Whether this call was issued by the clock synchronizer.
    #[must_use]
    pub const fn is_clock_sync(&self) -> bool {
        self.magic == CLOCK_SYNC_MAGIC
    }
}

impl Event for SocketCreated {
    fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        state.on_socket_created(&self.meta, self.sock, self.family, self.transport)
    }
}

impl fmt::Display for SocketCreated {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} socket_created sock={} family={:?} transport={}",
            self.meta, self.sock, self.family, self.transport
        )
    }
}

impl Event for Connected {
    fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        state.on_connected(&self.meta, self.sock, self.transport, self.local, self.remote)
    }
}

impl fmt::Display for Connected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connect sock={} {} -> {}",
            self.meta, self.sock, self.transport, self.remote
        )
    }
}

impl Event for Accepted {
    fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        state.on_accepted(&self.meta, self.sock, self.transport, self.local, self.remote)
    }
}

impl fmt::Display for Accepted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} accept sock={} {} <- {}",
            self.meta, self.sock, self.transport, self.remote
        )
    }
}

impl Event for DataSent {
    fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        state.on_data(
            &self.meta,
            self.sock,
            Transfer {
                traffic: Traffic::Sent,
                transport: self.transport,
                local: self.local,
                remote: self.remote,
                bytes: self.bytes,
                packets: self.packets,
            },
        )
    }
}

impl fmt::Display for DataSent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} send sock={} bytes={}", self.meta, self.sock, self.bytes)
    }
}

impl Event for DataReceived {
    fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        state.on_data(
            &self.meta,
            self.sock,
            Transfer {
                traffic: Traffic::Received,
                transport: self.transport,
                local: self.local,
                remote: self.remote,
                bytes: self.bytes,
                packets: self.packets,
            },
        )
    }
}

impl fmt::Display for DataReceived {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} recv sock={} bytes={}", self.meta, self.sock, self.bytes)
    }
}

impl Event for SocketClosed {
    fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        state.on_closed(&self.meta, self.sock, self.reset)
    }
}

impl fmt::Display for SocketClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} close sock={} reset={}", self.meta, self.sock, self.reset)
    }
}

impl Event for ProcessExec {
    fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        state.on_exec(self)
    }
}

impl fmt::Display for ProcessExec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} exec name={}", self.meta, self.name)
    }
}

impl Event for CredsCommitted {
    fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        state.on_creds(&self.meta, self.creds)
    }
}

impl fmt::Display for CredsCommitted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} commit_creds uid={} euid={} gid={} egid={}",
            self.meta, self.creds.uid, self.creds.euid, self.creds.gid, self.creds.egid
        )
    }
}

impl Event for UnameCall {
    fn timestamp(&self) -> u64 {
        self.meta.timestamp
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        if !self.is_clock_sync() {
            return Err(FlowError::NotClockSync);
        }
        state.on_clock_sync(self.meta.timestamp, self.wall_ns)
    }
}

impl fmt::Display for UnameCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clock_sync() {
            write!(f, "{} clock_sync wall_ns={}", self.meta, self.wall_ns)
        } else {
            write!(f, "{} uname", self.meta)
        }
    }
}

/// Any decoded event, in the tagged form used by capture files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TraceEvent {
    /// See [`SocketCreated`].
    SocketCreated(SocketCreated),
    /// See [`Connected`].
    Connected(Connected),
    /// See [`Accepted`].
    Accepted(Accepted),
    /// See [`DataSent`].
    DataSent(DataSent),
    /// See [`DataReceived`].
    DataReceived(DataReceived),
    /// See [`SocketClosed`].
    SocketClosed(SocketClosed),
    /// See [`ProcessExec`].
    ProcessExec(ProcessExec),
    /// See [`CredsCommitted`].
    CredsCommitted(CredsCommitted),
    /// See [`UnameCall`].
    Uname(UnameCall),
}

impl TraceEvent {
    fn inner(&self) -> &dyn Event {
        match self {
            Self::SocketCreated(e) => e,
            Self::Connected(e) => e,
            Self::Accepted(e) => e,
            Self::DataSent(e) => e,
            Self::DataReceived(e) => e,
            Self::SocketClosed(e) => e,
            Self::ProcessExec(e) => e,
            Self::CredsCommitted(e) => e,
            Self::Uname(e) => e,
        }
    }
}

impl Event for TraceEvent {
    fn timestamp(&self) -> u64 {
        self.inner().timestamp()
    }

    fn update(&self, state: &mut FlowState) -> Result<(), FlowError> {
        self.inner().update(state)
    }
}

impl fmt::Display for TraceEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.inner(), f)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    const META: EventMeta = EventMeta {
        timestamp: 5,
        pid: 100,
        tid: 100,
    };

    #[test]
    fn uname_buffer_decodes_native_endian() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&CLOCK_SYNC_MAGIC.to_ne_bytes());
        buf.extend_from_slice(&1_700_000_000_000_000_000u64.to_ne_bytes());
        buf.extend_from_slice(b"Linux\0");
        let call = UnameCall::from_buffer(META, &buf).unwrap();
        assert!(call.is_clock_sync());
        assert_eq!(call.wall_ns, 1_700_000_000_000_000_000);
    }

    #[test]
    fn short_uname_buffer_is_rejected() {
        assert!(UnameCall::from_buffer(META, &[0u8; 12]).is_none());
    }

    #[test]
    fn genuine_uname_is_not_a_sample() {
        let mut buf = [0u8; 65];
        buf[..5].copy_from_slice(b"Linux");
        assert!(!UnameCall::from_buffer(META, &buf).unwrap().is_clock_sync());
    }

    #[test]
    fn tagged_events_parse_with_defaults() {
        let line = r#"{"kind":"data_sent","meta":{"timestamp":7,"pid":100},"sock":4096,"bytes":500}"#;
        let event: TraceEvent = serde_json::from_str(line).unwrap();
        let TraceEvent::DataSent(sent) = &event else {
            unreachable!("wrong variant: {event:?}");
        };
        assert_eq!(sent.packets, 1);
        assert_eq!(sent.meta.tid, 0);
        assert!(sent.remote.is_none());
        assert_eq!(event.timestamp(), 7);
        assert!(event.to_string().contains("send sock=0x1000"));
    }
}
