//! Kernel socket tracking.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use sockaudit_common::types::{Direction, Family, SocketId, SocketState, Transport};

use super::flow::{FlowId, FlowKey};
use crate::process::Process;

/// A kernel socket and the flows it carries.
#[derive(Debug, Clone)]
pub struct Socket {
    pub(crate) id: SocketId,
    pub(crate) family: Option<Family>,
    pub(crate) transport: Option<Transport>,
    pub(crate) local: Option<SocketAddr>,
    pub(crate) remote: Option<SocketAddr>,
    pub(crate) direction: Direction,
    pub(crate) process: Option<Arc<Process>>,
    pub(crate) created_ns: Option<u64>,
    pub(crate) last_ns: u64,
    pub(crate) state: SocketState,
    pub(crate) flows: HashMap<FlowKey, FlowId>,
}

impl Socket {
    /// A socket whose creation was observed.
    pub(crate) fn created(
        id: SocketId,
        family: Family,
        transport: Transport,
        timestamp: u64,
    ) -> Self {
        Self {
            family: Some(family),
            transport: Some(transport),
            created_ns: Some(timestamp),
            ..Self::stand_in(id, timestamp)
        }
    }

    /// A placeholder for a socket first seen mid-life.
    pub(crate) fn stand_in(id: SocketId, timestamp: u64) -> Self {
        Self {
            id,
            family: None,
            transport: None,
            local: None,
            remote: None,
            direction: Direction::Unknown,
            process: None,
            created_ns: None,
            last_ns: timestamp,
            state: SocketState::New,
            flows: HashMap::new(),
        }
    }

    /// Kernel identifier.
    #[must_use]
    pub const fn id(&self) -> SocketId {
        self.id
    }

    /// Liveness state.
    #[must_use]
    pub const fn state(&self) -> SocketState {
        self.state
    }

    /// Whether the socket was synthesized from traffic rather than creation.
    #[must_use]
    pub const fn is_stand_in(&self) -> bool {
        self.created_ns.is_none()
    }

    /// Owning process snapshot.
    #[must_use]
    pub fn process(&self) -> Option<&Arc<Process>> {
        self.process.as_ref()
    }

    /// Number of flows not yet emitted.
    #[must_use]
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub(crate) const fn touch(&mut self, timestamp: u64) {
        if timestamp > self.last_ns {
            self.last_ns = timestamp;
        }
    }

    /// Sets the owner unless one is already recorded. Returns the process
    /// newly attached, if any.
    pub(crate) fn attach(&mut self, process: Arc<Process>) -> Option<Arc<Process>> {
        if self.process.is_some() {
            return None;
        }
        self.process = Some(Arc::clone(&process));
        Some(process)
    }

    /// Fills in endpoints and transport revealed by an event. Known values
    /// are only replaced by newer non-empty ones.
    pub(crate) fn learn(
        &mut self,
        transport: Option<Transport>,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) {
        if let Some(t) = transport {
            self.transport = Some(t);
        }
        if let Some(l) = local {
            self.local = Some(l);
        }
        if let Some(r) = remote {
            self.remote = Some(r);
            if self.family.is_none() {
                self.family = Some(Family::of(&r));
            }
        }
        if self.state == SocketState::New {
            self.state = SocketState::Active;
        }
    }
}
