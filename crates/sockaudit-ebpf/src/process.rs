//! Process identities and the bounded process table.
//!
//! A process is immutable once inserted except for credentials, which may
//! be backfilled the first time the kernel reports them. Sockets capture an
//! `Arc` snapshot of their owner, so replacing a pid in the table never
//! changes what an existing socket reports.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sockaudit_common::constants::ENTITY_ID_BYTES;
use sockaudit_common::types::Credentials;

/// A process observed through `/proc` or kernel events.
#[derive(Debug, Clone)]
pub struct Process {
    /// Kernel process ID.
    pub pid: u32,
    /// Short command name.
    pub name: Option<String>,
    /// Argument vector.
    pub args: Vec<String>,
    /// Resolved executable path.
    pub exe: Option<PathBuf>,
    /// Wall-clock start time.
    pub start_time: Option<DateTime<Utc>>,
    credentials: OnceLock<Credentials>,
    entity_id: OnceLock<String>,
}

impl Process {
    /// Creates a process known only by its pid.
    #[must_use]
    pub const fn new(pid: u32) -> Self {
        Self {
            pid,
            name: None,
            args: Vec::new(),
            exe: None,
            start_time: None,
            credentials: OnceLock::new(),
            entity_id: OnceLock::new(),
        }
    }

    /// Sets the command name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the argument vector.
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Sets the executable path.
    #[must_use]
    pub fn with_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.exe = Some(exe.into());
        self
    }

    /// Sets the wall-clock start time.
    #[must_use]
    pub fn with_start_time(mut self, start: DateTime<Utc>) -> Self {
        self.start_time = Some(start);
        self
    }

    /// Sets the initial credentials.
    #[must_use]
    pub fn with_credentials(self, creds: Credentials) -> Self {
        let _ = self.credentials.set(creds);
        self
    }

    /// Credentials, if known.
    #[must_use]
    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.get().copied()
    }

    /// Records credentials unless some were already known.
    ///
    /// Returns `true` when the value was stored.
    pub fn backfill_credentials(&self, creds: Credentials) -> bool {
        self.credentials.set(creds).is_ok()
    }

    /// Stable identifier for this process instance on this host.
    ///
    /// Computed on first request once both a host identifier and a nonzero
    /// start time are available, then cached.
    pub fn entity_id(&self, host_id: Option<&str>) -> Option<&str> {
        if let Some(id) = self.entity_id.get() {
            return Some(id);
        }
        let host = host_id.filter(|h| !h.is_empty())?;
        let id = entity_id(host, self.pid, self.start_time?)?;
        Some(self.entity_id.get_or_init(|| id))
    }
}

/// Hashes host, pid and start time into a hex entity ID.
///
/// Returns `None` for a start time at the epoch or outside the
/// representable nanosecond range.
#[must_use]
pub fn entity_id(host_id: &str, pid: u32, start: DateTime<Utc>) -> Option<String> {
    let start_ns = start.timestamp_nanos_opt().filter(|ns| *ns != 0)?;
    let mut hasher = Sha256::new();
    hasher.update(host_id.as_bytes());
    hasher.update(i64::from(pid).to_le_bytes());
    hasher.update(start_ns.to_le_bytes());
    let digest = hasher.finalize();
    Some(hex::encode(&digest[..ENTITY_ID_BYTES]))
}

/// Process fields as they appear in an emitted record. Every field is
/// optional since a socket may outlive all knowledge of its owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessIdentity {
    /// Process ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Command name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument vector.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Executable path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exe: Option<PathBuf>,
    /// Entity ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Credentials.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

impl ProcessIdentity {
    /// Builds the record view of `process`.
    #[must_use]
    pub fn of(process: &Process, host_id: Option<&str>) -> Self {
        Self {
            pid: Some(process.pid),
            name: process.name.clone(),
            args: process.args.clone(),
            exe: process.exe.clone(),
            entity_id: process.entity_id(host_id).map(str::to_owned),
            credentials: process.credentials(),
        }
    }
}

#[derive(Debug)]
struct Slot {
    process: Arc<Process>,
    last_used: u64,
}

/// Pid-indexed process table bounded by least-recently-used eviction.
///
/// `recency` maps each slot's last-use tick back to its pid, so the
/// oldest entry is found without scanning the table.
#[derive(Debug)]
pub struct ProcessTable {
    slots: HashMap<u32, Slot>,
    recency: BTreeMap<u64, u32>,
    capacity: usize,
    tick: u64,
    evicted: u64,
}

impl ProcessTable {
    /// Creates an empty table holding at most `capacity` processes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            recency: BTreeMap::new(),
            capacity: capacity.max(1),
            tick: 0,
            evicted: 0,
        }
    }

    const fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Inserts `process`, replacing any entry with the same pid.
    pub fn insert(&mut self, process: Process) -> Arc<Process> {
        let pid = process.pid;
        let process = Arc::new(process);
        let last_used = self.next_tick();
        let slot = Slot {
            process: Arc::clone(&process),
            last_used,
        };
        if let Some(old) = self.slots.insert(pid, slot) {
            let _ = self.recency.remove(&old.last_used);
            tracing::trace!(pid, "replaced process entry");
        }
        let _ = self.recency.insert(last_used, pid);
        self.evict_overflow();
        process
    }

    /// Looks up a pid and marks it recently used.
    pub fn get(&mut self, pid: u32) -> Option<Arc<Process>> {
        let tick = self.next_tick();
        let slot = self.slots.get_mut(&pid)?;
        let _ = self.recency.remove(&slot.last_used);
        let _ = self.recency.insert(tick, pid);
        slot.last_used = tick;
        Some(Arc::clone(&slot.process))
    }

    /// Returns the entry for `pid`, creating a bare one if unseen.
    pub fn get_or_create(&mut self, pid: u32) -> Arc<Process> {
        match self.get(pid) {
            Some(process) => process,
            None => self.insert(Process::new(pid)),
        }
    }

    /// Number of tracked processes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Total entries evicted to stay within capacity.
    #[must_use]
    pub const fn evicted(&self) -> u64 {
        self.evicted
    }

    fn evict_overflow(&mut self) {
        while self.slots.len() > self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                return;
            };
            let _ = self.slots.remove(&oldest);
            self.evicted += 1;
            tracing::trace!(pid = oldest, "evicted least recently used process");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn started(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 500).unwrap()
    }

    const ROOT: Credentials = Credentials {
        uid: 0,
        euid: 0,
        gid: 0,
        egid: 0,
    };

    #[test]
    fn entity_id_is_stable_and_distinct() {
        let a = entity_id("host-a", 100, started(0)).unwrap();
        assert_eq!(a.len(), ENTITY_ID_BYTES * 2);
        assert_eq!(a, entity_id("host-a", 100, started(0)).unwrap());
        assert_ne!(a, entity_id("host-b", 100, started(0)).unwrap());
        assert_ne!(a, entity_id("host-a", 101, started(0)).unwrap());
        assert_ne!(a, entity_id("host-a", 100, started(1)).unwrap());
    }

    #[test]
    fn entity_id_needs_host_and_start_time() {
        let bare = Process::new(7);
        assert!(bare.entity_id(Some("host")).is_none());
        let p = Process::new(7).with_start_time(started(0));
        assert!(p.entity_id(None).is_none());
        assert!(p.entity_id(Some("")).is_none());
        assert!(p.entity_id(Some("host")).is_some());
        assert!(entity_id("host", 7, DateTime::UNIX_EPOCH).is_none());
    }

    #[test]
    fn credentials_backfill_only_once() {
        let p = Process::new(1);
        assert!(p.backfill_credentials(ROOT));
        let other = Credentials { uid: 1000, ..ROOT };
        assert!(!p.backfill_credentials(other));
        assert_eq!(p.credentials(), Some(ROOT));
    }

    #[test]
    fn replacing_a_pid_keeps_old_snapshots() {
        let mut table = ProcessTable::new(8);
        let first = table.insert(Process::new(100).with_name("curl"));
        let _ = table.insert(Process::new(100).with_name("wget"));
        assert_eq!(first.name.as_deref(), Some("curl"));
        assert_eq!(table.get(100).unwrap().name.as_deref(), Some("wget"));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn eviction_drops_least_recently_used() {
        let mut table = ProcessTable::new(2);
        let _ = table.insert(Process::new(1));
        let _ = table.insert(Process::new(2));
        let _ = table.get(1);
        let _ = table.insert(Process::new(3));
        assert_eq!(table.len(), 2);
        assert!(table.get(2).is_none());
        assert!(table.get(1).is_some());
        assert_eq!(table.evicted(), 1);
    }

    #[test]
    fn eviction_follows_use_order_at_scale() {
        let mut table = ProcessTable::new(1000);
        for pid in 0..1000 {
            let _ = table.get_or_create(pid);
        }
        // Touch the even pids so the odd ones become the oldest.
        for pid in (0..1000).step_by(2) {
            let _ = table.get(pid);
        }
        for pid in 1000..1500 {
            let _ = table.get_or_create(pid);
        }
        assert_eq!(table.len(), 1000);
        assert_eq!(table.evicted(), 500);
        assert_eq!(table.recency.len(), table.slots.len());
        assert!((1..1000).step_by(2).all(|pid| !table.slots.contains_key(&pid)));
        assert!((0..1000).step_by(2).all(|pid| table.slots.contains_key(&pid)));
    }

    #[test]
    fn replacing_a_pid_leaves_no_stale_recency() {
        let mut table = ProcessTable::new(2);
        let _ = table.insert(Process::new(1));
        let _ = table.insert(Process::new(1).with_name("again"));
        let _ = table.insert(Process::new(2));
        let _ = table.insert(Process::new(3));
        assert_eq!(table.recency.len(), 2);
        assert!(table.get(1).is_none());
        assert!(table.get(2).is_some());
    }

    #[test]
    fn entity_id_is_lowercase_hex() {
        let id = entity_id("host-a", 100, started(0)).unwrap();
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn get_or_create_inserts_bare_entry() {
        let mut table = ProcessTable::new(4);
        let p = table.get_or_create(42);
        assert_eq!(p.pid, 42);
        assert!(p.name.is_none());
        assert!(Arc::ptr_eq(&p, &table.get_or_create(42)));
    }

    #[test]
    fn identity_carries_partial_fields() {
        let p = Process::new(5).with_name("sshd").with_credentials(ROOT);
        let id = ProcessIdentity::of(&p, Some("host"));
        assert_eq!(id.pid, Some(5));
        assert_eq!(id.name.as_deref(), Some("sshd"));
        assert!(id.entity_id.is_none());
        assert_eq!(id.credentials, Some(ROOT));
    }
}
