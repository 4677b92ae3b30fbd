//! DNS transaction index used to enrich flows with host names.
//!
//! Transactions arrive from an external sniffer on their own task, so the
//! index is the one piece of state shared across tasks and sits behind a
//! mutex. The flow engine only takes the lock when a flow is emitted.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Resolutions kept per address; older ones are dropped first.
const MAX_RESOLUTIONS_PER_ADDR: usize = 16;

/// A completed DNS query/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsTransaction {
    /// Queried name.
    pub query: String,
    /// Addresses returned in the answer section.
    pub answers: Vec<IpAddr>,
    /// Wall-clock time the response was observed.
    pub observed_at: DateTime<Utc>,
    /// Local endpoint that sent the query, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<SocketAddr>,
    /// Resolver that answered, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<SocketAddr>,
}

/// Reasons a transaction cannot be indexed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsError {
    /// The query name is empty.
    #[error("DNS transaction has an empty query name")]
    EmptyQuery,

    /// The response carried no usable address.
    #[error("DNS transaction for {query} has no resolved addresses")]
    NoAnswers {
        /// Queried name.
        query: String,
    },
}

#[derive(Debug, Clone)]
struct Resolution {
    name: Arc<str>,
    observed_at: DateTime<Utc>,
}

#[derive(Debug)]
struct DnsIndex {
    by_addr: HashMap<IpAddr, VecDeque<Resolution>>,
    retention: TimeDelta,
    newest: Option<DateTime<Utc>>,
    last_purge: Option<DateTime<Utc>>,
}

impl DnsIndex {
    fn insert(&mut self, addr: IpAddr, resolution: Resolution) {
        let entries = self.by_addr.entry(addr).or_default();
        let pos = entries
            .iter()
            .rposition(|r| r.observed_at <= resolution.observed_at)
            .map_or(0, |i| i + 1);
        entries.insert(pos, resolution);
        while entries.len() > MAX_RESOLUTIONS_PER_ADDR {
            let _ = entries.pop_front();
        }
    }

    fn horizon(&self) -> Option<DateTime<Utc>> {
        self.newest.and_then(|n| n.checked_sub_signed(self.retention))
    }

    fn purge(&mut self, force: bool) {
        let (Some(newest), Some(horizon)) = (self.newest, self.horizon()) else {
            return;
        };
        let due = self
            .last_purge
            .is_none_or(|last| newest - last >= self.retention);
        if !force && !due {
            return;
        }
        self.by_addr.retain(|_, entries| {
            while entries.front().is_some_and(|r| r.observed_at < horizon) {
                let _ = entries.pop_front();
            }
            !entries.is_empty()
        });
        self.last_purge = Some(newest);
    }
}

/// Shared handle to the DNS index. Cloning is cheap; all clones see the
/// same data.
#[derive(Debug, Clone)]
pub struct DnsCorrelator {
    inner: Arc<Mutex<DnsIndex>>,
}

impl DnsCorrelator {
    /// Creates an empty index that forgets transactions older than
    /// `retention`, measured from the newest observation.
    #[must_use]
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DnsIndex {
                by_addr: HashMap::new(),
                retention: TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX),
                newest: None,
                last_purge: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DnsIndex> {
        // The index only caches answers; a panic mid-update leaves at worst
        // a stale entry, so poisoning is not fatal.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Indexes a transaction under each of its resolved addresses.
    ///
    /// Returns how many addresses were indexed.
    ///
    /// # Errors
    ///
    /// Returns [`DnsError`] for a transaction without a query name or
    /// without answers.
    pub fn on_transaction(&self, tr: &DnsTransaction) -> Result<usize, DnsError> {
        let name = tr.query.trim().trim_end_matches('.').to_ascii_lowercase();
        if name.is_empty() {
            return Err(DnsError::EmptyQuery);
        }
        if tr.answers.is_empty() {
            return Err(DnsError::NoAnswers { query: name });
        }

        let name: Arc<str> = Arc::from(name);
        let mut index = self.lock();
        if index.horizon().is_some_and(|h| tr.observed_at < h) {
            tracing::debug!(query = %name, "dropping DNS transaction older than retention window");
            return Ok(0);
        }
        for addr in &tr.answers {
            index.insert(
                *addr,
                Resolution {
                    name: Arc::clone(&name),
                    observed_at: tr.observed_at,
                },
            );
        }
        if index.newest.is_none_or(|n| tr.observed_at > n) {
            index.newest = Some(tr.observed_at);
        }
        index.purge(false);
        Ok(tr.answers.len())
    }

    /// Finds the host name for `addr`.
    ///
    /// Prefers the latest answer observed at or before `last_activity`;
    /// otherwise takes the latest answer observed at or before `emitted_at`,
    /// which covers responses that arrived while the flow was live.
    #[must_use]
    pub fn resolve(
        &self,
        addr: IpAddr,
        last_activity: DateTime<Utc>,
        emitted_at: DateTime<Utc>,
    ) -> Option<String> {
        let index = self.lock();
        let entries = index.by_addr.get(&addr)?;
        let latest_before = |limit: DateTime<Utc>| {
            entries
                .iter()
                .rev()
                .find(|r| r.observed_at <= limit)
                .map(|r| r.name.to_string())
        };
        latest_before(last_activity).or_else(|| latest_before(emitted_at))
    }

    /// Drops every entry outside the retention window now.
    pub fn purge(&self) {
        self.lock().purge(true);
    }

    /// Number of addresses with at least one resolution.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().by_addr.len()
    }

    /// Whether the index holds no resolutions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
