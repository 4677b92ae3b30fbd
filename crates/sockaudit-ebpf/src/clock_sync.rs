//! Periodic kernel clock calibration.
//!
//! The synchronizer never touches engine state. It issues a `uname(2)` call
//! whose buffer is prefixed with a marker and the current wall-clock time;
//! the kernel hook on that syscall turns it into an ordinary event carrying the
//! kernel timestamp, and the dispatcher applies it like any other.

use std::io;
use std::time::Duration;

use chrono::Utc;
use sockaudit_common::constants::CLOCK_SYNC_MAGIC;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Something that makes a calibration sample appear in the event stream.
pub trait SyncTrigger: Send + 'static {
    /// Issues one calibration call.
    ///
    /// # Errors
    ///
    /// Returns the OS error if the call fails.
    fn trigger(&self) -> io::Result<()>;
}

/// Triggers calibration through `uname(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnameTrigger;

/// Builds the 16-byte calibration prefix: marker then wall-clock Unix
/// nanoseconds, both native endian.
#[must_use]
pub fn sync_prefix(wall_ns: u64) -> [u8; 16] {
    let mut prefix = [0u8; 16];
    prefix[..8].copy_from_slice(&CLOCK_SYNC_MAGIC.to_ne_bytes());
    prefix[8..].copy_from_slice(&wall_ns.to_ne_bytes());
    prefix
}

impl SyncTrigger for UnameTrigger {
    #[allow(unsafe_code)]
    fn trigger(&self) -> io::Result<()> {
        let wall_ns = Utc::now()
            .timestamp_nanos_opt()
            .and_then(|ns| u64::try_from(ns).ok())
            .ok_or_else(|| io::Error::other("system clock out of range"))?;
        let prefix = sync_prefix(wall_ns);

        // SAFETY: utsname is plain old data, so the all-zero pattern is
        // valid; the kernel writes at most size_of::<utsname>() bytes into
        // the pointer we pass.
        let mut buf: libc::utsname = unsafe { std::mem::zeroed() };
        for (dst, src) in buf.sysname.iter_mut().zip(prefix) {
            *dst = libc::c_char::from_ne_bytes([src]);
        }
        // SAFETY: `buf` is a live, writable utsname.
        let rc = unsafe { libc::uname(&raw mut buf) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Fires a [`SyncTrigger`] at startup and then periodically.
pub struct ClockSynchronizer {
    trigger: Box<dyn SyncTrigger>,
    period: Duration,
}

impl ClockSynchronizer {
    /// Creates a synchronizer firing every `period`.
    #[must_use]
    pub fn new(trigger: Box<dyn SyncTrigger>, period: Duration) -> Self {
        Self { trigger, period }
    }

    /// Runs until `cancel` fires. Failed calls are logged and retried on
    /// the next period.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::debug!(period_ms = self.period.as_millis(), "clock synchronizer started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.trigger.trigger() {
                        tracing::warn!(error = %e, "clock sync call failed");
                    }
                }
            }
        }
        tracing::debug!("clock synchronizer stopped");
    }
}
