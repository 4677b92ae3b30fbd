//! Single-consumer event dispatch loop.
//!
//! The dispatcher is the only writer of [`FlowState`]. It drains decoded
//! events in kernel order, records loss notifications, and runs expiry on
//! a ticker inside the same task.

use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sockaudit_common::constants::{DETAIL_TARGET, LOST_WHOLE_RING};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::SensorError;
use crate::events::Event;
use crate::state::FlowState;

/// Error delivered by a capture source that can no longer produce events.
pub type CaptureError = Box<dyn Error + Send + Sync>;

/// The three streams produced by a capture source.
pub struct EventChannels {
    /// Decoded events in kernel order.
    pub events: mpsc::Receiver<Box<dyn Event>>,
    /// Terminal capture failures.
    pub errors: mpsc::Receiver<CaptureError>,
    /// Lost-event counts; [`LOST_WHOLE_RING`] means the whole ring.
    pub lost: mpsc::Receiver<u64>,
}

/// Senders paired with [`EventChannels`].
pub struct EventSenders {
    /// Decoded events.
    pub events: mpsc::Sender<Box<dyn Event>>,
    /// Terminal capture failures.
    pub errors: mpsc::Sender<CaptureError>,
    /// Lost-event counts.
    pub lost: mpsc::Sender<u64>,
}

impl EventChannels {
    /// Creates bounded channels with room for `capacity` events.
    #[must_use]
    pub fn bounded(capacity: usize) -> (EventSenders, Self) {
        let (events_tx, events) = mpsc::channel(capacity.max(1));
        let (errors_tx, errors) = mpsc::channel(1);
        let (lost_tx, lost) = mpsc::channel(64);
        (
            EventSenders {
                events: events_tx,
                errors: errors_tx,
                lost: lost_tx,
            },
            Self {
                events,
                errors,
                lost,
            },
        )
    }
}

/// Counters maintained by the dispatcher. Shared so other tasks can read
/// them while the loop runs.
#[derive(Debug, Default)]
pub struct DispatchStats {
    events: AtomicU64,
    dropped: AtomicU64,
    update_errors: AtomicU64,
    whole_ring_losses: AtomicU64,
}

/// Point-in-time copy of [`DispatchStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Events dispatched.
    pub events: u64,
    /// Events reported lost by the capture source.
    pub dropped: u64,
    /// Events whose update was rejected.
    pub update_errors: u64,
    /// Times the whole ring buffer was lost.
    pub whole_ring_losses: u64,
}

impl DispatchStats {
    /// Reads all counters.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events: self.events.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            update_errors: self.update_errors.load(Ordering::Relaxed),
            whole_ring_losses: self.whole_ring_losses.load(Ordering::Relaxed),
        }
    }
}

/// How the dispatcher decides when to run expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepMode {
    /// Expire against the system clock on a fixed period.
    Timer(Duration),
    /// Expire against the latest event time whenever it has advanced by
    /// the period. Used when replaying recorded events.
    EventTime(Duration),
}

/// Why [`Dispatcher::run`] returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The cancellation token fired.
    Cancelled,
    /// The event stream was closed by its producer.
    StreamClosed,
}

/// Drives a [`FlowState`] from a capture source.
pub struct Dispatcher {
    state: FlowState,
    stats: Arc<DispatchStats>,
    sweep: SweepMode,
    last_sweep: Option<DateTime<Utc>>,
}

impl Dispatcher {
    /// Wraps `state`.
    #[must_use]
    pub fn new(state: FlowState, sweep: SweepMode) -> Self {
        Self {
            state,
            stats: Arc::new(DispatchStats::default()),
            sweep,
            last_sweep: None,
        }
    }

    /// Shared handle to the counters.
    #[must_use]
    pub fn stats(&self) -> Arc<DispatchStats> {
        Arc::clone(&self.stats)
    }

    /// The driven state.
    #[must_use]
    pub const fn state(&self) -> &FlowState {
        &self.state
    }

    /// Mutable access to the driven state, for bootstrap and replay.
    pub const fn state_mut(&mut self) -> &mut FlowState {
        &mut self.state
    }

    /// Consumes the dispatcher, returning the state.
    #[must_use]
    pub fn into_state(self) -> FlowState {
        self.state
    }

    /// Applies one event. Update errors are counted and logged under the
    /// detail target; they never stop dispatch.
    pub fn dispatch(&mut self, event: &dyn Event) {
        let _ = self.stats.events.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(target: DETAIL_TARGET, %event);
        if let Err(e) = event.update(&mut self.state) {
            let _ = self.stats.update_errors.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(target: DETAIL_TARGET, error = %e, %event, "error updating state");
        }
        if let SweepMode::EventTime(period) = self.sweep {
            self.sweep_event_time(period);
        }
    }

    fn sweep_event_time(&mut self, period: Duration) {
        let Some(now) = self.state.last_event_time() else {
            return;
        };
        let period = TimeDelta::from_std(period).unwrap_or(TimeDelta::MAX);
        let due = self.last_sweep.is_none_or(|last| now - last >= period);
        if due {
            let _ = self.sweep(now);
        }
    }

    /// Handles a loss notification from the capture source.
    pub fn on_lost(&self, count: u64) {
        if count == LOST_WHOLE_RING {
            let _ = self.stats.whole_ring_losses.fetch_add(1, Ordering::Relaxed);
            tracing::error!("lost the whole ring buffer");
        } else {
            let _ = self.stats.dropped.fetch_add(count, Ordering::Relaxed);
            tracing::warn!(count, "kernel events lost");
        }
    }

    /// Runs expiry as of `now`. Returns the number of flows emitted.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        self.last_sweep = Some(now);
        let emitted = self.state.expire(now);
        if emitted > 0 {
            tracing::debug!(emitted, sockets = self.state.socket_count(), "expired flows");
        }
        emitted
    }

    /// Consumes the capture streams until cancellation, a capture error,
    /// or the end of the event stream.
    ///
    /// Cancellation returns immediately: queued events are not drained and
    /// unexpired flows are not flushed.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Capture`] when the capture source delivers an
    /// error.
    pub async fn run(
        &mut self,
        mut channels: EventChannels,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, SensorError> {
        let mut ticker = match self.sweep {
            SweepMode::Timer(period) => {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(ticker)
            }
            SweepMode::EventTime(_) => None,
        };
        let mut errors_open = true;
        let mut lost_open = true;

        tracing::info!(sweep = ?self.sweep, "dispatcher started");
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    tracing::info!(stats = ?self.stats.snapshot(), "dispatcher cancelled");
                    return Ok(RunOutcome::Cancelled);
                }
                err = channels.errors.recv(), if errors_open => match err {
                    Some(source) => {
                        tracing::error!(error = %source, "capture source failed");
                        return Err(SensorError::Capture { source });
                    }
                    None => errors_open = false,
                },
                lost = channels.lost.recv(), if lost_open => match lost {
                    Some(count) => self.on_lost(count),
                    None => lost_open = false,
                },
                () = tick(ticker.as_mut()) => {
                    let _ = self.sweep(Utc::now());
                }
                event = channels.events.recv() => match event {
                    Some(event) => self.dispatch(event.as_ref()),
                    None => {
                        tracing::info!(stats = ?self.stats.snapshot(), "event stream closed");
                        return Ok(RunOutcome::StreamClosed);
                    }
                },
            }
        }
    }
}

async fn tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            let _ = ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use sockaudit_common::config::SensorConfig;
    use sockaudit_common::types::{SocketId, Transport};

    use super::*;
    use crate::events::{Connected, EventMeta, SocketClosed, TraceEvent, UnameCall};
    use crate::report::NullReporter;

    fn dispatcher(sweep: SweepMode) -> Dispatcher {
        let state = FlowState::new(&SensorConfig::default(), Box::new(NullReporter));
        Dispatcher::new(state, sweep)
    }

    fn close(ts: u64) -> Box<dyn Event> {
        Box::new(SocketClosed {
            meta: EventMeta {
                timestamp: ts,
                pid: 0,
                tid: 0,
            },
            sock: SocketId::new(1),
            reset: false,
        })
    }

    #[test]
    fn update_errors_are_counted_not_fatal() {
        let mut d = dispatcher(SweepMode::Timer(Duration::from_secs(1)));
        d.dispatch(close(1).as_ref());
        d.dispatch(close(2).as_ref());
        let stats = d.stats().snapshot();
        assert_eq!(stats.events, 2);
        assert_eq!(stats.update_errors, 1);
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn every_event_is_described_under_detail_target() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let mut d = dispatcher(SweepMode::Timer(Duration::from_secs(1)));
            d.dispatch(close(7).as_ref());
        });

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let line = logs
            .lines()
            .find(|l| l.contains("TRACE") && l.contains(DETAIL_TARGET))
            .expect("detail trace line");
        assert!(line.contains(&close(7).to_string()), "{line}");
    }

    #[test]
    fn loss_sentinel_is_counted_separately() {
        let d = dispatcher(SweepMode::Timer(Duration::from_secs(1)));
        d.on_lost(12);
        d.on_lost(LOST_WHOLE_RING);
        let stats = d.stats().snapshot();
        assert_eq!(stats.dropped, 12);
        assert_eq!(stats.whole_ring_losses, 1);
    }

    #[test]
    fn event_time_sweeps_follow_the_event_clock() {
        let mut d = dispatcher(SweepMode::EventTime(Duration::from_secs(1)));
        let sync = TraceEvent::Uname(UnameCall {
            meta: EventMeta {
                timestamp: 0,
                pid: 1,
                tid: 1,
            },
            magic: sockaudit_common::constants::CLOCK_SYNC_MAGIC,
            wall_ns: 1_700_000_000_000_000_000,
        });
        d.dispatch(&sync);
        let connect = TraceEvent::Connected(Connected {
            meta: EventMeta {
                timestamp: 1_000_000_000,
                pid: 9,
                tid: 9,
            },
            sock: SocketId::new(7),
            transport: Transport::Tcp,
            local: None,
            remote: "192.0.2.10:80".parse().unwrap(),
        });
        d.dispatch(&connect);
        assert_eq!(d.state().flow_count(), 1);
        // 40s later the flow is idle past 30s and its 5s grace has run out
        d.dispatch(close(41_000_000_000).as_ref());
        assert_eq!(d.state().emitted(), 1);
    }

    #[tokio::test]
    async fn run_ends_when_event_stream_closes() {
        let mut d = dispatcher(SweepMode::Timer(Duration::from_millis(10)));
        let (tx, channels) = EventChannels::bounded(8);
        tx.events.send(close(1)).await.unwrap();
        drop(tx);
        let outcome = d.run(channels, CancellationToken::new()).await.unwrap();
        assert_eq!(outcome, RunOutcome::StreamClosed);
        assert_eq!(d.stats().snapshot().events, 1);
    }

    #[tokio::test]
    async fn capture_error_ends_run() {
        let mut d = dispatcher(SweepMode::Timer(Duration::from_secs(1)));
        let (tx, channels) = EventChannels::bounded(8);
        tx.errors.send("perf ring unavailable".into()).await.unwrap();
        let err = d.run(channels, CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("perf ring unavailable"));
        drop(tx);
    }

    #[tokio::test]
    async fn cancellation_does_not_drain_queue() {
        let mut d = dispatcher(SweepMode::Timer(Duration::from_secs(1)));
        let (tx, channels) = EventChannels::bounded(8);
        tx.events.send(close(1)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = d.run(channels, cancel).await.unwrap();
        assert_eq!(outcome, RunOutcome::Cancelled);
        assert_eq!(d.stats().snapshot().events, 0);
        drop(tx);
    }
}
