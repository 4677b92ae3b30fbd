//! Sensor lifecycle: wires the capture streams, DNS source and clock
//! synchronizer to one dispatcher.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use sockaudit_common::config::SensorConfig;
use sockaudit_common::constants::{DETAIL_TARGET, MACHINE_ID_PATH};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::resolve_host_id;
use crate::clock_sync::{ClockSynchronizer, SyncTrigger};
use crate::dispatch::{Dispatcher, EventChannels, RunOutcome, StatsSnapshot, SweepMode};
use crate::dns::{DnsCorrelator, DnsTransaction};
use crate::error::SensorError;
use crate::process::Process;
use crate::report::Reporter;
use crate::state::FlowState;

/// Everything a run consumes besides configuration.
pub struct SensorInputs {
    /// Capture source streams.
    pub channels: EventChannels,
    /// Completed DNS transactions from a sniffer, if one is running.
    pub dns: Option<mpsc::Receiver<DnsTransaction>>,
    /// Processes discovered before the kernel hooks were attached.
    pub processes: Vec<Process>,
    /// Calibration trigger; `None` leaves the clock estimated.
    pub clock_sync: Option<Box<dyn SyncTrigger>>,
}

/// Result of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Why the run ended.
    #[serde(skip)]
    pub outcome: RunOutcome,
    /// Dispatcher counters at exit.
    pub stats: StatsSnapshot,
    /// Flows handed to the reporter.
    pub emitted: u64,
    /// Flows discarded unexpired at exit.
    pub discarded: usize,
}

/// A configured socket audit sensor.
#[derive(Debug)]
pub struct Sensor {
    config: SensorConfig,
}

impl Sensor {
    /// Validates `config` and creates a sensor.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Config`] if the configuration is invalid.
    pub fn new(config: SensorConfig) -> Result<Self, SensorError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns `previous` when it was built from an identical configuration,
    /// otherwise a new sensor.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Config`] if a new sensor is needed and the
    /// configuration is invalid.
    pub fn reuse_or_new(
        previous: Option<Arc<Self>>,
        config: SensorConfig,
    ) -> Result<Arc<Self>, SensorError> {
        if let Some(prev) = previous.filter(|p| p.config == config) {
            tracing::debug!("configuration unchanged, reusing sensor");
            return Ok(prev);
        }
        Ok(Arc::new(Self::new(config)?))
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Configured host identifier, or the one discovered on this machine.
    #[must_use]
    pub fn host_id(&self) -> Option<String> {
        self.config
            .host_id
            .clone()
            .or_else(|| resolve_host_id(Path::new(MACHINE_ID_PATH)))
    }

    /// Runs until cancellation, capture failure, or the end of the event
    /// stream. Unexpired flows are discarded on exit.
    ///
    /// # Errors
    ///
    /// Returns [`SensorError::Capture`] if the capture source fails.
    pub async fn run(
        &self,
        inputs: SensorInputs,
        reporter: Box<dyn Reporter>,
        cancel: CancellationToken,
    ) -> Result<RunSummary, SensorError> {
        let dns = DnsCorrelator::new(self.config.max_flow_retention());
        let mut state = FlowState::with_dns(&self.config, reporter, dns.clone());
        match self.host_id() {
            Some(host) => state.set_host_id(host),
            None => tracing::warn!("no host identifier, entity IDs disabled"),
        }
        for process in inputs.processes {
            let _ = state.create_process(process);
        }

        let tasks = cancel.child_token();
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        if let Some(rx) = inputs.dns {
            handles.push(tokio::spawn(consume_dns(rx, dns, tasks.clone())));
        }
        if let Some(trigger) = inputs.clock_sync {
            let sync = ClockSynchronizer::new(trigger, self.config.clock_sync_period);
            handles.push(tokio::spawn(sync.run(tasks.clone())));
        }

        let mut dispatcher = Dispatcher::new(state, SweepMode::Timer(self.config.reap_interval));
        let stats = dispatcher.stats();
        let result = dispatcher.run(inputs.channels, cancel).await;

        tasks.cancel();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "sensor task ended abnormally");
            }
        }

        let outcome = result?;
        let state = dispatcher.into_state();
        let summary = RunSummary {
            outcome,
            stats: stats.snapshot(),
            emitted: state.emitted(),
            discarded: state.flow_count(),
        };
        tracing::info!(?outcome, emitted = summary.emitted, discarded = summary.discarded, "sensor stopped");
        Ok(summary)
    }
}

async fn consume_dns(
    mut rx: mpsc::Receiver<DnsTransaction>,
    dns: DnsCorrelator,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            tr = rx.recv() => match tr {
                Some(tr) => {
                    if let Err(e) = dns.on_transaction(&tr) {
                        tracing::debug!(target: DETAIL_TARGET, error = %e, "discarding DNS transaction");
                    }
                }
                None => {
                    tracing::info!("DNS source closed");
                    break;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::time::Duration;

    use super::*;
    use crate::report::NullReporter;

    fn config() -> SensorConfig {
        SensorConfig {
            host_id: Some("host-1".into()),
            ..SensorConfig::default()
        }
    }

    #[test]
    fn identical_config_reuses_instance() {
        let first = Sensor::reuse_or_new(None, config()).unwrap();
        let again = Sensor::reuse_or_new(Some(Arc::clone(&first)), config()).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let changed = SensorConfig {
            flow_inactive_timeout: Duration::from_secs(5),
            ..config()
        };
        let fresh = Sensor::reuse_or_new(Some(Arc::clone(&first)), changed).unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = SensorConfig {
            reap_interval: Duration::ZERO,
            ..config()
        };
        assert!(matches!(Sensor::new(bad), Err(SensorError::Config(_))));
    }

    #[tokio::test]
    async fn run_stops_on_cancel_and_joins_tasks() {
        let sensor = Sensor::new(config()).unwrap();
        let (senders, channels) = EventChannels::bounded(4);
        let (_dns_tx, dns_rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let inputs = SensorInputs {
            channels,
            dns: Some(dns_rx),
            processes: vec![Process::new(1).with_name("init")],
            clock_sync: None,
        };
        let stopper = cancel.clone();
        let run = tokio::spawn(async move { sensor.run(inputs, Box::new(NullReporter), cancel).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stopper.cancel();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.outcome, RunOutcome::Cancelled);
        assert_eq!(summary.emitted, 0);
        drop(senders);
    }
}
