//! Sensor configuration model.
//!
//! Durations are written as human strings parsed by `humantime`
//! (`"30s"`, `"250ms"`, `"1m30s"`); a bare integer is read as seconds.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::error::{Result, SockauditError};

/// Root configuration for the socket audit sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorConfig {
    /// Idle time after which an open flow is terminated.
    #[serde(with = "duration_str")]
    pub flow_inactive_timeout: Duration,
    /// Idle time after which a socket without flows is forgotten.
    #[serde(with = "duration_str")]
    pub socket_inactive_timeout: Duration,
    /// Grace period a terminated flow waits for late DNS answers.
    #[serde(with = "duration_str")]
    pub flow_termination_timeout: Duration,
    /// Drift between calibration samples that triggers a warning.
    #[serde(with = "duration_str")]
    pub clock_max_drift: Duration,
    /// Period of the clock calibration syscall.
    #[serde(with = "duration_str")]
    pub clock_sync_period: Duration,
    /// Period of the flow/socket expiry sweep.
    #[serde(with = "duration_str")]
    pub reap_interval: Duration,
    /// Upper bound on the process table.
    pub max_processes: usize,
    /// Host identifier used for process entity IDs. Resolved from
    /// `/etc/machine-id` when absent.
    pub host_id: Option<String>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            flow_inactive_timeout: constants::DEFAULT_FLOW_INACTIVE_TIMEOUT,
            socket_inactive_timeout: constants::DEFAULT_SOCKET_INACTIVE_TIMEOUT,
            flow_termination_timeout: constants::DEFAULT_FLOW_TERMINATION_TIMEOUT,
            clock_max_drift: constants::DEFAULT_CLOCK_MAX_DRIFT,
            clock_sync_period: constants::DEFAULT_CLOCK_SYNC_PERIOD,
            reap_interval: constants::DEFAULT_REAP_INTERVAL,
            max_processes: constants::DEFAULT_MAX_PROCESSES,
            host_id: None,
        }
    }
}

impl SensorConfig {
    /// Loads and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, is not valid JSON for
    /// this model, or fails [`SensorConfig::validate`].
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SockauditError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that every duration is positive and at most
    /// [`constants::MAX_TIMEOUT`], and that the process bound is non-zero.
    ///
    /// # Errors
    ///
    /// Returns [`SockauditError::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("flow_inactive_timeout", self.flow_inactive_timeout),
            ("socket_inactive_timeout", self.socket_inactive_timeout),
            ("flow_termination_timeout", self.flow_termination_timeout),
            ("clock_max_drift", self.clock_max_drift),
            ("clock_sync_period", self.clock_sync_period),
            ("reap_interval", self.reap_interval),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(SockauditError::config(format!("{name} must be positive")));
            }
            if value > constants::MAX_TIMEOUT {
                return Err(SockauditError::config(format!(
                    "{name} must not exceed {}",
                    format_duration(constants::MAX_TIMEOUT)
                )));
            }
        }
        if self.max_processes == 0 {
            return Err(SockauditError::config("max_processes must be positive"));
        }
        if self.host_id.as_deref().is_some_and(str::is_empty) {
            return Err(SockauditError::config("host_id must not be empty"));
        }
        Ok(())
    }

    /// Longest time a flow can be held after its last activity. DNS answers
    /// older than this can no longer be attached to any live flow.
    #[must_use]
    pub fn max_flow_retention(&self) -> Duration {
        self.socket_inactive_timeout
            .max(self.flow_inactive_timeout)
            .saturating_add(self.flow_termination_timeout)
    }
}

/// Parses a duration such as `"30s"`, `"250ms"` or `"1m30s"`.
///
/// # Errors
///
/// Returns [`SockauditError::Duration`] when the text is not a duration.
pub fn parse_duration(s: &str) -> Result<Duration> {
    humantime::parse_duration(s.trim()).map_err(|source| SockauditError::Duration {
        input: s.to_string(),
        source,
    })
}

/// Formats a duration the way [`parse_duration`] reads it back.
#[must_use]
pub fn format_duration(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => super::parse_duration(&text).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        SensorConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn parse_duration_accepts_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn parse_duration_accepts_compound_forms() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration(" 2m 5s ").unwrap(), Duration::from_secs(125));
    }

    #[test]
    fn parse_duration_rejects_garbage() {
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("10 parsecs").is_err());
        let err = parse_duration("307445734561825861m").unwrap_err();
        assert!(err.to_string().contains("307445734561825861m"));
    }

    #[test]
    fn format_duration_reads_back() {
        assert_eq!(format_duration(Duration::from_secs(120)), "2m");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1s 500ms");
        let d = Duration::from_secs(3725);
        assert_eq!(parse_duration(&format_duration(d)).unwrap(), d);
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = SensorConfig {
            flow_termination_timeout: Duration::ZERO,
            ..SensorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("flow_termination_timeout"));
    }

    #[test]
    fn load_reads_partial_json_over_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "flow_inactive_timeout": "5s", "clock_max_drift": "20ms", "host_id": "abc" }}"#
        )
        .unwrap();

        let config = SensorConfig::load(file.path()).expect("should load");
        assert_eq!(config.flow_inactive_timeout, Duration::from_secs(5));
        assert_eq!(config.clock_max_drift, Duration::from_millis(20));
        assert_eq!(config.host_id.as_deref(), Some("abc"));
        assert_eq!(
            config.socket_inactive_timeout,
            constants::DEFAULT_SOCKET_INACTIVE_TIMEOUT
        );
    }

    #[test]
    fn load_rejects_unknown_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "flow_timeout": "5s" }}"#).unwrap();
        assert!(SensorConfig::load(file.path()).is_err());
    }

    #[test]
    fn oversized_timeout_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "socket_inactive_timeout": 18446744073709551615 }}"#).unwrap();
        let err = SensorConfig::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("socket_inactive_timeout"), "{err}");
    }

    #[test]
    fn retention_saturates_instead_of_overflowing() {
        let config = SensorConfig {
            socket_inactive_timeout: Duration::MAX,
            ..SensorConfig::default()
        };
        assert_eq!(config.max_flow_retention(), Duration::MAX);
    }

    #[test]
    fn retention_covers_longest_lived_flow() {
        let config = SensorConfig::default();
        assert_eq!(config.max_flow_retention(), Duration::from_secs(65));
    }
}
