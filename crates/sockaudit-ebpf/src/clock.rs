//! Kernel trace clock to wall-clock translation.
//!
//! Trace events are stamped with the kernel's monotonic trace clock. The
//! clock synchronizer periodically injects a calibration sample pairing a
//! kernel timestamp with the wall-clock time at which the syscall was
//! issued. The two most recent samples are kept: timestamps between them
//! are interpolated, later ones are extrapolated from the newest sample.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// A paired kernel-clock / wall-clock observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Calibration {
    /// Kernel trace clock value in nanoseconds.
    pub kernel_ns: u64,
    /// Wall-clock time observed at `kernel_ns`.
    pub wall: DateTime<Utc>,
}

/// Translation state built from calibration samples.
#[derive(Debug, Clone)]
pub struct KernelClock {
    previous: Option<Calibration>,
    current: Option<Calibration>,
    estimated: bool,
    max_drift: Duration,
    drift_warnings: u64,
}

impl KernelClock {
    /// Creates an uncalibrated clock.
    #[must_use]
    pub const fn new(max_drift: Duration) -> Self {
        Self {
            previous: None,
            current: None,
            estimated: false,
            max_drift,
            drift_warnings: 0,
        }
    }

    /// Whether a real calibration sample has been applied.
    #[must_use]
    pub const fn is_calibrated(&self) -> bool {
        self.current.is_some() && !self.estimated
    }

    /// Number of samples that exceeded the drift limit so far.
    #[must_use]
    pub const fn drift_warnings(&self) -> u64 {
        self.drift_warnings
    }

    /// Most recent calibration, real or estimated.
    #[must_use]
    pub const fn current(&self) -> Option<Calibration> {
        self.current
    }

    /// Seeds a provisional mapping until the first real sample arrives.
    ///
    /// Has no effect once any calibration exists.
    pub fn estimate(&mut self, kernel_ns: u64, wall: DateTime<Utc>) {
        if self.current.is_none() {
            tracing::debug!(kernel_ns, %wall, "no clock calibration yet, estimating from receive time");
            self.current = Some(Calibration { kernel_ns, wall });
            self.estimated = true;
        }
    }

    /// Applies a calibration sample. The new sample always replaces the
    /// current mapping.
    ///
    /// Returns the drift when it exceeded the configured maximum, in which
    /// case exactly one warning has been logged for this sample.
    pub fn calibrate(&mut self, kernel_ns: u64, wall: DateTime<Utc>) -> Option<Duration> {
        let sample = Calibration { kernel_ns, wall };
        let mut exceeded = None;

        match self.current {
            Some(cur) if !self.estimated => {
                if let Some(extrapolated) = shift(cur.wall, i128::from(kernel_ns) - i128::from(cur.kernel_ns)) {
                    let drift = (extrapolated - wall).abs().to_std().unwrap_or(Duration::MAX);
                    if drift > self.max_drift {
                        self.drift_warnings += 1;
                        tracing::warn!(
                            drift_ms = drift.as_millis(),
                            max_drift_ms = self.max_drift.as_millis(),
                            "kernel clock drift exceeds the configured maximum"
                        );
                        exceeded = Some(drift);
                    }
                }
                self.previous = (kernel_ns > cur.kernel_ns).then_some(cur);
            }
            _ => self.previous = None,
        }

        self.current = Some(sample);
        self.estimated = false;
        exceeded
    }

    /// Translates a kernel timestamp to wall-clock time.
    ///
    /// Returns `None` only while no calibration, real or estimated, exists.
    #[must_use]
    pub fn to_wall(&self, kernel_ns: u64) -> Option<DateTime<Utc>> {
        let cur = self.current?;
        if kernel_ns >= cur.kernel_ns {
            return shift(cur.wall, i128::from(kernel_ns - cur.kernel_ns));
        }
        let Some(prev) = self.previous else {
            return shift(cur.wall, -i128::from(cur.kernel_ns - kernel_ns));
        };
        if kernel_ns < prev.kernel_ns {
            return shift(prev.wall, -i128::from(prev.kernel_ns - kernel_ns));
        }
        let span_k = i128::from(cur.kernel_ns - prev.kernel_ns);
        let span_w = i128::from((cur.wall - prev.wall).num_nanoseconds().unwrap_or(0));
        let elapsed = i128::from(kernel_ns - prev.kernel_ns);
        shift(prev.wall, span_w * elapsed / span_k)
    }
}

fn shift(base: DateTime<Utc>, nanos: i128) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::nanoseconds(i64::try_from(nanos).ok()?);
    base.checked_add_signed(delta)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    const SEC: u64 = 1_000_000_000;

    #[test]
    fn uncalibrated_clock_translates_nothing() {
        let clock = KernelClock::new(Duration::from_millis(100));
        assert!(clock.to_wall(42).is_none());
        assert!(!clock.is_calibrated());
    }

    #[test]
    fn single_sample_offsets_both_directions() {
        let mut clock = KernelClock::new(Duration::from_millis(100));
        assert!(clock.calibrate(10 * SEC, at(0)).is_none());
        assert_eq!(clock.to_wall(12 * SEC), Some(at(2)));
        assert_eq!(clock.to_wall(7 * SEC), Some(at(-3)));
    }

    #[test]
    fn interpolation_stays_between_samples() {
        let mut clock = KernelClock::new(Duration::from_secs(60));
        let _ = clock.calibrate(10 * SEC, at(0));
        // wall advanced 12s while the kernel clock advanced 10s
        let _ = clock.calibrate(20 * SEC, at(12));
        for k in (10 * SEC..=20 * SEC).step_by(250_000_000) {
            let w = clock.to_wall(k).unwrap();
            assert!(w >= at(0) && w <= at(12), "{k} -> {w}");
        }
        assert_eq!(clock.to_wall(15 * SEC), Some(at(6)));
        assert_eq!(clock.to_wall(20 * SEC), Some(at(12)));
    }

    #[test]
    fn interpolation_is_monotonic() {
        let mut clock = KernelClock::new(Duration::from_secs(60));
        let _ = clock.calibrate(SEC, at(0));
        let _ = clock.calibrate(3 * SEC, at(1));
        let mut last = clock.to_wall(0).unwrap();
        for k in (0..5 * SEC).step_by(100_000_000) {
            let w = clock.to_wall(k).unwrap();
            assert!(w >= last);
            last = w;
        }
    }

    #[test]
    fn drift_beyond_limit_warns_once_per_sample() {
        let mut clock = KernelClock::new(Duration::from_millis(100));
        let _ = clock.calibrate(0, at(0));
        assert!(clock.calibrate(10 * SEC, at(10)).is_none());
        let drift = clock.calibrate(20 * SEC, at(21)).expect("1s drift must be reported");
        assert_eq!(drift, Duration::from_secs(1));
        assert_eq!(clock.drift_warnings(), 1);
        assert!(clock.calibrate(30 * SEC, at(31)).is_none());
        assert_eq!(clock.drift_warnings(), 1);
    }

    #[test]
    fn new_sample_wins_even_with_drift() {
        let mut clock = KernelClock::new(Duration::from_millis(1));
        let _ = clock.calibrate(0, at(0));
        let _ = clock.calibrate(10 * SEC, at(100));
        assert_eq!(clock.to_wall(11 * SEC), Some(at(101)));
    }

    #[test]
    fn estimate_is_replaced_without_drift_warning() {
        let mut clock = KernelClock::new(Duration::from_millis(1));
        clock.estimate(5 * SEC, at(0));
        assert!(!clock.is_calibrated());
        assert_eq!(clock.to_wall(6 * SEC), Some(at(1)));
        assert!(clock.calibrate(6 * SEC, at(50)).is_none());
        assert!(clock.is_calibrated());
        assert_eq!(clock.drift_warnings(), 0);
        clock.estimate(0, at(0));
        assert_eq!(clock.to_wall(6 * SEC), Some(at(50)));
    }
}
