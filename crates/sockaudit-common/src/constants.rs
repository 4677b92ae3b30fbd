//! System-wide constants and default values.

use std::time::Duration;

/// Magic marker written into the first 8 bytes of the `uname(2)` buffer by
/// the clock synchronizer. Events whose payload starts with it are
/// calibration samples rather than genuine `uname` calls.
pub const CLOCK_SYNC_MAGIC: u64 = 0x42DE_ADBE_EFAB_CDEF;

/// Loss notification value meaning the whole ring buffer was overwritten.
pub const LOST_WHOLE_RING: u64 = u64::MAX;

/// Default time a flow may stay idle before it is considered finished.
pub const DEFAULT_FLOW_INACTIVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time a socket without flows may stay idle before it is dropped.
pub const DEFAULT_SOCKET_INACTIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default grace period between termination and emission of a flow.
pub const DEFAULT_FLOW_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Default maximum tolerated drift between two clock calibration samples.
pub const DEFAULT_CLOCK_MAX_DRIFT: Duration = Duration::from_millis(100);

/// Default period between clock calibration syscalls.
pub const DEFAULT_CLOCK_SYNC_PERIOD: Duration = Duration::from_secs(10);

/// Default period of the expiry sweep run by the dispatcher.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Longest accepted value for any configured timeout or period.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(7 * 24 * 3600);

/// Default upper bound on tracked processes.
pub const DEFAULT_MAX_PROCESSES: usize = 16_384;

/// Length of the kernel `comm` field; names this long may be truncated.
pub const TASK_COMM_LEN: usize = 16;

/// Number of leading SHA-256 bytes kept for a process entity ID.
pub const ENTITY_ID_BYTES: usize = 12;

/// `tracing` target for per-event diagnostics.
pub const DETAIL_TARGET: &str = "sockaudit::detail";

/// Application name used in CLI output.
pub const APP_NAME: &str = "sockaudit";

/// Path of the machine identifier used as the default host ID.
pub const MACHINE_ID_PATH: &str = "/etc/machine-id";
