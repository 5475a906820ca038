//! Per-box metrics (individual box statistics).

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Marker stored in `last_exit_code` until the first execution finishes.
const NO_EXIT_CODE: i64 = i64::MAX;

/// Storage for per-box metrics.
///
/// Owned by each box, shared with its in-flight executions.
/// All counters are monotonic (never decrease).
#[derive(Debug)]
pub struct BoxMetricsStorage {
    /// Commands executed on this box
    pub(crate) commands_executed: AtomicU64,
    /// Commands that could not be started
    pub(crate) exec_errors: AtomicU64,
    /// Bytes received on standard output
    pub(crate) stdout_bytes: AtomicU64,
    /// Bytes received on standard error
    pub(crate) stderr_bytes: AtomicU64,
    /// Cumulative wall time of finished executions (microseconds)
    pub(crate) wall_time_us: AtomicU64,
    /// Cumulative CPU time reported by the backend (microseconds)
    pub(crate) cpu_time_us: AtomicU64,
    pub(crate) last_exit_code: AtomicI64,
    /// Successful start() calls
    pub(crate) starts: AtomicU64,
}

impl Default for BoxMetricsStorage {
    fn default() -> Self {
        Self {
            commands_executed: AtomicU64::new(0),
            exec_errors: AtomicU64::new(0),
            stdout_bytes: AtomicU64::new(0),
            stderr_bytes: AtomicU64::new(0),
            wall_time_us: AtomicU64::new(0),
            cpu_time_us: AtomicU64::new(0),
            last_exit_code: AtomicI64::new(NO_EXIT_CODE),
            starts: AtomicU64::new(0),
        }
    }
}

impl BoxMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn increment_commands_executed(&self) {
        self.commands_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_exec_errors(&self) {
        self.exec_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn increment_starts(&self) {
        self.starts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_stdout_bytes(&self, bytes: u64) {
        self.stdout_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_stderr_bytes(&self, bytes: u64) {
        self.stderr_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a finished execution.
    pub(crate) fn record_completion(
        &self,
        exit_code: i32,
        wall: Duration,
        cpu: Option<Duration>,
    ) {
        self.wall_time_us
            .fetch_add(duration_us(wall), Ordering::Relaxed);
        if let Some(cpu) = cpu {
            self.cpu_time_us.fetch_add(duration_us(cpu), Ordering::Relaxed);
        }
        self.last_exit_code
            .store(i64::from(exit_code), Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot.
    pub fn snapshot(&self) -> BoxMetrics {
        let last = self.last_exit_code.load(Ordering::Relaxed);
        BoxMetrics {
            commands_executed_total: self.commands_executed.load(Ordering::Relaxed),
            exec_errors_total: self.exec_errors.load(Ordering::Relaxed),
            stdout_bytes_total: self.stdout_bytes.load(Ordering::Relaxed),
            stderr_bytes_total: self.stderr_bytes.load(Ordering::Relaxed),
            wall_time: Duration::from_micros(self.wall_time_us.load(Ordering::Relaxed)),
            cpu_time: Duration::from_micros(self.cpu_time_us.load(Ordering::Relaxed)),
            last_exit_code: (last != NO_EXIT_CODE).then_some(last as i32),
            starts_total: self.starts.load(Ordering::Relaxed),
        }
    }
}

fn duration_us(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

/// Snapshot of per-box metrics at query time.
///
/// All counters are monotonic and never reset.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BoxMetrics {
    pub commands_executed_total: u64,
    pub exec_errors_total: u64,
    pub stdout_bytes_total: u64,
    pub stderr_bytes_total: u64,
    pub wall_time: Duration,
    pub cpu_time: Duration,
    pub last_exit_code: Option<i32>,
    pub starts_total: u64,
}

impl BoxMetrics {
    /// Total commands executed on this box.
    ///
    /// Incremented on every `exec()` call, including ones that fail to spawn.
    /// Never decreases (monotonic counter).
    pub fn commands_executed_total(&self) -> u64 {
        self.commands_executed_total
    }

    /// Total commands that could not be started.
    ///
    /// Never decreases (monotonic counter).
    pub fn exec_errors_total(&self) -> u64 {
        self.exec_errors_total
    }

    /// Total bytes received from standard output and standard error.
    pub fn bytes_received_total(&self) -> u64 {
        self.stdout_bytes_total + self.stderr_bytes_total
    }

    /// Cumulative wall time of executions that ran to completion.
    pub fn wall_time(&self) -> Duration {
        self.wall_time
    }

    /// Cumulative CPU time, when the isolation backend reports it.
    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }

    /// Exit code of the most recently finished execution.
    ///
    /// Returns None if no execution has finished yet.
    pub fn last_exit_code(&self) -> Option<i32> {
        self.last_exit_code
    }

    pub fn starts_total(&self) -> u64 {
        self.starts_total
    }
}
