//! Runtime-level metrics (aggregate across all boxes).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

use super::BoxMetrics;

/// Storage for runtime-wide metrics.
///
/// Shared by the runtime and every box it creates.
/// All counters are monotonic (never decrease).
#[derive(Clone, Default, Debug)]
pub struct RuntimeMetricsStorage {
    /// Total boxes created since runtime startup
    pub(crate) boxes_created: Arc<AtomicU64>,
    /// Total start() calls that failed to allocate isolation resources
    pub(crate) boxes_failed: Arc<AtomicU64>,
    /// Total boxes removed from the registry
    pub(crate) boxes_removed: Arc<AtomicU64>,
    /// Total commands executed across all boxes
    pub(crate) total_commands: Arc<AtomicU64>,
    /// Total command execution errors across all boxes
    pub(crate) total_exec_errors: Arc<AtomicU64>,
}

impl RuntimeMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_exec(&self, is_error: bool) {
        self.total_commands.fetch_add(1, Ordering::Relaxed);
        if is_error {
            self.total_exec_errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Snapshot of runtime-wide metrics.
///
/// Monotonic counters come from the runtime itself; the aggregate fields
/// are summed over the boxes registered at the moment of the call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeMetrics {
    boxes_created_total: u64,
    boxes_failed_total: u64,
    boxes_removed_total: u64,
    total_commands_executed: u64,
    total_exec_errors: u64,

    num_boxes: u64,
    num_running_boxes: u64,
    commands_executed: u64,
    exec_errors: u64,
    wall_time: Duration,
    cpu_time: Duration,
}

impl RuntimeMetrics {
    /// Combine the runtime counters with per-box snapshots.
    pub(crate) fn aggregate<'a>(
        storage: &RuntimeMetricsStorage,
        boxes: impl IntoIterator<Item = (bool, &'a BoxMetrics)>,
    ) -> Self {
        let mut metrics = Self {
            boxes_created_total: storage.boxes_created.load(Ordering::Relaxed),
            boxes_failed_total: storage.boxes_failed.load(Ordering::Relaxed),
            boxes_removed_total: storage.boxes_removed.load(Ordering::Relaxed),
            total_commands_executed: storage.total_commands.load(Ordering::Relaxed),
            total_exec_errors: storage.total_exec_errors.load(Ordering::Relaxed),
            ..Default::default()
        };

        for (running, box_metrics) in boxes {
            metrics.num_boxes += 1;
            if running {
                metrics.num_running_boxes += 1;
            }
            metrics.commands_executed += box_metrics.commands_executed_total;
            metrics.exec_errors += box_metrics.exec_errors_total;
            metrics.wall_time += box_metrics.wall_time;
            metrics.cpu_time += box_metrics.cpu_time;
        }

        metrics
    }

    /// Total number of boxes created since runtime startup.
    ///
    /// Incremented when `CellboxRuntime::create()` succeeds.
    /// Never decreases (monotonic counter).
    pub fn boxes_created_total(&self) -> u64 {
        self.boxes_created_total
    }

    /// Total number of start attempts that failed.
    ///
    /// Never decreases (monotonic counter).
    pub fn boxes_failed_total(&self) -> u64 {
        self.boxes_failed_total
    }

    pub fn boxes_removed_total(&self) -> u64 {
        self.boxes_removed_total
    }

    /// Total commands executed across all boxes, including removed ones.
    ///
    /// Never decreases (monotonic counter).
    pub fn total_commands_executed(&self) -> u64 {
        self.total_commands_executed
    }

    /// Total command execution errors across all boxes, including removed ones.
    pub fn total_exec_errors(&self) -> u64 {
        self.total_exec_errors
    }

    /// Number of boxes currently registered.
    pub fn num_boxes(&self) -> u64 {
        self.num_boxes
    }

    /// Number of currently running boxes.
    pub fn num_running_boxes(&self) -> u64 {
        self.num_running_boxes
    }

    /// Executions summed over currently registered boxes.
    pub fn commands_executed(&self) -> u64 {
        self.commands_executed
    }

    /// Execution errors summed over currently registered boxes.
    pub fn exec_errors(&self) -> u64 {
        self.exec_errors
    }

    /// Wall time summed over currently registered boxes.
    pub fn wall_time(&self) -> Duration {
        self.wall_time
    }

    /// CPU time summed over currently registered boxes.
    pub fn cpu_time(&self) -> Duration {
        self.cpu_time
    }
}
