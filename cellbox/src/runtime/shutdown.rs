//! Runtime shutdown results.

use cellbox_shared::errors::CellboxError;

use crate::BoxID;

/// How one box fared during runtime shutdown.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Stopped within its grace period.
    Graceful,
    /// Grace period expired; remaining executions were killed.
    Forced,
    /// The stop failed; the box may still hold resources.
    Failed(CellboxError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoxShutdown {
    pub id: BoxID,
    pub outcome: ShutdownOutcome,
}

/// Aggregate result of [`CellboxRuntime::shutdown`](crate::CellboxRuntime::shutdown).
///
/// Holds one entry per box that was running when shutdown began.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub boxes: Vec<BoxShutdown>,
}

impl ShutdownReport {
    pub fn graceful_count(&self) -> usize {
        self.count(|o| matches!(o, ShutdownOutcome::Graceful))
    }

    pub fn forced_count(&self) -> usize {
        self.count(|o| matches!(o, ShutdownOutcome::Forced))
    }

    /// Boxes whose stop failed, with the error.
    pub fn failures(&self) -> impl Iterator<Item = (&BoxID, &CellboxError)> {
        self.boxes.iter().filter_map(|b| match &b.outcome {
            ShutdownOutcome::Failed(e) => Some((&b.id, e)),
            _ => None,
        })
    }

    /// True if no box failed to stop.
    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }

    fn count(&self, pred: impl Fn(&ShutdownOutcome) -> bool) -> usize {
        self.boxes.iter().filter(|b| pred(&b.outcome)).count()
    }
}
