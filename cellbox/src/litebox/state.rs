//! Box lifecycle status and state machine.
//!
//! Defines the possible states of a box and valid transitions between them.

use cellbox_shared::errors::{CellboxError, CellboxResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a box.
///
/// State machine:
/// ```text
/// create() → Created  (registered, no isolation resources)
/// start()  → Running  (isolation resources allocated)
/// stop()   → Stopped  (resources released, bookkeeping kept, can restart)
/// remove() → entry erased from the registry (not a stored state)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxStatus {
    /// Box is registered but has never been started.
    Created,

    /// Box holds isolation resources and accepts executions.
    Running,

    /// Box released its isolation resources. It can be restarted.
    Stopped,
}

impl BoxStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, BoxStatus::Running)
    }

    /// Check if start() can be called from this state.
    /// Created boxes need first start, Stopped boxes can restart.
    pub fn can_start(&self) -> bool {
        matches!(self, BoxStatus::Created | BoxStatus::Stopped)
    }

    /// Only running boxes can be stopped.
    pub fn can_stop(&self) -> bool {
        matches!(self, BoxStatus::Running)
    }

    /// Only stopped boxes can be removed without force.
    pub fn can_remove(&self) -> bool {
        matches!(self, BoxStatus::Stopped)
    }

    pub fn can_exec(&self) -> bool {
        matches!(self, BoxStatus::Running)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: BoxStatus) -> bool {
        use BoxStatus::*;
        matches!(
            (self, target),
            (Created, Running) | (Stopped, Running) | (Running, Stopped)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BoxStatus::Created => "created",
            BoxStatus::Running => "running",
            BoxStatus::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for BoxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Dynamic box state (changes during lifecycle).
///
/// State transitions are validated before applying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoxState {
    /// Current lifecycle status.
    pub status: BoxStatus,
    pub created_at: DateTime<Utc>,
    /// Last state change timestamp (UTC).
    pub last_updated: DateTime<Utc>,
}

impl BoxState {
    /// Create initial state for a new box.
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            status: BoxStatus::Created,
            created_at: now,
            last_updated: now,
        }
    }

    /// Attempt state transition with validation.
    ///
    /// Returns error if the transition is not valid.
    pub fn transition_to(&mut self, new_status: BoxStatus) -> CellboxResult<()> {
        if !self.status.can_transition_to(new_status) {
            return Err(CellboxError::InvalidState(format!(
                "Cannot transition from {} to {}",
                self.status, new_status
            )));
        }

        self.status = new_status;
        self.last_updated = Utc::now();
        Ok(())
    }
}

impl Default for BoxState {
    fn default() -> Self {
        Self::new()
    }
}
