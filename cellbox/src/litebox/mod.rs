//! LiteBox - Individual box lifecycle management
//!
//! ## Architecture
//!
//! This module is organized into focused submodules:
//! - `state`: Status enum and the transition table
//! - `config`: Creation-time configuration
//! - `box_impl`: Lifecycle transitions and the live isolation session
//! - `exec`: Command execution

mod box_impl;
mod config;
mod exec;
mod state;

pub use box_impl::StopOutcome;
pub use exec::{BoxCommand, ExecChunk, ExecOutput, Execution, ExecutionId, OUTPUT_QUEUE_CAPACITY};
pub use state::{BoxState, BoxStatus};

pub(crate) use box_impl::{BoxContext, BoxImpl, SharedBoxImpl};
pub(crate) use config::BoxConfig;

use crate::metrics::BoxMetrics;
use crate::runtime::options::StopTimeout;
use crate::{BoxID, BoxInfo};
use cellbox_shared::errors::CellboxResult;

/// Handle to a registered box.
///
/// Cheap to clone; every clone refers to the same box. A handle outlives
/// the registry entry: after the box is removed, lifecycle and execution
/// calls fail with `NotFound`.
#[derive(Clone)]
pub struct BoxHandle {
    inner: SharedBoxImpl,
}

impl BoxHandle {
    pub(crate) fn new(inner: SharedBoxImpl) -> Self {
        Self { inner }
    }

    /// Get the unique identifier for this box.
    pub fn id(&self) -> &BoxID {
        self.inner.id()
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    /// Get current information about this box.
    pub fn info(&self) -> BoxInfo {
        self.inner.info()
    }

    pub fn status(&self) -> BoxStatus {
        self.inner.status()
    }

    /// Allocate isolation resources and move to `Running`.
    ///
    /// Valid from `Created` or `Stopped`. On allocation failure the box
    /// keeps its previous status and the start can be retried.
    pub async fn start(&self) -> CellboxResult<()> {
        self.inner.start().await
    }

    /// Stop the box, terminating in-flight executions.
    ///
    /// Accepts a [`StopTimeout`], a [`std::time::Duration`], or seconds as
    /// `i32` (0 = default grace period, negative = wait indefinitely).
    /// Stopping an already stopped box is a no-op.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # async fn example(handle: &cellbox::BoxHandle) -> Result<(), Box<dyn std::error::Error>> {
    /// use std::time::Duration;
    ///
    /// handle.stop(Duration::from_secs(5)).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn stop(&self, timeout: impl Into<StopTimeout>) -> CellboxResult<StopOutcome> {
        self.inner.stop(timeout.into()).await
    }

    /// Execute a command and return a streaming [`Execution`].
    ///
    /// Fails with `InvalidState` unless the box is `Running`. A command that
    /// cannot be started still yields an execution, ending with the
    /// `SPAWN_FAILED` exit code.
    pub async fn exec(&self, command: BoxCommand) -> CellboxResult<Execution> {
        self.inner.exec(command).await
    }

    /// Execute a command and buffer its output.
    pub async fn run(&self, command: BoxCommand) -> CellboxResult<ExecOutput> {
        self.exec(command).await?.output().await
    }

    /// Snapshot of this box's metrics.
    ///
    /// All counters are monotonic and survive restarts of the box.
    pub fn metrics(&self) -> BoxMetrics {
        self.inner.metrics()
    }
}

impl std::fmt::Debug for BoxHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxHandle")
            .field("id", self.id())
            .field("name", &self.name())
            .finish()
    }
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<BoxHandle>;
};
