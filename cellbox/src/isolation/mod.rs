//! Isolation backend abstraction.
//!
//! A backend turns a resolved rootfs plus resource limits into an isolated
//! environment, runs processes inside it, and tears it down again. The box
//! lifecycle drives a backend exclusively through [`IsolationBackend`].

#[cfg(unix)]
mod process;
#[cfg(unix)]
mod rlimit;

#[cfg(unix)]
pub use process::ProcessBackend;

use std::time::Duration;

use async_trait::async_trait;
use cellbox_shared::errors::CellboxResult;
use tokio::sync::mpsc;

use crate::images::RootfsHandle;
use crate::litebox::BoxCommand;

/// Resources requested for one box.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpus: u8,
    pub memory_mib: u32,
}

impl ResourceLimits {
    pub fn memory_bytes(&self) -> u64 {
        u64::from(self.memory_mib) * 1024 * 1024
    }
}

/// Handle to allocated isolation resources.
///
/// Owned by exactly one running box. Cloning the handle does not duplicate
/// the underlying resources.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IsolationHandle {
    id: String,
    rootfs: RootfsHandle,
    limits: ResourceLimits,
}

impl IsolationHandle {
    pub fn new(rootfs: RootfsHandle, limits: ResourceLimits) -> Self {
        Self {
            id: ulid::Ulid::new().to_string(),
            rootfs,
            limits,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn rootfs(&self) -> &RootfsHandle {
        &self.rootfs
    }

    pub fn limits(&self) -> ResourceLimits {
        self.limits
    }
}

/// Exit status of a process spawned inside an isolation handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code; negative signal number if terminated by a signal.
    pub code: i32,
    /// User plus system CPU time, when the backend can measure it.
    pub cpu_time: Option<Duration>,
}

/// Incremental output of a spawned process.
///
/// `Exited` is always the last event on a process channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Exited(ProcessExit),
}

/// A spawned process and its event channel.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
    pub events: mpsc::Receiver<ProcessEvent>,
}

/// OS-level sandboxing primitives consumed by the box lifecycle.
///
/// # Contract
///
/// - `allocate` fails with `CellboxError::Engine` on resource exhaustion or
///   unsupported configuration.
/// - `spawn` fails with `CellboxError::Execution` when the command cannot be
///   started; output is delivered incrementally on the returned channel.
/// - `terminate` signals every process running in the handle, asking for a
///   voluntary exit when `graceful` is set and killing them otherwise.
/// - `release` frees the resources; releasing an unknown handle is an error.
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    async fn allocate(
        &self,
        rootfs: &RootfsHandle,
        limits: ResourceLimits,
    ) -> CellboxResult<IsolationHandle>;

    async fn spawn(
        &self,
        handle: &IsolationHandle,
        command: &BoxCommand,
    ) -> CellboxResult<ProcessHandle>;

    async fn terminate(&self, handle: &IsolationHandle, graceful: bool) -> CellboxResult<()>;

    async fn release(&self, handle: &IsolationHandle) -> CellboxResult<()>;
}
