//! In-crate test doubles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cellbox_shared::errors::CellboxResult;
use tokio::sync::mpsc;

use crate::images::RootfsHandle;
use crate::isolation::{
    IsolationBackend, IsolationHandle, ProcessEvent, ProcessExit, ProcessHandle, ResourceLimits,
};
use crate::litebox::{BoxCommand, BoxContext};
use crate::metrics::RuntimeMetricsStorage;
use crate::runtime::options::ContentionPolicy;

/// Backend whose commands echo their arguments and exit immediately.
#[derive(Debug, Default)]
pub(crate) struct StubBackend;

#[async_trait]
impl IsolationBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn allocate(
        &self,
        rootfs: &RootfsHandle,
        limits: ResourceLimits,
    ) -> CellboxResult<IsolationHandle> {
        Ok(IsolationHandle::new(rootfs.clone(), limits))
    }

    async fn spawn(
        &self,
        _handle: &IsolationHandle,
        command: &BoxCommand,
    ) -> CellboxResult<ProcessHandle> {
        let (tx, rx) = mpsc::channel(4);
        let line = format!("{}\n", command.arguments().join(" "));
        tx.send(ProcessEvent::Stdout(line.into_bytes())).await.ok();
        tx.send(ProcessEvent::Exited(ProcessExit {
            code: 0,
            cpu_time: None,
        }))
        .await
        .ok();
        Ok(ProcessHandle {
            pid: None,
            events: rx,
        })
    }

    async fn terminate(&self, _handle: &IsolationHandle, _graceful: bool) -> CellboxResult<()> {
        Ok(())
    }

    async fn release(&self, _handle: &IsolationHandle) -> CellboxResult<()> {
        Ok(())
    }
}

pub(crate) fn stub_context() -> Arc<BoxContext> {
    Arc::new(BoxContext::new(
        Arc::new(StubBackend),
        Duration::from_millis(200),
        ContentionPolicy::Wait,
        RuntimeMetricsStorage::new(),
    ))
}
