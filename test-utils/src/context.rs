use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tempfile::TempDir;

use cellbox::{BoxHandle, BoxOptions, CellboxOptions, CellboxRuntime, ExecChunk, Execution};
use cellbox_shared::errors::CellboxResult;

use crate::{FakeBackend, FakeResolver};

/// Grace period used by test runtimes, short enough to keep forced stops fast.
pub const TEST_GRACE_PERIOD: Duration = Duration::from_millis(300);

/// Test context with isolated runtime and automatic cleanup.
pub struct TestContext {
    pub runtime: CellboxRuntime,
    pub backend: FakeBackend,
    pub resolver: FakeResolver,
    _temp_dir: TempDir, // Dropped after test
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_options(|_| {})
    }

    /// Build a context after adjusting the runtime options.
    pub fn with_options(configure: impl FnOnce(&mut CellboxOptions)) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let mut options = CellboxOptions::with_home(temp_dir.path());
        options.default_grace_period = TEST_GRACE_PERIOD;
        configure(&mut options);

        let backend = FakeBackend::new();
        let resolver = FakeResolver::new();
        let runtime = CellboxRuntime::with_backends(
            options,
            Arc::new(resolver.clone()),
            Arc::new(backend.clone()),
        )
        .expect("Failed to create runtime");

        Self {
            runtime,
            backend,
            resolver,
            _temp_dir: temp_dir,
        }
    }

    pub fn home(&self) -> &Path {
        self._temp_dir.path()
    }

    /// Create and start a box.
    pub async fn running_box(&self, options: BoxOptions) -> BoxHandle {
        let handle = self
            .runtime
            .create(options)
            .await
            .expect("Failed to create box");
        handle.start().await.expect("Failed to start box");
        handle
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Drain an execution, keeping every item in arrival order.
pub async fn collect_chunks(mut execution: Execution) -> Vec<CellboxResult<ExecChunk>> {
    let mut items = Vec::new();
    while let Some(item) = execution.next().await {
        items.push(item);
    }
    items
}
