//! Synchronous one-box convenience API.
//!
//! [`SimpleRunner`] owns a runtime, a started box, and the async executor
//! that drives them. Dropping the runner stops and removes the box before
//! the runtime goes away.

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Runtime as TokioRuntime;

use cellbox_shared::errors::{CellboxError, CellboxResult};

use crate::images::ImageResolver;
use crate::isolation::IsolationBackend;
use crate::litebox::{BoxCommand, BoxHandle, ExecOutput};
use crate::runtime::CellboxRuntime;
use crate::runtime::options::{BoxOptions, CellboxOptions, RootfsSpec, StopTimeout};
use crate::BoxID;

/// One runtime plus one running box, torn down together.
///
/// # Example
///
/// ```rust,no_run
/// use cellbox::SimpleRunner;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let runner = SimpleRunner::new("alpine:latest", Some(1), Some(256))?;
/// let output = runner.run("echo", ["hello"])?;
/// assert_eq!(output.stdout_lossy(), "hello\n");
/// # Ok(())
/// # }
/// ```
pub struct SimpleRunner {
    runtime: CellboxRuntime,
    handle: Option<BoxHandle>,
    tokio_rt: Option<TokioRuntime>,
}

impl SimpleRunner {
    /// Create a runner for `image` with the default runtime options.
    ///
    /// `None` resources fall back to the box defaults.
    pub fn new(image: &str, cpus: Option<u8>, memory_mib: Option<u32>) -> CellboxResult<Self> {
        let options = BoxOptions {
            rootfs: RootfsSpec::Image(image.to_string()),
            cpus,
            memory_mib,
            ..Default::default()
        };
        Self::with_options(CellboxOptions::default(), options)
    }

    pub fn with_options(
        runtime_options: CellboxOptions,
        box_options: BoxOptions,
    ) -> CellboxResult<Self> {
        let runtime = CellboxRuntime::new(runtime_options)?;
        let tokio_rt = build_executor()?;
        Self::launch(tokio_rt, runtime, box_options)
    }

    /// Create a runner over caller-supplied collaborators.
    pub fn with_backends(
        runtime_options: CellboxOptions,
        box_options: BoxOptions,
        resolver: Arc<dyn ImageResolver>,
        backend: Arc<dyn IsolationBackend>,
    ) -> CellboxResult<Self> {
        let runtime = CellboxRuntime::with_backends(runtime_options, resolver, backend)?;
        let tokio_rt = build_executor()?;
        Self::launch(tokio_rt, runtime, box_options)
    }

    fn launch(
        tokio_rt: TokioRuntime,
        runtime: CellboxRuntime,
        box_options: BoxOptions,
    ) -> CellboxResult<Self> {
        let mut runner = Self {
            runtime,
            handle: None,
            tokio_rt: Some(tokio_rt),
        };

        let runtime = runner.runtime.clone();
        let handle = runner.block_on(async move {
            let handle = runtime.create(box_options).await?;
            if let Err(e) = handle.start().await {
                // Never leave a box behind that the caller cannot reach.
                if let Err(cleanup) = runtime.remove(handle.id().as_str(), true).await {
                    tracing::warn!(box_id = %handle.id(), error = %cleanup, "Failed to remove box after start failure");
                }
                return Err(e);
            }
            Ok(handle)
        })??;

        tracing::debug!(box_id = %handle.id(), "Runner ready");
        runner.handle = Some(handle);
        Ok(runner)
    }

    /// Run a command to completion and return its buffered output.
    pub fn run<I, S>(&self, command: &str, args: I) -> CellboxResult<ExecOutput>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| CellboxError::InvalidState("runner is closed".into()))?;
        let command = BoxCommand::new(command).args(args);
        self.block_on(async move { handle.run(command).await })?
    }

    pub fn box_id(&self) -> Option<&BoxID> {
        self.handle.as_ref().map(BoxHandle::id)
    }

    pub fn runtime(&self) -> &CellboxRuntime {
        &self.runtime
    }

    /// Stop and remove the box, then shut the runtime down, reporting the
    /// first failure.
    ///
    /// Dropping the runner does the same but can only log errors.
    pub fn close(mut self) -> CellboxResult<()> {
        self.teardown()
    }

    /// Every step runs even when an earlier one failed: a forced remove
    /// retries a stop whose release failed.
    fn teardown(&mut self) -> CellboxResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        let runtime = self.runtime.clone();
        self.block_on(async move {
            let stopped = handle.stop(StopTimeout::Default).await.map(drop);
            if let Err(e) = &stopped {
                tracing::warn!(box_id = %handle.id(), error = %e, "Runner box failed to stop, retrying through remove");
            }

            let removed = runtime.remove(handle.id().as_str(), true).await.map(drop);

            let shut_down = runtime
                .shutdown(StopTimeout::Default)
                .await
                .and_then(|report| match report.failures().next() {
                    Some((_, e)) => Err(e.clone()),
                    None => Ok(()),
                });

            stopped.and(removed).and(shut_down)
        })?
    }

    /// Drive `fut` to completion on the runner's executor.
    ///
    /// Works from inside another async runtime by blocking a scoped thread
    /// instead of the caller's executor.
    fn block_on<F>(&self, fut: F) -> CellboxResult<F::Output>
    where
        F: Future + Send,
        F::Output: Send,
    {
        let rt = self
            .tokio_rt
            .as_ref()
            .ok_or_else(|| CellboxError::InvalidState("runner is closed".into()))?;

        if tokio::runtime::Handle::try_current().is_err() {
            return Ok(rt.block_on(fut));
        }

        std::thread::scope(|scope| scope.spawn(|| rt.block_on(fut)).join())
            .map_err(|_| CellboxError::Internal("runner executor thread panicked".into()))
    }
}

impl Drop for SimpleRunner {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            tracing::warn!(error = %e, "Failed to tear down runner box");
        }
        if let Some(rt) = self.tokio_rt.take() {
            rt.shutdown_background();
        }
    }
}

impl std::fmt::Debug for SimpleRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleRunner")
            .field("box_id", &self.box_id())
            .finish()
    }
}

fn build_executor() -> CellboxResult<TokioRuntime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("cellbox-runner")
        .build()
        .map_err(|e| CellboxError::Internal(format!("Failed to create async runtime: {}", e)))
}
