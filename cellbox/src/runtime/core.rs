//! High-level sandbox runtime structures.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use cellbox_shared::errors::{CellboxError, CellboxResult};

use crate::images::{ImageManager, ImageResolver};
use crate::isolation::IsolationBackend;
use crate::litebox::{BoxConfig, BoxContext, BoxHandle, StopOutcome};
use crate::management::{BoxID, BoxInfo, BoxRegistry};
use crate::metrics::{RuntimeMetrics, RuntimeMetricsStorage};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::{BoxOptions, CellboxOptions, StopTimeout};
use crate::runtime::shutdown::{BoxShutdown, ShutdownOutcome, ShutdownReport};
use crate::runtime::signal_handler;
use crate::util::init_logging_for;

// ============================================================================
// PUBLIC API
// ============================================================================

/// CellboxRuntime provides the main entry point for creating and managing boxes.
///
/// **Cloning**: Runtime is cheaply cloneable via `Arc` - all clones share the same state.
///
/// **Shutdown**: After [`shutdown`](Self::shutdown) the runtime refuses to
/// create or start boxes. Inspection and removal keep working.
#[derive(Clone)]
pub struct CellboxRuntime {
    inner: RuntimeInner,
}

/// Shared runtime state.
pub(crate) type RuntimeInner = Arc<RuntimeInnerImpl>;

/// Runtime inner implementation.
///
/// Every field is either immutable after construction or synchronizes
/// internally; the runtime itself holds no lock.
pub(crate) struct RuntimeInnerImpl {
    layout: FilesystemLayout,
    registry: BoxRegistry,
    resolver: Arc<dyn ImageResolver>,
    /// Backend, policy, metrics and shutdown flag shared with every box
    box_ctx: Arc<BoxContext>,
}

// ============================================================================
// RUNTIME IMPLEMENTATION
// ============================================================================

impl CellboxRuntime {
    /// Create a runtime backed by host processes and the local image store.
    ///
    /// **Prepare Before Execute**: All setup (filesystem, logging, managers) completes
    /// before returning. No partial initialization states.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - `home_dir` is not absolute (`Config`)
    /// - Filesystem initialization fails (`Storage`)
    #[cfg(unix)]
    pub fn new(options: CellboxOptions) -> CellboxResult<Self> {
        Self::with_isolation(options, Arc::new(crate::isolation::ProcessBackend::new()))
    }

    #[cfg(not(unix))]
    pub fn new(_options: CellboxOptions) -> CellboxResult<Self> {
        Err(CellboxError::Unsupported(
            "the process isolation backend requires a unix host".into(),
        ))
    }

    /// Create a runtime with the default runtime options.
    pub fn with_defaults() -> CellboxResult<Self> {
        Self::new(CellboxOptions::default())
    }

    /// Create a runtime with a custom isolation backend and the local image store.
    pub fn with_isolation(
        options: CellboxOptions,
        backend: Arc<dyn IsolationBackend>,
    ) -> CellboxResult<Self> {
        let layout = Self::prepare(&options)?;
        let image_manager =
            ImageManager::new(layout.images_dir(), options.image_registries.clone())?;
        Ok(Self::assemble(
            &options,
            layout,
            Arc::new(image_manager),
            backend,
        ))
    }

    /// Create a runtime with both collaborators supplied by the caller.
    pub fn with_backends(
        options: CellboxOptions,
        resolver: Arc<dyn ImageResolver>,
        backend: Arc<dyn IsolationBackend>,
    ) -> CellboxResult<Self> {
        let layout = Self::prepare(&options)?;
        Ok(Self::assemble(&options, layout, resolver, backend))
    }

    /// Create a box in `Created` state.
    ///
    /// Options are validated before the rootfs is resolved, so a rejected
    /// request touches neither the image store nor the registry. The box is
    /// not started; call [`BoxHandle::start`].
    ///
    /// # Errors
    ///
    /// - `Stopped` after runtime shutdown
    /// - `InvalidArgument` for invalid options
    /// - `AlreadyExists` if the name is taken
    /// - `Image` if the rootfs cannot be resolved
    pub async fn create(&self, options: BoxOptions) -> CellboxResult<BoxHandle> {
        if self.inner.box_ctx.is_shutdown() {
            return Err(CellboxError::Stopped("runtime is shut down".into()));
        }

        options.sanitize()?;

        // Cheap pre-check; register() re-checks atomically.
        if let Some(name) = &options.name
            && self.inner.registry.contains_name(name)?
        {
            return Err(CellboxError::AlreadyExists(format!(
                "box with name '{}' already exists",
                name
            )));
        }

        let rootfs = self.inner.resolver.resolve(&options.rootfs).await?;
        let config = BoxConfig::new(options, rootfs);
        let box_impl = self
            .inner
            .registry
            .register(config, Arc::clone(&self.inner.box_ctx))?;

        self.runtime_metrics()
            .boxes_created
            .fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            box_id = %box_impl.id(),
            name = ?box_impl.name(),
            image = %box_impl.config.rootfs.reference(),
            "Created box"
        );
        Ok(BoxHandle::new(box_impl))
    }

    /// Get a handle by id, name, or unique id prefix.
    pub fn get(&self, id_or_name: &str) -> CellboxResult<BoxHandle> {
        self.inner.registry.lookup(id_or_name).map(BoxHandle::new)
    }

    /// Get information about a specific box.
    pub fn get_info(&self, id_or_name: &str) -> CellboxResult<BoxInfo> {
        Ok(self.inner.registry.lookup(id_or_name)?.info())
    }

    /// List all boxes, sorted by creation time (newest first).
    pub fn list_info(&self) -> CellboxResult<Vec<BoxInfo>> {
        self.inner.registry.list()
    }

    pub fn exists(&self, id_or_name: &str) -> CellboxResult<bool> {
        match self.inner.registry.lookup(id_or_name) {
            Ok(_) => Ok(true),
            Err(CellboxError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove a box from the registry.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Box doesn't exist (`NotFound`)
    /// - Box is not stopped and `force` is false (`InvalidState`)
    pub async fn remove(&self, id_or_name: &str, force: bool) -> CellboxResult<BoxID> {
        let id = self.inner.registry.remove(id_or_name, force).await?;
        self.runtime_metrics()
            .boxes_removed
            .fetch_add(1, Ordering::Relaxed);
        Ok(id)
    }

    /// Get runtime-wide metrics.
    ///
    /// Monotonic counters plus per-box totals summed over the boxes
    /// registered at the moment of the call.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use cellbox::CellboxRuntime;
    /// # fn example(runtime: &CellboxRuntime) -> Result<(), Box<dyn std::error::Error>> {
    /// let metrics = runtime.metrics()?;
    /// println!("Total boxes created: {}", metrics.boxes_created_total());
    /// println!("Total commands executed: {}", metrics.total_commands_executed());
    /// # Ok(())
    /// # }
    /// ```
    pub fn metrics(&self) -> CellboxResult<RuntimeMetrics> {
        let snapshots: Vec<_> = self
            .inner
            .registry
            .snapshot()?
            .iter()
            .map(|b| (b.status().is_running(), b.metrics()))
            .collect();

        Ok(RuntimeMetrics::aggregate(
            self.runtime_metrics(),
            snapshots.iter().map(|(running, m)| (*running, m)),
        ))
    }

    /// Stop every running box, concurrently.
    ///
    /// Each box gets the full `timeout` as its own grace period, and the
    /// grace periods overlap, so shutdown takes about as long as the slowest
    /// single box. A box that fails to stop is reported without aborting the
    /// others. Afterwards the runtime refuses new boxes and starts.
    pub async fn shutdown(&self, timeout: impl Into<StopTimeout>) -> CellboxResult<ShutdownReport> {
        let timeout = timeout.into();
        if !self.inner.box_ctx.mark_shutdown() {
            tracing::debug!("Runtime already shut down, stopping stragglers");
        }

        let boxes = self.inner.registry.snapshot()?;
        tracing::info!(boxes = boxes.len(), timeout = ?timeout, "Shutting down runtime");

        let results = futures::future::join_all(boxes.iter().map(|b| async move {
            b.stop_for_shutdown(timeout)
                .await
                .map(|result| (b.id().clone(), result))
        }))
        .await;

        let mut report = ShutdownReport::default();
        for (id, result) in results.into_iter().flatten() {
            let outcome = match result {
                Ok(StopOutcome::Forced) => ShutdownOutcome::Forced,
                Ok(StopOutcome::Graceful | StopOutcome::AlreadyStopped) => {
                    ShutdownOutcome::Graceful
                }
                Err(e) => {
                    tracing::warn!(box_id = %id, error = %e, "Failed to stop box during shutdown");
                    ShutdownOutcome::Failed(e)
                }
            };
            report.boxes.push(BoxShutdown { id, outcome });
        }

        tracing::info!(
            graceful = report.graceful_count(),
            forced = report.forced_count(),
            failed = report.failures().count(),
            "Runtime shut down"
        );
        Ok(report)
    }

    /// Shut the runtime down and exit the process on SIGTERM or SIGINT.
    ///
    /// Opt-in. Only one handler exists per process, so this returns `false`
    /// when one is already installed, whichever runtime installed it.
    pub fn install_signal_handler(&self, timeout: impl Into<StopTimeout>) -> CellboxResult<bool> {
        let runtime = self.clone();
        let timeout = timeout.into();
        signal_handler::install(move || runtime.shutdown_on_signal(timeout))
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.box_ctx.is_shutdown()
    }

    pub fn home_dir(&self) -> &std::path::Path {
        self.inner.layout.home_dir()
    }
}

// ============================================================================
// INTERNAL HELPERS
// ============================================================================

impl CellboxRuntime {
    /// Validate options and lay out the home directory.
    fn prepare(options: &CellboxOptions) -> CellboxResult<FilesystemLayout> {
        // Validate Early: Check preconditions before expensive work
        if !options.home_dir.is_absolute() {
            return Err(CellboxError::Config(format!(
                "home_dir must be absolute path, got: {}",
                options.home_dir.display()
            )));
        }

        let layout = FilesystemLayout::new(options.home_dir.clone());
        layout.prepare()?;
        init_logging_for(&layout)?;
        Ok(layout)
    }

    fn assemble(
        options: &CellboxOptions,
        layout: FilesystemLayout,
        resolver: Arc<dyn ImageResolver>,
        backend: Arc<dyn IsolationBackend>,
    ) -> Self {
        tracing::debug!(
            home_dir = %layout.home_dir().display(),
            backend = backend.name(),
            "initialized runtime"
        );

        let box_ctx = Arc::new(BoxContext::new(
            backend,
            options.default_grace_period,
            options.contention,
            RuntimeMetricsStorage::new(),
        ));

        Self {
            inner: Arc::new(RuntimeInnerImpl {
                layout,
                registry: BoxRegistry::new(),
                resolver,
                box_ctx,
            }),
        }
    }

    /// Shutdown run by the signal handler; it can only log the outcome.
    async fn shutdown_on_signal(self, timeout: StopTimeout) {
        match self.shutdown(timeout).await {
            Ok(report) => {
                for (id, e) in report.failures() {
                    tracing::error!(box_id = %id, error = %e, "Box did not stop before exit");
                }
            }
            Err(e) => tracing::error!(error = %e, "Runtime shutdown failed"),
        }
    }

    fn runtime_metrics(&self) -> &RuntimeMetricsStorage {
        &self.inner.box_ctx.runtime_metrics
    }
}

impl std::fmt::Debug for CellboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellboxRuntime")
            .field("home_dir", &self.inner.layout.home_dir())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ============================================================================
// THREAD SAFETY ASSERTIONS
// ============================================================================

const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<CellboxRuntime>;
};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubBackend;

    fn runtime(temp: &tempfile::TempDir) -> CellboxRuntime {
        CellboxRuntime::with_isolation(
            CellboxOptions::with_home(temp.path()),
            Arc::new(StubBackend),
        )
        .unwrap()
    }

    #[test]
    fn test_relative_home_rejected() {
        let err = CellboxRuntime::with_isolation(
            CellboxOptions::with_home("relative/home"),
            Arc::new(StubBackend),
        )
        .unwrap_err();
        assert!(matches!(err, CellboxError::Config(_)));
    }

    #[test]
    fn test_layout_prepared() {
        let temp = tempfile::tempdir().unwrap();
        let rt = runtime(&temp);
        assert!(rt.home_dir().join("images").is_dir());
        assert!(rt.home_dir().join("logs").is_dir());
    }

    #[tokio::test]
    async fn test_invalid_options_leave_nothing_behind() {
        let temp = tempfile::tempdir().unwrap();
        let rt = runtime(&temp);

        let err = rt
            .create(BoxOptions::image("alpine").with_memory_mib(0))
            .await
            .unwrap_err();
        assert!(matches!(err, CellboxError::InvalidArgument(_)));
        assert!(rt.list_info().unwrap().is_empty());
        assert_eq!(rt.metrics().unwrap().boxes_created_total(), 0);
    }

    #[tokio::test]
    async fn test_exists_and_get_info() {
        let temp = tempfile::tempdir().unwrap();
        let rt = runtime(&temp);

        let handle = rt
            .create(BoxOptions::image("alpine").with_name("web"))
            .await
            .unwrap();
        assert!(rt.exists("web").unwrap());
        assert!(!rt.exists("db").unwrap());
        assert_eq!(rt.get_info("web").unwrap().id, *handle.id());
    }

    #[tokio::test]
    async fn test_create_after_shutdown_fails() {
        let temp = tempfile::tempdir().unwrap();
        let rt = runtime(&temp);

        let report = rt.shutdown(StopTimeout::Default).await.unwrap();
        assert!(report.boxes.is_empty());
        assert!(rt.is_shutdown());

        let err = rt.create(BoxOptions::default()).await.unwrap_err();
        assert!(matches!(err, CellboxError::Stopped(_)));
    }

    #[tokio::test]
    async fn test_signal_shutdown_stops_running_boxes() {
        use crate::BoxStatus;

        let temp = tempfile::tempdir().unwrap();
        let rt = runtime(&temp);
        let handle = rt.create(BoxOptions::image("alpine")).await.unwrap();
        handle.start().await.unwrap();

        rt.clone().shutdown_on_signal(StopTimeout::Default).await;

        assert!(rt.is_shutdown());
        assert_eq!(handle.status(), BoxStatus::Stopped);
    }
}
