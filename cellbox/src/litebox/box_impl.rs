//! Box implementation - holds config, state, and the live isolation session.

// ============================================================================
// IMPORTS
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use cellbox_shared::errors::{CellboxError, CellboxResult};

use super::config::BoxConfig;
use super::exec::{BoxCommand, Execution, ExecutionEngine};
use super::state::{BoxState, BoxStatus};
use crate::isolation::{IsolationBackend, IsolationHandle};
use crate::metrics::{BoxMetrics, BoxMetricsStorage, RuntimeMetricsStorage};
use crate::runtime::options::{ContentionPolicy, StopTimeout};
use crate::{BoxID, BoxInfo};

// ============================================================================
// TYPE ALIASES
// ============================================================================

/// Shared reference to BoxImpl.
pub(crate) type SharedBoxImpl = Arc<BoxImpl>;

// ============================================================================
// SHARED CONTEXT
// ============================================================================

/// Runtime-owned services every box needs.
pub(crate) struct BoxContext {
    pub(crate) backend: Arc<dyn IsolationBackend>,
    pub(crate) default_grace: Duration,
    pub(crate) contention: ContentionPolicy,
    pub(crate) runtime_metrics: RuntimeMetricsStorage,
    shutdown: AtomicBool,
}

impl BoxContext {
    pub(crate) fn new(
        backend: Arc<dyn IsolationBackend>,
        default_grace: Duration,
        contention: ContentionPolicy,
        runtime_metrics: RuntimeMetricsStorage,
    ) -> Self {
        Self {
            backend,
            default_grace,
            contention,
            runtime_metrics,
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_shutdown(&self) -> bool {
        !self.shutdown.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

// ============================================================================
// RUN SESSION
// ============================================================================

/// Live state of one Running period.
///
/// Created by start and torn down by stop. `cancel` marks the session as
/// stopping, `force` marks that the grace period is over, and `tracker`
/// counts the executions still in flight.
struct RunSession {
    handle: IsolationHandle,
    cancel: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
}

impl RunSession {
    fn new(handle: IsolationHandle) -> Self {
        Self {
            handle,
            cancel: CancellationToken::new(),
            force: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }
}

/// How a stop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Every in-flight execution exited within the grace period.
    Graceful,
    /// The grace period expired and remaining executions were killed.
    Forced,
    /// The box was already stopped; nothing happened.
    AlreadyStopped,
}

// ============================================================================
// BOX IMPL
// ============================================================================

/// Box implementation - created on registration, lives until removal.
///
/// `state` is read freely; every write to it happens while holding
/// `lifecycle`, which serializes start, stop and remove.
pub(crate) struct BoxImpl {
    pub(crate) config: BoxConfig,
    state: RwLock<BoxState>,
    lifecycle: tokio::sync::Mutex<()>,
    live: Mutex<Option<Arc<RunSession>>>,
    removed: AtomicBool,
    metrics: Arc<BoxMetricsStorage>,
    ctx: Arc<BoxContext>,
}

impl BoxImpl {
    // ========================================================================
    // CONSTRUCTION
    // ========================================================================

    pub(crate) fn new(config: BoxConfig, ctx: Arc<BoxContext>) -> Self {
        Self {
            config,
            state: RwLock::new(BoxState::new()),
            lifecycle: tokio::sync::Mutex::new(()),
            live: Mutex::new(None),
            removed: AtomicBool::new(false),
            metrics: Arc::new(BoxMetricsStorage::new()),
            ctx,
        }
    }

    // ========================================================================
    // ACCESSORS
    // ========================================================================

    pub(crate) fn id(&self) -> &BoxID {
        &self.config.id
    }

    pub(crate) fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    pub(crate) fn status(&self) -> BoxStatus {
        self.state.read().status
    }

    pub(crate) fn info(&self) -> BoxInfo {
        let state = self.state.read();
        BoxInfo {
            id: self.config.id.clone(),
            name: self.config.name.clone(),
            status: state.status,
            created_at: state.created_at,
            last_updated: state.last_updated,
            image: self.config.options.rootfs.reference().to_string(),
            cpus: self.config.limits.cpus,
            memory_mib: self.config.limits.memory_mib,
        }
    }

    pub(crate) fn metrics(&self) -> BoxMetrics {
        self.metrics.snapshot()
    }

    pub(crate) fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    fn ensure_present(&self) -> CellboxResult<()> {
        if self.is_removed() {
            return Err(CellboxError::NotFound(self.config.id.to_string()));
        }
        Ok(())
    }

    /// Take the per-box lifecycle token according to the contention policy.
    async fn acquire_lifecycle(
        &self,
        operation: &str,
    ) -> CellboxResult<tokio::sync::MutexGuard<'_, ()>> {
        match self.ctx.contention {
            ContentionPolicy::Wait => Ok(self.lifecycle.lock().await),
            ContentionPolicy::FailFast => self.lifecycle.try_lock().map_err(|_| {
                CellboxError::InvalidState(format!(
                    "cannot {} box {}: another lifecycle operation is in progress",
                    operation, self.config.id
                ))
            }),
        }
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub(crate) async fn start(&self) -> CellboxResult<()> {
        let _guard = self.acquire_lifecycle("start").await?;
        self.ensure_present()?;

        if self.ctx.is_shutdown() {
            return Err(CellboxError::Stopped("runtime is shut down".into()));
        }

        let status = self.status();
        if !status.can_start() {
            return Err(CellboxError::InvalidState(format!(
                "cannot start box {} in state {}",
                self.config.id, status
            )));
        }

        let handle = match self
            .ctx
            .backend
            .allocate(&self.config.rootfs, self.config.limits)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                self.ctx
                    .runtime_metrics
                    .boxes_failed
                    .fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    box_id = %self.config.id,
                    backend = self.ctx.backend.name(),
                    error = %e,
                    "Failed to allocate isolation resources"
                );
                return Err(e);
            }
        };

        *self.live.lock() = Some(Arc::new(RunSession::new(handle)));
        self.state.write().transition_to(BoxStatus::Running)?;
        self.metrics.increment_starts();

        tracing::info!(
            box_id = %self.config.id,
            name = ?self.config.name,
            image = %self.config.rootfs.reference(),
            "Started box"
        );
        Ok(())
    }

    pub(crate) async fn stop(&self, timeout: StopTimeout) -> CellboxResult<StopOutcome> {
        let _guard = self.acquire_lifecycle("stop").await?;
        self.ensure_present()?;
        self.stop_locked(timeout).await
    }

    /// Stop used by runtime shutdown.
    ///
    /// Always waits for the lifecycle token, whatever the contention policy,
    /// and skips boxes that are not running. Returns `None` for skipped boxes.
    pub(crate) async fn stop_for_shutdown(
        &self,
        timeout: StopTimeout,
    ) -> Option<CellboxResult<StopOutcome>> {
        let _guard = self.lifecycle.lock().await;
        if self.is_removed() || !self.status().is_running() {
            return None;
        }
        Some(self.stop_locked(timeout).await)
    }

    /// Stop with the lifecycle token already held.
    ///
    /// Graceful termination first; if executions are still in flight when
    /// the grace period expires, force-terminate them. A failed release
    /// leaves the box Running so the stop can be retried.
    async fn stop_locked(&self, timeout: StopTimeout) -> CellboxResult<StopOutcome> {
        let status = self.status();
        if status == BoxStatus::Stopped {
            return Ok(StopOutcome::AlreadyStopped);
        }
        if !status.can_stop() {
            return Err(CellboxError::InvalidState(format!(
                "cannot stop box {} in state {}: it was never started",
                self.config.id, status
            )));
        }

        let session = {
            let live = self.live.lock();
            let session = live.clone().ok_or_else(|| {
                CellboxError::Internal(format!(
                    "running box {} has no isolation session",
                    self.config.id
                ))
            })?;
            // Under the live lock so exec never takes a token after this point.
            session.cancel.cancel();
            session.tracker.close();
            session
        };

        let backend = &self.ctx.backend;
        let grace = timeout.resolve(self.ctx.default_grace);

        if let Err(e) = backend.terminate(&session.handle, true).await {
            tracing::warn!(box_id = %self.config.id, error = %e, "Graceful termination failed");
        }

        let outcome = match grace {
            Some(grace) => match tokio::time::timeout(grace, session.tracker.wait()).await {
                Ok(()) => StopOutcome::Graceful,
                Err(_) => {
                    tracing::warn!(
                        box_id = %self.config.id,
                        grace_ms = grace.as_millis() as u64,
                        in_flight = session.tracker.len(),
                        "Grace period expired, forcing termination"
                    );
                    // Set before signalling so a process still being spawned
                    // kills itself once it exists.
                    session.force.cancel();
                    backend.terminate(&session.handle, false).await?;
                    session.tracker.wait().await;
                    StopOutcome::Forced
                }
            },
            None => {
                session.tracker.wait().await;
                StopOutcome::Graceful
            }
        };

        if let Err(e) = backend.release(&session.handle).await {
            tracing::error!(
                box_id = %self.config.id,
                error = %e,
                "Failed to release isolation resources"
            );
            return Err(e);
        }

        *self.live.lock() = None;
        self.state.write().transition_to(BoxStatus::Stopped)?;

        tracing::info!(box_id = %self.config.id, outcome = ?outcome, "Stopped box");
        Ok(outcome)
    }

    /// Remove the box, calling `erase` to drop it from the registry.
    ///
    /// Requires Stopped. With `force`, a Running box is stopped first and a
    /// never-started box is removed directly.
    pub(crate) async fn remove<F>(&self, force: bool, erase: F) -> CellboxResult<()>
    where
        F: FnOnce() -> CellboxResult<()>,
    {
        let _guard = self.acquire_lifecycle("remove").await?;
        self.ensure_present()?;

        let status = self.status();
        if !status.can_remove() {
            if !force {
                return Err(CellboxError::InvalidState(format!(
                    "cannot remove box {} in state {} (stop it first or use force)",
                    self.config.id, status
                )));
            }
            if status.can_stop() {
                self.stop_locked(StopTimeout::Default).await?;
            }
        }

        erase()?;
        self.removed.store(true, Ordering::SeqCst);

        tracing::info!(box_id = %self.config.id, "Removed box");
        Ok(())
    }

    // ========================================================================
    // EXECUTION
    // ========================================================================

    pub(crate) async fn exec(&self, command: BoxCommand) -> CellboxResult<Execution> {
        self.ensure_present()?;

        let status = self.status();
        if !status.can_exec() {
            return Err(CellboxError::InvalidState(format!(
                "box {} is not running (status: {})",
                self.config.id, status
            )));
        }

        let (session, token) = {
            let live = self.live.lock();
            match live.as_ref() {
                Some(session) if !session.cancel.is_cancelled() => {
                    (Arc::clone(session), session.tracker.token())
                }
                Some(_) => {
                    return Err(CellboxError::InvalidState(format!(
                        "box {} is stopping",
                        self.config.id
                    )));
                }
                // Stopped since the status check above.
                None => {
                    return Err(CellboxError::InvalidState(format!(
                        "box {} is not running",
                        self.config.id
                    )));
                }
            }
        };

        let command = command.with_defaults(
            &self.config.options.env,
            self.config.options.working_dir.as_deref(),
        );

        let engine = ExecutionEngine {
            box_id: self.config.id.clone(),
            backend: Arc::clone(&self.ctx.backend),
            handle: session.handle.clone(),
            cancel: session.cancel.clone(),
            force: session.force.clone(),
            token,
            metrics: Arc::clone(&self.metrics),
            runtime_metrics: self.ctx.runtime_metrics.clone(),
        };
        Ok(engine.execute(command).await)
    }
}

impl std::fmt::Debug for BoxImpl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxImpl")
            .field("id", &self.config.id)
            .field("name", &self.config.name)
            .field("status", &self.status())
            .finish()
    }
}
