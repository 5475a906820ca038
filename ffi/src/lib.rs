//! Boundary layer for Cellbox SDKs.
//!
//! Language bindings talk to the runtime through [`Boundary`]. Every entity
//! that crosses the boundary (runtime, box, runner, execution result) lives
//! in a generation-checked [`HandleTable`] and is referred to by a
//! [`Token`]. Complex values travel as JSON so bindings need no knowledge
//! of Rust types.
//!
//! All methods block the calling thread until the operation completes and
//! must not be called from inside an async runtime.

mod error;
mod handles;

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tokio::runtime::Runtime as TokioRuntime;

use cellbox::{
    BoxCommand, BoxHandle, BoxOptions, CellboxOptions, CellboxRuntime, ExecChunk, ExecOutput,
    ImageResolver, IsolationBackend, RootfsSpec, ShutdownOutcome, SimpleRunner, StopOutcome,
    StopTimeout,
};
use cellbox_shared::errors::CellboxError;

pub use error::{BoundaryResult, ErrorInfo};
pub use handles::{HandleTable, Token};

/// A box together with the runtime that owns it.
struct BoxEntry {
    runtime: CellboxRuntime,
    handle: BoxHandle,
}

/// Injected collaborators, used instead of the host defaults.
#[derive(Clone)]
struct Collaborators {
    resolver: Arc<dyn ImageResolver>,
    backend: Arc<dyn IsolationBackend>,
}

/// Token-based facade over the Cellbox runtime.
pub struct Boundary {
    tokio_rt: Arc<TokioRuntime>,
    collaborators: Option<Collaborators>,
    runtimes: Mutex<HandleTable<CellboxRuntime>>,
    boxes: Mutex<HandleTable<BoxEntry>>,
    runners: Mutex<HandleTable<Arc<SimpleRunner>>>,
    results: Mutex<HandleTable<ExecOutput>>,
}

impl Boundary {
    /// Create a boundary whose runtimes use the host process backend and
    /// the local image store.
    pub fn new() -> BoundaryResult<Self> {
        Self::build(None)
    }

    /// Create a boundary whose runtimes and runners use the given
    /// collaborators.
    pub fn with_backends(
        resolver: Arc<dyn ImageResolver>,
        backend: Arc<dyn IsolationBackend>,
    ) -> BoundaryResult<Self> {
        Self::build(Some(Collaborators { resolver, backend }))
    }

    fn build(collaborators: Option<Collaborators>) -> BoundaryResult<Self> {
        let tokio_rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("cellbox-boundary")
            .build()
            .map_err(|e| {
                CellboxError::Internal(format!("Failed to create async runtime: {}", e))
            })?;

        Ok(Self {
            tokio_rt: Arc::new(tokio_rt),
            collaborators,
            runtimes: Mutex::new(HandleTable::new("runtime")),
            boxes: Mutex::new(HandleTable::new("box")),
            runners: Mutex::new(HandleTable::new("runner")),
            results: Mutex::new(HandleTable::new("result")),
        })
    }

    // ========================================================================
    // RUNTIME
    // ========================================================================

    /// Create a runtime.
    ///
    /// # Arguments
    /// * `home` - Home directory, or `None` for the default
    /// * `registries_json` - JSON array of registries, e.g. `["ghcr.io"]`
    pub fn runtime_new(
        &self,
        home: Option<&str>,
        registries_json: Option<&str>,
    ) -> BoundaryResult<Token> {
        let options = runtime_options(home, registries_json)?;
        let runtime = match &self.collaborators {
            Some(c) => {
                CellboxRuntime::with_backends(options, c.resolver.clone(), c.backend.clone())?
            }
            None => CellboxRuntime::new(options)?,
        };
        Ok(self.runtimes.lock().insert(runtime))
    }

    /// Release a runtime token. Boxes created from it stay usable.
    pub fn runtime_free(&self, runtime: Token) -> BoundaryResult<()> {
        self.runtimes.lock().remove(runtime)?;
        Ok(())
    }

    /// Runtime metrics as JSON.
    pub fn runtime_metrics_json(&self, runtime: Token) -> BoundaryResult<String> {
        let metrics = self.runtime(runtime)?.metrics()?;
        Ok(serde_json::to_string(&metrics).map_err(CellboxError::from)?)
    }

    /// Stop every running box of a runtime.
    ///
    /// `timeout_secs`: 0 for the default grace period, negative to wait
    /// indefinitely. Returns a JSON summary:
    /// `{"graceful": n, "forced": n, "failed": [{"id", "code", "message"}]}`.
    pub fn runtime_shutdown(&self, runtime: Token, timeout_secs: i32) -> BoundaryResult<String> {
        let runtime = self.runtime(runtime)?;
        let report = self.block_on(async move {
            runtime.shutdown(StopTimeout::from(timeout_secs)).await
        })?;

        let failed: Vec<_> = report
            .boxes
            .iter()
            .filter_map(|b| match &b.outcome {
                ShutdownOutcome::Failed(e) => Some(json!({
                    "id": b.id,
                    "code": e.code().as_i32(),
                    "message": e.to_string(),
                })),
                _ => None,
            })
            .collect();

        Ok(json!({
            "graceful": report.graceful_count(),
            "forced": report.forced_count(),
            "failed": failed,
        })
        .to_string())
    }

    /// All boxes of a runtime as a JSON array of box info, newest first.
    pub fn list_info_json(&self, runtime: Token) -> BoundaryResult<String> {
        let infos = self.runtime(runtime)?.list_info()?;
        Ok(serde_json::to_string(&infos).map_err(CellboxError::from)?)
    }

    // ========================================================================
    // BOXES
    // ========================================================================

    /// Create a box in the Created state.
    ///
    /// `options_json` is a JSON box options document; `None` uses the
    /// defaults. A non-empty `name` overrides any name in the document.
    pub fn box_create(
        &self,
        runtime: Token,
        options_json: Option<&str>,
        name: Option<&str>,
    ) -> BoundaryResult<Token> {
        let runtime = self.runtime(runtime)?;
        let mut options: BoxOptions = match options_json {
            Some(doc) => serde_json::from_str(doc).map_err(CellboxError::from)?,
            None => BoxOptions::default(),
        };
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            options.name = Some(name.to_string());
        }

        let rt = runtime.clone();
        let handle = self.block_on(async move { rt.create(options).await })?;
        Ok(self.boxes.lock().insert(BoxEntry { runtime, handle }))
    }

    /// Look up an existing box by id, name, or unique id prefix.
    pub fn box_get(&self, runtime: Token, id_or_name: &str) -> BoundaryResult<Token> {
        let runtime = self.runtime(runtime)?;
        let handle = runtime.get(id_or_name)?;
        Ok(self.boxes.lock().insert(BoxEntry { runtime, handle }))
    }

    pub fn box_id(&self, handle: Token) -> BoundaryResult<String> {
        Ok(self.box_handle(handle)?.id().to_string())
    }

    pub fn box_start(&self, handle: Token) -> BoundaryResult<()> {
        let handle = self.box_handle(handle)?;
        Ok(self.block_on(async move { handle.start().await })?)
    }

    /// Stop a box. Returns true if in-flight executions had to be killed.
    pub fn box_stop(&self, handle: Token, timeout_secs: i32) -> BoundaryResult<bool> {
        let handle = self.box_handle(handle)?;
        let outcome =
            self.block_on(async move { handle.stop(StopTimeout::from(timeout_secs)).await })?;
        Ok(outcome == StopOutcome::Forced)
    }

    /// Remove a box from its runtime and release the token.
    ///
    /// The token stays valid if the removal fails.
    pub fn box_remove(&self, handle: Token, force: bool) -> BoundaryResult<()> {
        let (runtime, id) = {
            let boxes = self.boxes.lock();
            let entry = boxes.get(handle)?;
            (entry.runtime.clone(), entry.handle.id().clone())
        };
        self.block_on(async move { runtime.remove(id.as_str(), force).await })?;
        self.boxes.lock().remove(handle)?;
        Ok(())
    }

    /// Release a box token without touching the box.
    pub fn box_free(&self, handle: Token) -> BoundaryResult<()> {
        self.boxes.lock().remove(handle)?;
        Ok(())
    }

    /// Box info as JSON.
    pub fn box_info_json(&self, handle: Token) -> BoundaryResult<String> {
        let info = self.box_handle(handle)?.info();
        Ok(serde_json::to_string(&info).map_err(CellboxError::from)?)
    }

    /// Box metrics as JSON.
    pub fn box_metrics_json(&self, handle: Token) -> BoundaryResult<String> {
        let metrics = self.box_handle(handle)?.metrics();
        Ok(serde_json::to_string(&metrics).map_err(CellboxError::from)?)
    }

    /// Run a command, delivering output to `callback` as it arrives.
    ///
    /// `callback` receives each chunk of output with a flag telling stderr
    /// apart from stdout. Returns the exit code; a command that could not
    /// be started returns `cellbox_shared::constants::exit::SPAWN_FAILED`.
    pub fn execute<F>(
        &self,
        handle: Token,
        command: &str,
        args_json: Option<&str>,
        mut callback: F,
    ) -> BoundaryResult<i32>
    where
        F: FnMut(&[u8], bool),
    {
        if command.is_empty() {
            return Err(error::missing("command"));
        }
        let handle = self.box_handle(handle)?;
        let command = BoxCommand::new(command).args(parse_args(args_json)?);

        let code = self.tokio_rt.block_on(async move {
            let execution = handle.exec(command).await?;
            execution
                .stream_to(|chunk| match chunk {
                    ExecChunk::Stdout(bytes) => callback(bytes.as_slice(), false),
                    ExecChunk::Stderr(bytes) => callback(bytes.as_slice(), true),
                    ExecChunk::Exit(_) => {}
                })
                .await
        })?;
        Ok(code)
    }

    // ========================================================================
    // SIMPLE RUNNER
    // ========================================================================

    /// Create a runner: a private runtime with one started box.
    ///
    /// `cpus` and `memory_mib` of 0 select the defaults.
    pub fn runner_new(
        &self,
        image: &str,
        cpus: i32,
        memory_mib: i32,
        home: Option<&str>,
    ) -> BoundaryResult<Token> {
        if image.is_empty() {
            return Err(error::missing("image"));
        }
        let box_options = BoxOptions {
            rootfs: RootfsSpec::Image(image.to_string()),
            cpus: optional_resource::<u8>("cpus", cpus)?,
            memory_mib: optional_resource::<u32>("memory_mib", memory_mib)?,
            ..Default::default()
        };
        let options = runtime_options(home, None)?;

        let runner = match &self.collaborators {
            Some(c) => SimpleRunner::with_backends(
                options,
                box_options,
                c.resolver.clone(),
                c.backend.clone(),
            )?,
            None => SimpleRunner::with_options(options, box_options)?,
        };
        Ok(self.runners.lock().insert(Arc::new(runner)))
    }

    /// Run a command in the runner's box; returns a result token.
    pub fn runner_run(
        &self,
        runner: Token,
        command: &str,
        args_json: Option<&str>,
    ) -> BoundaryResult<Token> {
        if command.is_empty() {
            return Err(error::missing("command"));
        }
        let runner = Arc::clone(self.runners.lock().get(runner)?);
        let output = runner.run(command, parse_args(args_json)?)?;
        Ok(self.results.lock().insert(output))
    }

    /// Release a runner, stopping and removing its box.
    ///
    /// The token is invalid afterwards even when teardown reports an error.
    /// If a `runner_run` still holds the runner, teardown happens when that
    /// run finishes and its errors are only logged.
    pub fn runner_free(&self, runner: Token) -> BoundaryResult<()> {
        let runner = self.runners.lock().remove(runner)?;
        match Arc::try_unwrap(runner) {
            Ok(runner) => Ok(runner.close()?),
            Err(_shared) => Ok(()),
        }
    }

    // ========================================================================
    // RESULTS
    // ========================================================================

    pub fn result_exit_code(&self, result: Token) -> BoundaryResult<i32> {
        Ok(self.results.lock().get(result)?.exit_code)
    }

    pub fn result_stdout(&self, result: Token) -> BoundaryResult<String> {
        Ok(self.results.lock().get(result)?.stdout_lossy())
    }

    pub fn result_stderr(&self, result: Token) -> BoundaryResult<String> {
        Ok(self.results.lock().get(result)?.stderr_lossy())
    }

    pub fn result_free(&self, result: Token) -> BoundaryResult<()> {
        self.results.lock().remove(result)?;
        Ok(())
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    fn runtime(&self, token: Token) -> BoundaryResult<CellboxRuntime> {
        Ok(self.runtimes.lock().get(token)?.clone())
    }

    fn box_handle(&self, token: Token) -> BoundaryResult<BoxHandle> {
        Ok(self.boxes.lock().get(token)?.handle.clone())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.tokio_rt.block_on(fut)
    }
}

fn runtime_options(
    home: Option<&str>,
    registries_json: Option<&str>,
) -> BoundaryResult<CellboxOptions> {
    let mut options = CellboxOptions::default();
    if let Some(home) = home.filter(|h| !h.is_empty()) {
        options.home_dir = PathBuf::from(home);
    }
    if let Some(doc) = registries_json {
        options.image_registries = serde_json::from_str(doc).map_err(CellboxError::from)?;
    }
    Ok(options)
}

fn parse_args(args_json: Option<&str>) -> BoundaryResult<Vec<String>> {
    match args_json {
        Some(doc) => Ok(serde_json::from_str(doc).map_err(CellboxError::from)?),
        None => Ok(Vec::new()),
    }
}

/// Map a boundary integer to an optional resource value (0 = default).
fn optional_resource<T: TryFrom<i32>>(name: &str, value: i32) -> BoundaryResult<Option<T>> {
    if value == 0 {
        return Ok(None);
    }
    T::try_from(value).map(Some).map_err(|_| {
        CellboxError::InvalidArgument(format!("{} out of range: {}", name, value)).into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_resource() {
        assert_eq!(optional_resource::<u8>("cpus", 0).unwrap(), None);
        assert_eq!(optional_resource::<u8>("cpus", 4).unwrap(), Some(4));
        assert!(optional_resource::<u8>("cpus", 300).is_err());
        assert!(optional_resource::<u32>("memory_mib", -1).is_err());
    }

    #[test]
    fn test_parse_args() {
        assert!(parse_args(None).unwrap().is_empty());
        assert_eq!(parse_args(Some(r#"["-c","1"]"#)).unwrap(), ["-c", "1"]);

        let err = parse_args(Some("not json")).unwrap_err();
        assert_eq!(err.code, cellbox::ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_runtime_options_from_boundary_values() {
        let options = runtime_options(Some("/srv/cellbox"), Some(r#"["ghcr.io"]"#)).unwrap();
        assert_eq!(options.home_dir, PathBuf::from("/srv/cellbox"));
        assert_eq!(options.image_registries, ["ghcr.io"]);

        assert!(runtime_options(None, Some("{")).is_err());
    }
}
