//! Command execution
//!
//! The execution engine spawns a command inside a running box and pumps the
//! backend's process events into a bounded output queue. Every execution
//! ends with exactly one terminal item: `ExecChunk::Exit`, or an error when
//! the command was cut short by a stop. The terminal item travels on its own
//! slot, so it is delivered even when the output queue is full.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;

use cellbox_shared::constants::exit;
use cellbox_shared::errors::{CellboxError, CellboxResult};

use crate::BoxID;
use crate::isolation::{IsolationBackend, IsolationHandle, ProcessEvent};
use crate::metrics::{BoxMetricsStorage, RuntimeMetricsStorage};

/// Command builder for executing programs in a box.
///
/// Provides a builder API similar to `std::process::Command`.
///
/// # Examples
///
/// ```rust,no_run
/// # use cellbox::BoxCommand;
/// let cmd = BoxCommand::new("python3")
///     .args(["-c", "print('hello')"])
///     .env("PYTHONPATH", "/app")
///     .working_dir("/workspace");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BoxCommand {
    pub(crate) command: String,
    pub(crate) args: Vec<String>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) working_dir: Option<String>,
}

impl BoxCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: vec![],
            env: vec![],
            working_dir: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.env.push((key.into(), val.into()));
        self
    }

    /// Set working directory, relative to the box root.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.command
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn envs(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn current_dir(&self) -> Option<&str> {
        self.working_dir.as_deref()
    }

    /// Fill in box-level defaults the command does not override.
    pub(crate) fn with_defaults(mut self, env: &[(String, String)], working_dir: Option<&str>) -> Self {
        let inherited: Vec<(String, String)> = env
            .iter()
            .filter(|(k, _)| !self.env.iter().any(|(own, _)| own == k))
            .cloned()
            .collect();
        if !inherited.is_empty() {
            let own = std::mem::take(&mut self.env);
            self.env = inherited.into_iter().chain(own).collect();
        }
        if self.working_dir.is_none() {
            self.working_dir = working_dir.map(str::to_string);
        }
        self
    }
}

/// One item of execution output.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    /// Final exit marker. Nothing follows it.
    Exit(i32),
}

impl ExecChunk {
    pub fn is_exit(&self) -> bool {
        matches!(self, ExecChunk::Exit(_))
    }
}

/// Buffered result of an execution.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code (0 = success). If terminated by signal, code is negative signal number.
    /// `cellbox_shared::constants::exit::SPAWN_FAILED` if the command never started.
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    /// Returns true if the exit code was 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns true if the command could not be started.
    pub fn spawn_failed(&self) -> bool {
        self.exit_code == exit::SPAWN_FAILED
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Unique identifier for an execution.
pub type ExecutionId = String;

/// Handle to a running command execution.
///
/// A [`Stream`] of output chunks in arrival order, ending with
/// `Ok(ExecChunk::Exit(code))` or, if the owning box was stopped while the
/// command ran, `Err(CellboxError::Stopped(..))`.
///
/// At most [`OUTPUT_QUEUE_CAPACITY`] chunks wait unread. A command whose
/// output is not consumed blocks on write until it is read, the handle is
/// dropped, or the box stops. Once the box is stopping, output that does
/// not fit is discarded.
///
/// # Examples
///
/// ```rust,no_run
/// # async fn example(handle: &cellbox::BoxHandle) -> Result<(), Box<dyn std::error::Error>> {
/// use cellbox::{BoxCommand, ExecChunk};
/// use futures::StreamExt;
///
/// let mut execution = handle.exec(BoxCommand::new("ls").arg("-la")).await?;
/// while let Some(chunk) = execution.next().await {
///     match chunk? {
///         ExecChunk::Stdout(bytes) => print!("{}", String::from_utf8_lossy(&bytes)),
///         ExecChunk::Stderr(bytes) => eprint!("{}", String::from_utf8_lossy(&bytes)),
///         ExecChunk::Exit(code) => println!("exit code: {code}"),
///     }
/// }
/// # Ok(())
/// # }
/// ```
pub struct Execution {
    id: ExecutionId,
    output: mpsc::Receiver<ExecChunk>,
    terminal: oneshot::Receiver<CellboxResult<ExecChunk>>,
    finished: bool,
}

/// Output chunks buffered per execution before the command is held back.
pub const OUTPUT_QUEUE_CAPACITY: usize = 256;

impl Execution {
    fn new(
        id: ExecutionId,
        output: mpsc::Receiver<ExecChunk>,
        terminal: oneshot::Receiver<CellboxResult<ExecChunk>>,
    ) -> Self {
        Self {
            id,
            output,
            terminal,
            finished: false,
        }
    }

    pub fn id(&self) -> &ExecutionId {
        &self.id
    }

    /// Buffer all output and return it with the exit code once the command
    /// terminates.
    pub async fn output(mut self) -> CellboxResult<ExecOutput> {
        let mut output = ExecOutput::default();
        while let Some(chunk) = self.next().await {
            match chunk? {
                ExecChunk::Stdout(bytes) => output.stdout.extend_from_slice(&bytes),
                ExecChunk::Stderr(bytes) => output.stderr.extend_from_slice(&bytes),
                ExecChunk::Exit(code) => {
                    output.exit_code = code;
                    return Ok(output);
                }
            }
        }
        Err(missing_exit())
    }

    /// Deliver each chunk to `sink` as it arrives, including the final exit
    /// marker, and return the exit code.
    pub async fn stream_to<F>(mut self, mut sink: F) -> CellboxResult<i32>
    where
        F: FnMut(&ExecChunk),
    {
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            sink(&chunk);
            if let ExecChunk::Exit(code) = chunk {
                return Ok(code);
            }
        }
        Err(missing_exit())
    }

    /// Wait for the execution to complete, discarding its output.
    pub async fn wait(self) -> CellboxResult<i32> {
        self.stream_to(|_| {}).await
    }
}

impl Stream for Execution {
    type Item = CellboxResult<ExecChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        // The terminal item is sent before the output sender is dropped.
        match this.output.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => return Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(None) => {}
            Poll::Pending => return Poll::Pending,
        }

        match Pin::new(&mut this.terminal).poll(cx) {
            Poll::Ready(terminal) => {
                this.finished = true;
                Poll::Ready(Some(terminal.unwrap_or_else(|_| Err(missing_exit()))))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for Execution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

fn missing_exit() -> CellboxError {
    CellboxError::Internal("execution ended without an exit status".into())
}

// ============================================================================
// EXECUTION ENGINE
// ============================================================================

/// Launches one command inside a running box.
///
/// Holds a token of the box's run-session tracker for as long as the command
/// runs, so a stop can wait for every in-flight execution.
pub(crate) struct ExecutionEngine {
    pub(crate) box_id: BoxID,
    pub(crate) backend: Arc<dyn IsolationBackend>,
    pub(crate) handle: IsolationHandle,
    pub(crate) cancel: CancellationToken,
    pub(crate) force: CancellationToken,
    pub(crate) token: TaskTrackerToken,
    pub(crate) metrics: Arc<BoxMetricsStorage>,
    pub(crate) runtime_metrics: RuntimeMetricsStorage,
}

impl ExecutionEngine {
    pub(crate) async fn execute(self, command: BoxCommand) -> Execution {
        let id: ExecutionId = ulid::Ulid::new().to_string();
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_QUEUE_CAPACITY);
        let (terminal_tx, terminal_rx) = oneshot::channel();
        let started = Instant::now();

        self.metrics.increment_commands_executed();

        match self.backend.spawn(&self.handle, &command).await {
            Ok(process) => {
                self.runtime_metrics.record_exec(false);
                tracing::debug!(
                    box_id = %self.box_id,
                    exec_id = %id,
                    command = %command.command,
                    pid = ?process.pid,
                    "Spawned command"
                );

                // A stop that began during spawn signalled before this process
                // existed. Repeat whichever signal the stop has reached.
                if self.cancel.is_cancelled() {
                    let graceful = !self.force.is_cancelled();
                    if let Err(e) = self.backend.terminate(&self.handle, graceful).await {
                        tracing::warn!(box_id = %self.box_id, error = %e, "Failed to signal late process");
                    }
                }

                let sink = OutputSink {
                    output: output_tx,
                    terminal: terminal_tx,
                };
                tokio::spawn(self.pump(id.clone(), process.events, sink, started));
            }
            Err(e) => {
                self.metrics.increment_exec_errors();
                self.runtime_metrics.record_exec(true);
                tracing::warn!(
                    box_id = %self.box_id,
                    exec_id = %id,
                    command = %command.command,
                    error = %e,
                    "Failed to spawn command"
                );
                let _ = output_tx.try_send(ExecChunk::Stderr(format!("{e}\n").into_bytes()));
                let _ = terminal_tx.send(Ok(ExecChunk::Exit(exit::SPAWN_FAILED)));
            }
        }

        Execution::new(id, output_rx, terminal_rx)
    }

    /// Forward process events until the process exits.
    ///
    /// Waits on a full output queue only while the box is not stopping, so a
    /// stop can always drain executions nobody is reading.
    async fn pump(
        self,
        exec_id: ExecutionId,
        mut events: mpsc::Receiver<ProcessEvent>,
        sink: OutputSink,
        started: Instant,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Stdout(bytes) => {
                    self.metrics.add_stdout_bytes(bytes.len() as u64);
                    sink.forward(ExecChunk::Stdout(bytes), &self.cancel).await;
                }
                ProcessEvent::Stderr(bytes) => {
                    self.metrics.add_stderr_bytes(bytes.len() as u64);
                    sink.forward(ExecChunk::Stderr(bytes), &self.cancel).await;
                }
                ProcessEvent::Exited(process_exit) => {
                    self.metrics
                        .record_completion(process_exit.code, started.elapsed(), process_exit.cpu_time);

                    let terminal = if self.cancel.is_cancelled() {
                        tracing::debug!(box_id = %self.box_id, exec_id = %exec_id, "Execution stopped");
                        Err(CellboxError::Stopped(format!(
                            "execution {} terminated by stop of box {}",
                            exec_id, self.box_id
                        )))
                    } else {
                        Ok(ExecChunk::Exit(process_exit.code))
                    };
                    sink.finish(terminal);
                    return;
                }
            }
        }

        tracing::error!(box_id = %self.box_id, exec_id = %exec_id, "Process events ended without exit");
        sink.finish(Err(CellboxError::Engine(format!(
            "process event stream for execution {} closed without exit status",
            exec_id
        ))));
    }
}

/// Sending half of an [`Execution`].
struct OutputSink {
    output: mpsc::Sender<ExecChunk>,
    terminal: oneshot::Sender<CellboxResult<ExecChunk>>,
}

impl OutputSink {
    /// Queue one output chunk. Dropped if the reader is gone, or if the
    /// queue is full once `stopping` fires.
    async fn forward(&self, chunk: ExecChunk, stopping: &CancellationToken) {
        if stopping.is_cancelled() {
            let _ = self.output.try_send(chunk);
            return;
        }
        tokio::select! {
            _ = self.output.send(chunk) => {}
            _ = stopping.cancelled() => {}
        }
    }

    /// Deliver the terminal item and close the output queue.
    fn finish(self, terminal: CellboxResult<ExecChunk>) {
        let _ = self.terminal.send(terminal);
    }
}
