//! Scripted isolation backend.
//!
//! Commands are interpreted by name instead of executed:
//!
//! | command          | behavior                                                    |
//! |------------------|-------------------------------------------------------------|
//! | `echo ARGS..`    | prints the arguments joined by spaces plus a newline, exit 0 |
//! | `seq N`          | prints `1`..`N` one line at a time, exit 0                   |
//! | `flood N`        | prints `1`..`N` as fast as they are read, exit 0             |
//! | `sleep [SECS]`   | runs until terminated (exit -15 or -9) or SECS elapse (0)    |
//! | `stubborn [SECS]`| like `sleep`, but ignores graceful termination               |
//! | `true`           | exit 0                                                       |
//! | `false`          | exit 1                                                       |
//! | `fail`           | writes to stderr, exit 1                                     |
//! | anything else    | fails to spawn                                               |

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use cellbox::isolation::{ProcessEvent, ProcessExit, ProcessHandle};
use cellbox::{BoxCommand, IsolationBackend, IsolationHandle, ResourceLimits, RootfsHandle};
use cellbox_shared::errors::{CellboxError, CellboxResult};

/// Exit code of a process that honored graceful termination.
pub const TERMINATED: i32 = -15;
/// Exit code of a killed process.
pub const KILLED: i32 = -9;

/// Delay between `seq` lines.
const SEQ_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Signal {
    None,
    Term,
    Kill,
}

#[derive(Default)]
struct FakeState {
    /// Live processes per allocated handle.
    handles: Mutex<HashMap<String, HashMap<u64, watch::Sender<Signal>>>>,
    next_pid: AtomicU64,
    spawned: Mutex<Vec<BoxCommand>>,
    /// Time each `spawn` takes before the process exists.
    spawn_delay: Mutex<Duration>,
    fail_allocate: AtomicBool,
    /// Number of upcoming releases that fail.
    failing_releases: AtomicUsize,
    allocations: AtomicUsize,
    releases: AtomicUsize,
    graceful_terminations: AtomicUsize,
    forced_terminations: AtomicUsize,
}

/// In-memory [`IsolationBackend`] with scripted commands and injectable
/// failures.
#[derive(Clone, Default)]
pub struct FakeBackend {
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `allocate` fail with an engine error.
    pub fn fail_allocate(&self, fail: bool) {
        self.state.fail_allocate.store(fail, Ordering::SeqCst);
    }

    /// Make every following `release` fail with an engine error.
    pub fn fail_release(&self, fail: bool) {
        let n = if fail { usize::MAX } else { 0 };
        self.state.failing_releases.store(n, Ordering::SeqCst);
    }

    /// Make every following `spawn` take `delay` before the process starts.
    pub fn set_spawn_delay(&self, delay: Duration) {
        *self.state.spawn_delay.lock() = delay;
    }

    /// Make only the next `n` releases fail.
    pub fn fail_next_releases(&self, n: usize) {
        self.state.failing_releases.store(n, Ordering::SeqCst);
    }

    pub fn allocations(&self) -> usize {
        self.state.allocations.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.state.releases.load(Ordering::SeqCst)
    }

    pub fn graceful_terminations(&self) -> usize {
        self.state.graceful_terminations.load(Ordering::SeqCst)
    }

    pub fn forced_terminations(&self) -> usize {
        self.state.forced_terminations.load(Ordering::SeqCst)
    }

    /// Handles allocated and not yet released.
    pub fn live_handles(&self) -> usize {
        self.state.handles.lock().len()
    }

    /// Processes still running across all handles.
    pub fn live_processes(&self) -> usize {
        self.state.handles.lock().values().map(HashMap::len).sum()
    }

    /// Every command passed to `spawn`, in order.
    pub fn spawned_commands(&self) -> Vec<BoxCommand> {
        self.state.spawned.lock().clone()
    }

    fn signal_all(&self, handle: &IsolationHandle, signal: Signal) -> CellboxResult<()> {
        let handles = self.state.handles.lock();
        let procs = handles.get(handle.id()).ok_or_else(|| unknown(handle))?;
        for tx in procs.values() {
            let _ = tx.send(signal);
        }
        Ok(())
    }
}

fn unknown(handle: &IsolationHandle) -> CellboxError {
    CellboxError::Engine(format!("unknown isolation handle {}", handle.id()))
}

#[async_trait]
impl IsolationBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn allocate(
        &self,
        rootfs: &RootfsHandle,
        limits: ResourceLimits,
    ) -> CellboxResult<IsolationHandle> {
        if self.state.fail_allocate.load(Ordering::SeqCst) {
            return Err(CellboxError::Engine("injected allocation failure".into()));
        }
        let handle = IsolationHandle::new(rootfs.clone(), limits);
        self.state
            .handles
            .lock()
            .insert(handle.id().to_string(), HashMap::new());
        self.state.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn spawn(
        &self,
        handle: &IsolationHandle,
        command: &BoxCommand,
    ) -> CellboxResult<ProcessHandle> {
        self.state.spawned.lock().push(command.clone());

        let delay = *self.state.spawn_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let script = Script::parse(command)?;
        let pid = self.state.next_pid.fetch_add(1, Ordering::SeqCst) + 1;
        let (signal_tx, signal_rx) = watch::channel(Signal::None);

        self.state
            .handles
            .lock()
            .get_mut(handle.id())
            .ok_or_else(|| unknown(handle))?
            .insert(pid, signal_tx);

        let (tx, rx) = mpsc::channel(16);
        let state = Arc::clone(&self.state);
        let handle_id = handle.id().to_string();
        tokio::spawn(async move {
            let code = script.run(&tx, signal_rx).await;
            if let Some(procs) = state.handles.lock().get_mut(&handle_id) {
                procs.remove(&pid);
            }
            let _ = tx
                .send(ProcessEvent::Exited(ProcessExit {
                    code,
                    cpu_time: Some(Duration::from_micros(100)),
                }))
                .await;
        });

        Ok(ProcessHandle {
            pid: Some(pid as u32),
            events: rx,
        })
    }

    async fn terminate(&self, handle: &IsolationHandle, graceful: bool) -> CellboxResult<()> {
        if graceful {
            self.state.graceful_terminations.fetch_add(1, Ordering::SeqCst);
            self.signal_all(handle, Signal::Term)
        } else {
            self.state.forced_terminations.fetch_add(1, Ordering::SeqCst);
            self.signal_all(handle, Signal::Kill)
        }
    }

    async fn release(&self, handle: &IsolationHandle) -> CellboxResult<()> {
        let injected = self
            .state
            .failing_releases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if injected {
            return Err(CellboxError::Engine("injected release failure".into()));
        }
        let procs = self
            .state
            .handles
            .lock()
            .remove(handle.id())
            .ok_or_else(|| unknown(handle))?;
        for tx in procs.values() {
            let _ = tx.send(Signal::Kill);
        }
        self.state.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// SCRIPTS
// ============================================================================

enum Script {
    Echo(String),
    Seq(u32),
    Flood(u32),
    Sleep {
        limit: Option<Duration>,
        honor_term: bool,
    },
    Exit(i32),
    Fail,
}

impl Script {
    fn parse(command: &BoxCommand) -> CellboxResult<Self> {
        let args = command.arguments();
        let secs = || {
            args.first()
                .and_then(|s| s.parse::<f64>().ok())
                .map(Duration::from_secs_f64)
        };

        match command.program() {
            "echo" => Ok(Script::Echo(format!("{}\n", args.join(" ")))),
            "seq" => Ok(Script::Seq(
                args.first().and_then(|n| n.parse().ok()).unwrap_or(0),
            )),
            "flood" => Ok(Script::Flood(
                args.first().and_then(|n| n.parse().ok()).unwrap_or(0),
            )),
            "sleep" => Ok(Script::Sleep {
                limit: secs(),
                honor_term: true,
            }),
            "stubborn" => Ok(Script::Sleep {
                limit: secs(),
                honor_term: false,
            }),
            "true" => Ok(Script::Exit(0)),
            "false" => Ok(Script::Exit(1)),
            "fail" => Ok(Script::Fail),
            other => Err(CellboxError::Execution(format!(
                "failed to spawn {}: No such file or directory",
                other
            ))),
        }
    }

    async fn run(self, tx: &mpsc::Sender<ProcessEvent>, mut signals: watch::Receiver<Signal>) -> i32 {
        match self {
            Script::Echo(line) => {
                let _ = tx.send(ProcessEvent::Stdout(line.into_bytes())).await;
                0
            }
            Script::Seq(n) => {
                for i in 1..=n {
                    let _ = tx.send(ProcessEvent::Stdout(format!("{i}\n").into_bytes())).await;
                    tokio::select! {
                        _ = tokio::time::sleep(SEQ_INTERVAL) => {}
                        code = wait_for_signal(&mut signals, true) => return code,
                    }
                }
                0
            }
            Script::Flood(n) => {
                for i in 1..=n {
                    let _ = tx.send(ProcessEvent::Stdout(format!("{i}\n").into_bytes())).await;
                }
                0
            }
            Script::Sleep { limit, honor_term } => match limit {
                Some(limit) => tokio::time::timeout(limit, wait_for_signal(&mut signals, honor_term))
                    .await
                    .unwrap_or(0),
                None => wait_for_signal(&mut signals, honor_term).await,
            },
            Script::Exit(code) => code,
            Script::Fail => {
                let _ = tx
                    .send(ProcessEvent::Stderr(b"fail: injected failure\n".to_vec()))
                    .await;
                1
            }
        }
    }
}

/// Resolve once a signal the process does not ignore arrives.
async fn wait_for_signal(signals: &mut watch::Receiver<Signal>, honor_term: bool) -> i32 {
    loop {
        match *signals.borrow_and_update() {
            Signal::Kill => return KILLED,
            Signal::Term if honor_term => return TERMINATED,
            _ => {}
        }
        if signals.changed().await.is_err() {
            // Handle released underneath the process.
            return KILLED;
        }
    }
}
