//! Host-process isolation backend.
//!
//! Each spawned command becomes the leader of its own process group, runs
//! with the rootfs directory as its working directory, and has its address
//! space capped at the box memory ceiling. Termination signals whole process
//! groups, so helpers forked by a command go down with it.

use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::sync::mpsc;

use cellbox_shared::errors::{CellboxError, CellboxResult};

use super::rlimit;
use super::{
    IsolationBackend, IsolationHandle, ProcessEvent, ProcessExit, ProcessHandle, ResourceLimits,
};
use crate::images::RootfsHandle;
use crate::litebox::BoxCommand;

/// Buffer size for one stdout/stderr read.
const READ_CHUNK: usize = 8 * 1024;

/// Capacity of a process event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Runs box commands as plain host processes.
#[derive(Debug, Default)]
pub struct ProcessBackend {
    /// Live process groups per allocated handle.
    slots: Arc<Mutex<HashMap<String, Vec<i32>>>>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_capacity(limits: ResourceLimits) -> CellboxResult<()> {
        let available_cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if usize::from(limits.cpus) > available_cpus {
            return Err(CellboxError::Engine(format!(
                "requested {} cpus but only {} are available",
                limits.cpus, available_cpus
            )));
        }

        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let total = system.total_memory();
        if total > 0 && limits.memory_bytes() > total {
            return Err(CellboxError::Engine(format!(
                "requested {} MiB of memory but the host has {} MiB",
                limits.memory_mib,
                total / (1024 * 1024)
            )));
        }

        Ok(())
    }

    fn signal_groups(&self, handle: &IsolationHandle, signal: Signal) -> CellboxResult<()> {
        let groups = self
            .slots
            .lock()
            .get(handle.id())
            .cloned()
            .ok_or_else(|| not_allocated(handle))?;

        for pgid in groups {
            match killpg(Pid::from_raw(pgid), signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => {
                    return Err(CellboxError::Engine(format!(
                        "failed to send {} to process group {}: {}",
                        signal, pgid, e
                    )));
                }
            }
        }
        Ok(())
    }
}

fn not_allocated(handle: &IsolationHandle) -> CellboxError {
    CellboxError::Engine(format!("isolation handle {} is not allocated", handle.id()))
}

#[async_trait]
impl IsolationBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn allocate(
        &self,
        rootfs: &RootfsHandle,
        limits: ResourceLimits,
    ) -> CellboxResult<IsolationHandle> {
        Self::check_capacity(limits)?;

        if !rootfs.path().is_dir() {
            return Err(CellboxError::Engine(format!(
                "rootfs {} is not a directory",
                rootfs.path().display()
            )));
        }

        let handle = IsolationHandle::new(rootfs.clone(), limits);
        self.slots.lock().insert(handle.id().to_string(), Vec::new());

        tracing::debug!(
            handle = %handle.id(),
            cpus = limits.cpus,
            memory_mib = limits.memory_mib,
            "Allocated process isolation"
        );
        Ok(handle)
    }

    async fn spawn(
        &self,
        handle: &IsolationHandle,
        command: &BoxCommand,
    ) -> CellboxResult<ProcessHandle> {
        if !self.slots.lock().contains_key(handle.id()) {
            return Err(not_allocated(handle));
        }

        let workdir = match command.working_dir.as_deref() {
            Some(dir) => handle.rootfs().path().join(dir.trim_start_matches('/')),
            None => PathBuf::from(handle.rootfs().path()),
        };

        let mut cmd = Command::new(&command.command);
        cmd.args(&command.args)
            .current_dir(&workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        let max_bytes = handle.limits().memory_bytes();
        unsafe {
            cmd.pre_exec(move || {
                rlimit::apply_memory_limit_raw(max_bytes).map_err(io::Error::from_raw_os_error)
            });
        }

        let mut child = cmd.spawn().map_err(|e| {
            CellboxError::Execution(format!("failed to spawn {}: {}", command.command, e))
        })?;
        let pid = child.id();
        let pgid = pid as i32;

        let stdout = child.stdout.take().map(OwnedFd::from);
        let stderr = child.stderr.take().map(OwnedFd::from);
        // The child is reaped with wait4 below; dropping `Child` does not wait.
        drop(child);

        {
            let mut slots = self.slots.lock();
            match slots.get_mut(handle.id()) {
                Some(groups) => groups.push(pgid),
                None => {
                    drop(slots);
                    let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
                    tokio::task::spawn_blocking(move || wait_pid(pgid));
                    return Err(not_allocated(handle));
                }
            }
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let stdout_task = stdout
            .map(|fd| tokio::spawn(forward_pipe(fd, tx.clone(), ProcessEvent::Stdout)));
        let stderr_task = stderr
            .map(|fd| tokio::spawn(forward_pipe(fd, tx.clone(), ProcessEvent::Stderr)));

        let handle_id = handle.id().to_string();
        let slots = Arc::clone(&self.slots);
        tokio::spawn(async move {
            let exit = match tokio::task::spawn_blocking(move || wait_pid(pgid)).await {
                Ok(Ok(exit)) => exit,
                Ok(Err(e)) => {
                    tracing::error!(pid, error = %e, "wait4 failed");
                    ProcessExit {
                        code: -1,
                        cpu_time: None,
                    }
                }
                Err(e) => {
                    tracing::error!(pid, error = %e, "wait task failed");
                    ProcessExit {
                        code: -1,
                        cpu_time: None,
                    }
                }
            };

            for task in [stdout_task, stderr_task].into_iter().flatten() {
                let _ = task.await;
            }

            if let Some(groups) = slots.lock().get_mut(&handle_id) {
                groups.retain(|g| *g != pgid);
            }
            tracing::debug!(pid, code = exit.code, "Process exited");
            let _ = tx.send(ProcessEvent::Exited(exit)).await;
        });

        Ok(ProcessHandle {
            pid: Some(pid),
            events: rx,
        })
    }

    async fn terminate(&self, handle: &IsolationHandle, graceful: bool) -> CellboxResult<()> {
        let signal = if graceful {
            Signal::SIGTERM
        } else {
            Signal::SIGKILL
        };
        self.signal_groups(handle, signal)
    }

    async fn release(&self, handle: &IsolationHandle) -> CellboxResult<()> {
        let groups = self
            .slots
            .lock()
            .remove(handle.id())
            .ok_or_else(|| not_allocated(handle))?;

        for pgid in groups {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }

        tracing::debug!(handle = %handle.id(), "Released process isolation");
        Ok(())
    }
}

/// Read a pipe until EOF, forwarding each chunk as an event.
///
/// Keeps draining after the receiver is gone so the child never blocks on
/// a full pipe.
async fn forward_pipe(
    fd: OwnedFd,
    tx: mpsc::Sender<ProcessEvent>,
    wrap: fn(Vec<u8>) -> ProcessEvent,
) {
    let mut reader = match pipe::Receiver::from_owned_fd(fd) {
        Ok(reader) => reader,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register output pipe");
            return;
        }
    };

    let mut buf = vec![0u8; READ_CHUNK];
    let mut receiver_alive = true;
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if receiver_alive && tx.send(wrap(buf[..n].to_vec())).await.is_err() {
                    receiver_alive = false;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read output pipe");
                break;
            }
        }
    }
}

/// Block until `pid` exits and collect its status and CPU usage.
fn wait_pid(pid: i32) -> io::Result<ProcessExit> {
    let mut status: libc::c_int = 0;
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };

    loop {
        let rc = unsafe { libc::wait4(pid, &mut status, 0, &mut usage) };
        if rc != -1 {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }

    let code = if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        -libc::WTERMSIG(status)
    } else {
        -1
    };

    Ok(ProcessExit {
        code,
        cpu_time: Some(timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime)),
    })
}

fn timeval_to_duration(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u64::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}
