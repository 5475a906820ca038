//! Orderly shutdown on SIGTERM and SIGINT.
//!
//! The handler runs on a dedicated thread with its own single-threaded
//! executor, so it works whether or not the host process drives a tokio
//! runtime of its own.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};

use cellbox_shared::errors::{CellboxError, CellboxResult};

/// At most one handler per process.
static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Run `shutdown` and exit the process on the first SIGTERM or SIGINT.
///
/// Returns `Ok(false)` when a handler is already installed.
#[cfg(unix)]
pub(crate) fn install<F, Fut>(shutdown: F) -> CellboxResult<bool>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    use signal_hook::consts::signal::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    if INSTALLED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return Ok(false);
    }

    let spawned = Signals::new([SIGTERM, SIGINT]).and_then(|signals| {
        std::thread::Builder::new()
            .name("cellbox-signal-handler".into())
            .spawn(move || serve(signals, shutdown, || std::process::exit(0)))
    });

    match spawned {
        Ok(_) => {
            tracing::debug!("Installed shutdown signal handler");
            Ok(true)
        }
        Err(e) => {
            INSTALLED.store(false, Ordering::SeqCst);
            Err(CellboxError::Internal(format!(
                "failed to install signal handler: {}",
                e
            )))
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn install<F, Fut>(_shutdown: F) -> CellboxResult<bool>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Err(CellboxError::Unsupported(
        "signal handling requires a unix host".into(),
    ))
}

/// Block until one of `signals` arrives, run `shutdown` to completion, then
/// call `exit`.
#[cfg(unix)]
fn serve<F, Fut>(mut signals: signal_hook::iterator::Signals, shutdown: F, exit: impl FnOnce())
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    let Some(signal) = signals.forever().next() else {
        return;
    };
    tracing::info!(
        signal = signal_hook::low_level::signal_name(signal).unwrap_or("unknown"),
        "Received signal, shutting down runtime"
    );

    match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt.block_on(shutdown()),
        Err(e) => tracing::error!(error = %e, "Failed to create shutdown executor"),
    }
    exit();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use signal_hook::consts::signal::SIGUSR2;
    use signal_hook::iterator::Signals;
    use std::sync::{Arc, mpsc};
    use std::time::Duration;

    #[test]
    fn test_signal_runs_shutdown_before_exit() {
        let signals = Signals::new([SIGUSR2]).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = mpsc::channel();

        let flag = Arc::clone(&ran);
        let worker = std::thread::spawn(move || {
            serve(
                signals,
                move || async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    flag.store(true, Ordering::SeqCst);
                },
                move || {
                    let _ = exited_tx.send(());
                },
            )
        });

        signal_hook::low_level::raise(SIGUSR2).unwrap();
        exited_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        worker.join().unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
