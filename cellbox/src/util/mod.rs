use std::sync::OnceLock;

use cellbox_shared::errors::CellboxResult;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::runtime::constants::filenames;
use crate::runtime::layout::FilesystemLayout;

/// Keeps the file writer flushing for the life of the process.
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Route library logs to a daily file under `<home>/logs`.
///
/// Does nothing if the embedding application already installed a global
/// subscriber, or if an earlier runtime did.
pub(crate) fn init_logging_for(layout: &FilesystemLayout) -> CellboxResult<()> {
    if tracing::dispatcher::has_been_set() || LOG_GUARD.get().is_some() {
        return Ok(());
    }

    let file_appender = tracing_appender::rolling::daily(layout.logs_dir(), filenames::LOG_FILE);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // Defaults to "info" if RUST_LOG not set
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if LOG_GUARD.set(guard).is_ok() {
        register_to_tracing(non_blocking, env_filter);
    }
    Ok(())
}

pub(crate) fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}
