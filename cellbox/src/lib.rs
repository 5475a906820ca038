//! Cellbox runtime library
//!
//! Creates isolated boxes from an image reference and resource limits, runs
//! commands inside them with streamed or buffered output, and drives their
//! lifecycle through start, stop, remove and runtime-wide shutdown.
//!
//! # Example
//!
//! ```rust,no_run
//! use cellbox::{BoxCommand, BoxOptions, CellboxRuntime};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = CellboxRuntime::new(Default::default())?;
//! let handle = runtime.create(BoxOptions::image("alpine:latest")).await?;
//! handle.start().await?;
//!
//! let output = handle.run(BoxCommand::new("echo").arg("hello")).await?;
//! println!("{}", output.stdout_lossy());
//!
//! runtime.shutdown(0).await?;
//! # Ok(())
//! # }
//! ```

pub mod images;
pub mod isolation;
pub mod litebox;
pub mod management;
pub mod metrics;
pub mod runner;
pub mod runtime;

mod util;

#[cfg(test)]
mod testing;

pub use cellbox_shared::errors::{CellboxError, CellboxResult, ErrorCode};
pub use images::{ImageManager, ImageResolver, RootfsHandle};
#[cfg(unix)]
pub use isolation::ProcessBackend;
pub use isolation::{IsolationBackend, IsolationHandle, ResourceLimits};
pub use litebox::{
    BoxCommand, BoxHandle, ExecChunk, ExecOutput, Execution, ExecutionId, OUTPUT_QUEUE_CAPACITY,
    StopOutcome,
};
pub use metrics::{BoxMetrics, RuntimeMetrics};
pub use runner::SimpleRunner;
pub use runtime::options::{BoxOptions, CellboxOptions, ContentionPolicy, RootfsSpec, StopTimeout};
pub use runtime::types::{BoxID, BoxInfo, BoxState, BoxStatus};
pub use runtime::{BoxShutdown, CellboxRuntime, ShutdownOutcome, ShutdownReport};
