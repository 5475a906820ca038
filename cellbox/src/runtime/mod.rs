pub mod constants;
pub(crate) mod layout;
pub mod options;
pub mod types;

mod core;
mod shutdown;
mod signal_handler;

pub use self::core::CellboxRuntime;
pub use shutdown::{BoxShutdown, ShutdownOutcome, ShutdownReport};
