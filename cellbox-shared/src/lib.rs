//! Cellbox Shared - error taxonomy and constants
//!
//! This crate contains types used by the core runtime, the boundary
//! layer, and the command-line tool.

pub mod constants;
pub mod errors;

pub use errors::{CellboxError, CellboxResult, ErrorCode};
