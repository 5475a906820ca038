//! Box registry.
//!
//! # Overview
//!
//! - **BoxRegistry**: Thread-safe mapping from box id (and optional name)
//!   to the box itself
//! - **BoxID**: Unique identifier (ULID format) for each box
//! - **BoxInfo**: Public metadata about a box (for list operations)
//!
//! # Example
//!
//! ```rust,no_run
//! use cellbox::{BoxOptions, CellboxRuntime};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = CellboxRuntime::new(Default::default())?;
//!
//! runtime.create(BoxOptions::image("alpine").with_name("web")).await?;
//! runtime.create(BoxOptions::image("alpine")).await?;
//!
//! for info in runtime.list_info()? {
//!     println!("{}: {} ({})", info.id, info.status, info.image);
//! }
//! # Ok(())
//! # }
//! ```

mod registry;

pub use crate::runtime::types::{BoxID, BoxInfo, BoxStatus};
pub use registry::BoxRegistry;
