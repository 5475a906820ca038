//! Metrics collection for the Cellbox runtime.
//!
//! This module provides a two-level metrics hierarchy inspired by Tokio:
//! - **RuntimeMetrics**: Aggregate metrics across all boxes (like Tokio's RuntimeMetrics)
//! - **BoxMetrics**: Per-box metrics for individual boxes (like Tokio's TaskMetrics)
//!
//! All counters are monotonic (never decrease). Delta calculation is the caller's
//! responsibility.
//!
//! # Example
//!
//! ```rust,no_run
//! use cellbox::{BoxOptions, CellboxRuntime};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let runtime = CellboxRuntime::new(Default::default())?;
//!
//! // Level 1: Runtime-wide metrics
//! let rt_metrics = runtime.metrics()?;
//! println!("Boxes created: {}", rt_metrics.boxes_created_total());
//! println!("Running boxes: {}", rt_metrics.num_running_boxes());
//!
//! // Level 2: Per-box metrics
//! let handle = runtime.create(BoxOptions::default()).await?;
//! println!("Starts: {}", handle.metrics().starts_total());
//! # Ok(())
//! # }
//! ```

mod box_metrics;
mod runtime_metrics;

pub use box_metrics::{BoxMetrics, BoxMetricsStorage};
pub use runtime_metrics::{RuntimeMetrics, RuntimeMetricsStorage};
