//! Image resolution.
//!
//! The runtime turns a [`RootfsSpec`] into a [`RootfsHandle`] through an
//! [`ImageResolver`]. Fetching images from remote registries is the
//! resolver's business; the default [`ImageManager`] resolves references
//! against a local store under the runtime home.

mod manager;
mod reference;

pub use manager::ImageManager;
pub use reference::ImageReference;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cellbox_shared::errors::CellboxResult;

use crate::runtime::options::RootfsSpec;

/// A resolved root filesystem, ready to be handed to an isolation backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RootfsHandle {
    /// Fully qualified image reference, or the rootfs path for path sources.
    reference: String,
    /// Host directory holding the root filesystem.
    path: PathBuf,
}

impl RootfsHandle {
    pub fn new(reference: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            reference: reference.into(),
            path: path.into(),
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Resolves a rootfs source to a usable root filesystem.
///
/// Implementations fail with `CellboxError::Image` when the reference cannot
/// be fetched or validated. The runtime never retries a failed resolution.
#[async_trait]
pub trait ImageResolver: Send + Sync {
    async fn resolve(&self, rootfs: &RootfsSpec) -> CellboxResult<RootfsHandle>;
}
