use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use cellbox::{ImageResolver, RootfsHandle, RootfsSpec};
use cellbox_shared::errors::{CellboxError, CellboxResult};

/// Resolver that accepts any reference without touching the network.
#[derive(Clone, Default)]
pub struct FakeResolver {
    fail: Arc<AtomicBool>,
    resolutions: Arc<AtomicUsize>,
}

impl FakeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following resolution fail with an image error.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of resolve calls so far, failed ones included.
    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageResolver for FakeResolver {
    async fn resolve(&self, rootfs: &RootfsSpec) -> CellboxResult<RootfsHandle> {
        self.resolutions.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CellboxError::Image(format!(
                "injected failure resolving {}",
                rootfs.reference()
            )));
        }
        Ok(RootfsHandle::new(rootfs.reference(), PathBuf::from("/")))
    }
}
