use std::path::{Path, PathBuf};

use async_trait::async_trait;
use cellbox_shared::errors::{CellboxError, CellboxResult};

use super::{ImageReference, ImageResolver, RootfsHandle};
use crate::runtime::options::RootfsSpec;

/// Local image store rooted at `<home>/images`.
///
/// Each fully qualified reference maps to one directory in the store.
/// Unqualified references are tried against the configured registries in
/// order; the first one already present locally wins, otherwise the first
/// candidate is provisioned.
#[derive(Clone, Debug)]
pub struct ImageManager {
    images_dir: PathBuf,
    registries: Vec<String>,
}

impl ImageManager {
    /// Create a manager over `images_dir`.
    ///
    /// # Arguments
    ///
    /// * `images_dir` - Directory holding resolved image roots
    /// * `registries` - Registries used to qualify unqualified references
    pub fn new(images_dir: PathBuf, registries: Vec<String>) -> CellboxResult<Self> {
        std::fs::create_dir_all(&images_dir).map_err(|e| {
            CellboxError::Storage(format!(
                "failed to create images dir {}: {}",
                images_dir.display(),
                e
            ))
        })?;
        Ok(Self {
            images_dir,
            registries,
        })
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    fn resolve_image(&self, image_ref: &str) -> CellboxResult<RootfsHandle> {
        let parsed = ImageReference::parse(image_ref)?;
        let candidates = parsed.candidates(&self.registries);

        if let Some(hit) = candidates
            .iter()
            .find(|c| self.images_dir.join(c.storage_key()).is_dir())
        {
            tracing::debug!(image_ref = %image_ref, resolved = %hit, "Image found in local store");
            return Ok(RootfsHandle::new(
                hit.to_string(),
                self.images_dir.join(hit.storage_key()),
            ));
        }

        let first = candidates.first().ok_or_else(|| {
            CellboxError::Image(format!("no registry candidates for {}", image_ref))
        })?;
        let path = self.images_dir.join(first.storage_key());
        std::fs::create_dir_all(&path).map_err(|e| {
            CellboxError::Image(format!(
                "failed to provision {} at {}: {}",
                first,
                path.display(),
                e
            ))
        })?;

        tracing::info!(image_ref = %image_ref, resolved = %first, "Provisioned image root");
        Ok(RootfsHandle::new(first.to_string(), path))
    }

    fn resolve_path(&self, rootfs_path: &str) -> CellboxResult<RootfsHandle> {
        let path = PathBuf::from(rootfs_path);
        if !path.is_absolute() {
            return Err(CellboxError::Image(format!(
                "rootfs path must be absolute, got: {}",
                rootfs_path
            )));
        }
        if !path.is_dir() {
            return Err(CellboxError::Image(format!(
                "rootfs path {} does not exist or is not a directory",
                rootfs_path
            )));
        }
        Ok(RootfsHandle::new(rootfs_path, path))
    }
}

#[async_trait]
impl ImageResolver for ImageManager {
    async fn resolve(&self, rootfs: &RootfsSpec) -> CellboxResult<RootfsHandle> {
        match rootfs {
            RootfsSpec::Image(image_ref) => self.resolve_image(image_ref),
            RootfsSpec::RootfsPath(path) => self.resolve_path(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(registries: &[&str]) -> (tempfile::TempDir, ImageManager) {
        let temp = tempfile::tempdir().unwrap();
        let manager = ImageManager::new(
            temp.path().join("images"),
            registries.iter().map(|r| r.to_string()).collect(),
        )
        .unwrap();
        (temp, manager)
    }

    #[tokio::test]
    async fn test_resolve_provisions_first_candidate() {
        let (_temp, manager) = manager(&[]);
        let handle = manager
            .resolve(&RootfsSpec::Image("alpine".into()))
            .await
            .unwrap();

        assert_eq!(handle.reference(), "docker.io/alpine:latest");
        assert!(handle.path().is_dir());
        assert!(handle.path().starts_with(manager.images_dir()));
    }

    #[tokio::test]
    async fn test_resolve_prefers_locally_present_candidate() {
        let (_temp, manager) = manager(&["ghcr.io", "quay.io"]);
        std::fs::create_dir_all(manager.images_dir().join("quay.io_alpine_latest")).unwrap();

        let handle = manager
            .resolve(&RootfsSpec::Image("alpine".into()))
            .await
            .unwrap();
        assert_eq!(handle.reference(), "quay.io/alpine:latest");
    }

    #[tokio::test]
    async fn test_resolve_invalid_reference_is_image_error() {
        let (_temp, manager) = manager(&[]);
        let err = manager
            .resolve(&RootfsSpec::Image("not a ref".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CellboxError::Image(_)));
    }

    #[tokio::test]
    async fn test_resolve_rootfs_path() {
        let (temp, manager) = manager(&[]);
        let root = temp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();

        let spec = RootfsSpec::RootfsPath(root.to_string_lossy().into_owned());
        let handle = manager.resolve(&spec).await.unwrap();
        assert_eq!(handle.path(), root.as_path());
    }

    #[tokio::test]
    async fn test_resolve_missing_rootfs_path() {
        let (temp, manager) = manager(&[]);
        let missing = temp.path().join("missing");

        let spec = RootfsSpec::RootfsPath(missing.to_string_lossy().into_owned());
        assert!(matches!(
            manager.resolve(&spec).await,
            Err(CellboxError::Image(_))
        ));

        let relative = RootfsSpec::RootfsPath("relative/root".into());
        assert!(matches!(
            manager.resolve(&relative).await,
            Err(CellboxError::Image(_))
        ));
    }
}
