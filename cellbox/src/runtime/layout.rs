use cellbox_shared::errors::{CellboxError, CellboxResult};
use std::path::{Path, PathBuf};

/// Directory structure constants
pub mod dirs {
    /// Base directory name for Cellbox data
    pub const CELLBOX_DIR: &str = ".cellbox";

    /// Subdirectory for resolved image roots
    pub const IMAGES_DIR: &str = "images";

    /// Subdirectory for log files
    pub const LOGS_DIR: &str = "logs";
}

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Resolved image roots: ~/.cellbox/images
    pub fn images_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::IMAGES_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    pub fn prepare(&self) -> CellboxResult<()> {
        std::fs::create_dir_all(&self.home_dir)
            .map_err(|e| CellboxError::Storage(format!("failed to create home: {e}")))?;

        std::fs::create_dir_all(self.images_dir())
            .map_err(|e| CellboxError::Storage(format!("failed to create images dir: {e}")))?;

        std::fs::create_dir_all(self.logs_dir())
            .map_err(|e| CellboxError::Storage(format!("failed to create logs dir: {e}")))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prepare_creates_subdirectories() {
        let temp = tempfile::tempdir().unwrap();
        let layout = FilesystemLayout::new(temp.path().join("home"));

        layout.prepare().unwrap();

        assert!(layout.home_dir().is_dir());
        assert!(layout.images_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let temp = tempfile::tempdir().unwrap();
        let layout = FilesystemLayout::new(temp.path().to_path_buf());

        layout.prepare().unwrap();
        layout.prepare().unwrap();
    }

    #[test]
    fn test_prepare_fails_when_home_is_a_file() {
        let temp = tempfile::tempdir().unwrap();
        let file = temp.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();

        let err = FilesystemLayout::new(file).prepare().unwrap_err();
        assert!(matches!(err, CellboxError::Storage(_)));
    }
}
