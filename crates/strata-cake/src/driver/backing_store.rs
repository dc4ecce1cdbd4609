//! Fixed-size filesystem images backing quota-limited layers.

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;

use strata_common::{CommandRunner, StrataError, StrataResult};

/// Creates and deletes per-layer backing files.
pub trait BackingStoreManager: Send + Sync {
    /// Create an ext4 image of exactly `quota` bytes for layer `id`.
    fn create(&self, id: &str, quota: i64) -> StrataResult<PathBuf>;

    /// Delete the image of layer `id`. Missing images are not an error.
    fn delete(&self, id: &str) -> StrataResult<()>;
}

/// Backing files kept as sparse ext4 images in a single directory.
pub struct BackingStore {
    root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl BackingStore {
    /// Create a store keeping images under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` cannot be created.
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> StrataResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, runner })
    }

    fn path(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

impl BackingStoreManager for BackingStore {
    fn create(&self, id: &str, quota: i64) -> StrataResult<PathBuf> {
        let size = u64::try_from(quota)
            .ok()
            .filter(|size| *size > 0)
            .ok_or(StrataError::InvalidQuota { quota })?;

        let path = self.path(id);
        File::create(&path)?.set_len(size)?;

        let target = path.display().to_string();
        if let Err(e) = self
            .runner
            .run("mkfs.ext4", &["-O", "^has_journal", "-F", &target])
        {
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        tracing::debug!(id, quota, path = %path.display(), "Backing store created");
        Ok(path)
    }

    fn delete(&self, id: &str) -> StrataResult<()> {
        match fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
