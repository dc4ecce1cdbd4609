//! Volume directories declared by images.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use strata_common::StrataResult;

/// Creates the mount points for image volumes.
pub trait VolumeCreator: Send + Sync {
    /// Create `volume` (an absolute path inside the container) under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    fn create(&self, root: &Path, volume: &str) -> StrataResult<()>;
}

/// Creates volume directories with mode 0755.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleVolumeCreator;

impl VolumeCreator for SimpleVolumeCreator {
    fn create(&self, root: &Path, volume: &str) -> StrataResult<()> {
        let path = root.join(volume.trim_start_matches('/'));
        fs::create_dir_all(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        tracing::debug!(path = %path.display(), "Volume created");
        Ok(())
    }
}
