//! Graph drivers.
//!
//! A driver owns the on-disk representation of layers. The graph hands it
//! opaque ids and asks it to create, populate, mount and remove them.

pub mod backing_store;
pub mod loop_mount;
pub mod overlay;
pub mod quotaed;
pub mod vfs;

use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use strata_common::StrataResult;

pub use backing_store::{BackingStore, BackingStoreManager};
pub use loop_mount::{LoopMount, LoopMounter};
pub use overlay::OverlayDriver;
pub use quotaed::QuotaedOverlay;
pub use vfs::VfsDriver;

/// Storage backend for layers.
pub trait GraphDriver: Send + Sync {
    /// Short driver name, also used as its directory name.
    fn name(&self) -> &str;

    /// Create an empty layer on top of `parent`.
    fn create(&self, id: &str, parent: Option<&str>) -> StrataResult<()>;

    /// Delete a layer's storage.
    fn remove(&self, id: &str) -> StrataResult<()>;

    /// Make a layer's merged contents available and return their directory.
    /// Calls nest: each `get` must be paired with a [`GraphDriver::put`].
    fn get(&self, id: &str) -> StrataResult<PathBuf>;

    /// Release one [`GraphDriver::get`]. Releasing an unmounted layer is a
    /// no-op.
    fn put(&self, id: &str) -> StrataResult<()>;

    /// True if storage exists for `id`.
    fn exists(&self, id: &str) -> bool;

    /// Apply a tar diff to the layer, returning the bytes it added.
    fn apply_diff(&self, id: &str, diff: &mut dyn Read) -> StrataResult<u64>;

    /// Quota support, if the driver has any.
    fn as_quotaed(&self) -> Option<&dyn QuotaedDriver> {
        None
    }
}

/// A driver that can cap the writable part of a layer.
pub trait QuotaedDriver: GraphDriver {
    /// Like [`GraphDriver::get`], with the layer's own writes limited to
    /// `quota` bytes.
    fn get_quotaed(&self, id: &str, quota: i64) -> StrataResult<PathBuf>;
}

/// True if something is mounted at `path`.
///
/// Compares the device of `path` with that of its parent directory, which
/// differs exactly when `path` is a mount root.
pub fn is_mountpoint(path: &Path) -> bool {
    let Ok(meta) = std::fs::symlink_metadata(path) else {
        return false;
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("/"));
    match std::fs::metadata(parent) {
        Ok(parent_meta) => meta.dev() != parent_meta.dev() || meta.ino() == parent_meta.ino(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_directory_is_not_a_mountpoint() {
        let dir = tempfile::tempdir().unwrap();
        let child = dir.path().join("child");
        std::fs::create_dir(&child).unwrap();
        assert!(!is_mountpoint(&child));
    }

    #[test]
    fn missing_path_is_not_a_mountpoint() {
        assert!(!is_mountpoint(Path::new("/nonexistent/strata/mnt")));
    }
}
