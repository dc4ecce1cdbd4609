//! Copying driver.
//!
//! Every layer is a plain directory holding a full copy of its parent plus
//! its own changes. Slow and wasteful, but it needs no mount privileges, so
//! it works anywhere.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strata_common::{CommandRunner, StrataError, StrataResult};

use super::GraphDriver;
use crate::archive::{self, Whiteouts};

/// Driver storing each layer as a full directory copy.
pub struct VfsDriver {
    root: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl VfsDriver {
    /// Create a driver rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory cannot be created.
    pub fn new(root: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> StrataResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root, runner })
    }

    /// Directory of a layer.
    pub fn dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }
}

impl GraphDriver for VfsDriver {
    fn name(&self) -> &str {
        "vfs"
    }

    fn create(&self, id: &str, parent: Option<&str>) -> StrataResult<()> {
        let dir = self.dir(id);
        fs::create_dir_all(&dir)?;

        if let Some(parent) = parent {
            let source = self.dir(parent);
            if !source.is_dir() {
                fs::remove_dir_all(&dir)?;
                return Err(StrataError::not_found(parent));
            }
            if let Err(e) = copy_tree(self.runner.as_ref(), &source, &dir) {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        }

        tracing::debug!(id, ?parent, "vfs layer created");
        Ok(())
    }

    fn remove(&self, id: &str) -> StrataResult<()> {
        let dir = self.dir(id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }

    fn get(&self, id: &str) -> StrataResult<PathBuf> {
        let dir = self.dir(id);
        if !dir.is_dir() {
            return Err(StrataError::not_found(id));
        }
        Ok(dir)
    }

    fn put(&self, _id: &str) -> StrataResult<()> {
        Ok(())
    }

    fn exists(&self, id: &str) -> bool {
        self.dir(id).is_dir()
    }

    fn apply_diff(&self, id: &str, diff: &mut dyn Read) -> StrataResult<u64> {
        archive::apply_layer(diff, &self.get(id)?, Whiteouts::Delete)
    }
}

/// Copy the contents of `source` into `dest`, keeping ownership, modes and
/// links.
pub(crate) fn copy_tree(runner: &dyn CommandRunner, source: &Path, dest: &Path) -> StrataResult<()> {
    let from = format!("{}/.", source.display());
    let to = dest.display().to_string();
    runner.run("cp", &["-a", &from, &to])?;
    Ok(())
}
