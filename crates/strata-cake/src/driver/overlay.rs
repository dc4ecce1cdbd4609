//! OverlayFS driver.
//!
//! Layout under the driver root:
//!
//! ```text
//! diff/<id>/upper   files added by the layer
//! diff/<id>/work    overlayfs scratch space
//! mnt/<id>          merged view while the layer is mounted
//! parents/<id>      id of the parent layer, if any
//! ```
//!
//! `diff/<id>` is the unit that quota enforcement replaces with a loop
//! mounted filesystem, which is why the upper and work directories both
//! live inside it.

use std::collections::{HashMap, HashSet};
use std::ffi::CString;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use strata_common::{StrataError, StrataResult};

use super::{GraphDriver, is_mountpoint};
use crate::archive::{self, Whiteouts};

/// Driver stacking layers with overlayfs.
pub struct OverlayDriver {
    root: PathBuf,
    mounts: Mutex<HashMap<String, usize>>,
}

impl OverlayDriver {
    /// Create a driver rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the layout directories cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> StrataResult<Self> {
        let root = root.into();
        for sub in ["diff", "mnt", "parents"] {
            fs::create_dir_all(root.join(sub))?;
        }
        Ok(Self {
            root,
            mounts: Mutex::new(HashMap::new()),
        })
    }

    /// Directory holding everything the layer itself contributes.
    pub fn diff_path(&self, id: &str) -> PathBuf {
        self.root.join("diff").join(id)
    }

    /// Mount point of the merged view.
    pub fn mnt_path(&self, id: &str) -> PathBuf {
        self.root.join("mnt").join(id)
    }

    fn upper_dir(&self, id: &str) -> PathBuf {
        self.diff_path(id).join("upper")
    }

    fn work_dir(&self, id: &str) -> PathBuf {
        self.diff_path(id).join("work")
    }

    fn parent_file(&self, id: &str) -> PathBuf {
        self.root.join("parents").join(id)
    }

    fn read_parent(&self, id: &str) -> StrataResult<Option<String>> {
        match fs::read_to_string(self.parent_file(id)) {
            Ok(parent) => {
                let parent = parent.trim();
                Ok((!parent.is_empty()).then(|| parent.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Upper directories of every ancestor, nearest first.
    fn lower_dirs(&self, id: &str) -> StrataResult<Vec<PathBuf>> {
        let mut lowers = Vec::new();
        let mut seen = HashSet::new();
        let mut current = id.to_string();

        while let Some(parent) = self.read_parent(&current)? {
            if !seen.insert(parent.clone()) {
                return Err(StrataError::internal(format!(
                    "parent cycle at layer {parent}"
                )));
            }
            lowers.push(self.upper_dir(&parent));
            current = parent;
        }

        Ok(lowers)
    }

    fn mount(&self, id: &str, lowers: &[PathBuf]) -> StrataResult<PathBuf> {
        use rustix::mount::{MountFlags, mount};

        let upper = self.upper_dir(id);
        let work = self.work_dir(id);
        let merged = self.mnt_path(id);
        fs::create_dir_all(&upper)?;
        fs::create_dir_all(&work)?;
        fs::create_dir_all(&merged)?;

        let lower = lowers
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower,
            upper.display(),
            work.display()
        );

        tracing::debug!(merged = %merged.display(), options = %options, "Mounting overlayfs");

        let options_c = CString::new(options.as_str()).map_err(|_| StrataError::Mount {
            path: merged.display().to_string(),
            message: "overlay options contain a null byte".to_string(),
        })?;

        mount(
            "overlay",
            &merged,
            c"overlay",
            MountFlags::empty(),
            options_c.as_c_str(),
        )
        .map_err(|e| StrataError::Mount {
            path: merged.display().to_string(),
            message: e.to_string(),
        })?;

        Ok(merged)
    }

    /// Drop one reference to the layer's mount, returning true once nothing
    /// holds it any more.
    ///
    /// # Errors
    ///
    /// Returns an error if the merged view cannot be unmounted.
    pub fn release(&self, id: &str) -> StrataResult<bool> {
        let mut mounts = self.mounts.lock();
        if let Some(count) = mounts.get_mut(id) {
            if *count > 1 {
                *count -= 1;
                return Ok(false);
            }
            mounts.remove(id);
        }

        let merged = self.mnt_path(id);
        if is_mountpoint(&merged) {
            use rustix::mount::{UnmountFlags, unmount};

            tracing::debug!(merged = %merged.display(), "Unmounting overlayfs");
            unmount(&merged, UnmountFlags::DETACH).map_err(|e| StrataError::Mount {
                path: merged.display().to_string(),
                message: e.to_string(),
            })?;
        }

        Ok(true)
    }
}

impl GraphDriver for OverlayDriver {
    fn name(&self) -> &str {
        "overlay"
    }

    fn create(&self, id: &str, parent: Option<&str>) -> StrataResult<()> {
        if let Some(parent) = parent.filter(|p| !self.exists(p)) {
            return Err(StrataError::not_found(parent));
        }

        fs::create_dir_all(self.upper_dir(id))?;
        fs::create_dir_all(self.work_dir(id))?;
        fs::create_dir_all(self.mnt_path(id))?;
        if let Some(parent) = parent {
            fs::write(self.parent_file(id), parent)?;
        }

        tracing::debug!(id, ?parent, "overlay layer created");
        Ok(())
    }

    fn remove(&self, id: &str) -> StrataResult<()> {
        remove_if_present(&self.diff_path(id))?;
        remove_if_present(&self.mnt_path(id))?;
        match fs::remove_file(self.parent_file(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn get(&self, id: &str) -> StrataResult<PathBuf> {
        if !self.exists(id) {
            return Err(StrataError::not_found(id));
        }

        let mut mounts = self.mounts.lock();
        let lowers = self.lower_dirs(id)?;

        if let Some(count) = mounts.get_mut(id) {
            *count += 1;
        } else {
            // A layer without ancestors has nothing to merge with.
            if lowers.is_empty() {
                fs::create_dir_all(self.upper_dir(id))?;
            } else {
                self.mount(id, &lowers)?;
            }
            mounts.insert(id.to_string(), 1);
        }

        if lowers.is_empty() {
            Ok(self.upper_dir(id))
        } else {
            Ok(self.mnt_path(id))
        }
    }

    fn put(&self, id: &str) -> StrataResult<()> {
        self.release(id).map(|_| ())
    }

    fn exists(&self, id: &str) -> bool {
        self.diff_path(id).is_dir()
    }

    fn apply_diff(&self, id: &str, diff: &mut dyn Read) -> StrataResult<u64> {
        if !self.exists(id) {
            return Err(StrataError::not_found(id));
        }
        archive::apply_layer(diff, &self.upper_dir(id), Whiteouts::Overlay)
    }
}

fn remove_if_present(path: &Path) -> StrataResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
