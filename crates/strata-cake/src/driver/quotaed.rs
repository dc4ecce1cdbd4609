//! Quota enforcement on top of the overlay driver.
//!
//! A quota-limited layer gets its own fixed-size ext4 image, loop mounted
//! over the layer's diff directory before the overlay is assembled. Writes
//! into the merged view land in that image and fail once it is full.

use std::collections::HashSet;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use strata_common::{RetryPolicy, StrataError, StrataResult};

use super::{BackingStoreManager, GraphDriver, LoopMounter, OverlayDriver, QuotaedDriver, is_mountpoint};

/// Overlay driver with per-layer disk quotas.
pub struct QuotaedOverlay {
    inner: OverlayDriver,
    backing_store: Arc<dyn BackingStoreManager>,
    loop_mounter: Arc<dyn LoopMounter>,
    unmount_retry: RetryPolicy,
    // Layers whose diff directory has a backing store loop mounted on it.
    limited: Mutex<HashSet<String>>,
}

impl QuotaedOverlay {
    /// Wrap `inner`, storing quota images in `backing_store`.
    pub fn new(
        inner: OverlayDriver,
        backing_store: Arc<dyn BackingStoreManager>,
        loop_mounter: Arc<dyn LoopMounter>,
    ) -> Self {
        Self {
            inner,
            backing_store,
            loop_mounter,
            unmount_retry: RetryPolicy::within(Duration::from_secs(60), Duration::from_millis(200)),
            limited: Mutex::new(HashSet::new()),
        }
    }

    /// Override how long to wait for the merged view to go away on release.
    #[must_use]
    pub const fn with_unmount_retry(mut self, retry: RetryPolicy) -> Self {
        self.unmount_retry = retry;
        self
    }

    /// The wrapped overlay driver.
    pub const fn overlay(&self) -> &OverlayDriver {
        &self.inner
    }

    /// Mounts left behind by an earlier process are not in `limited`, so
    /// the diff directory itself is checked too.
    fn is_limited(&self, id: &str) -> bool {
        self.limited.lock().contains(id) || is_mountpoint(&self.inner.diff_path(id))
    }

    fn teardown(&self, id: &str) -> StrataResult<()> {
        let merged = self.inner.mnt_path(id);
        self.unmount_retry.run(|_| {
            if is_mountpoint(&merged) {
                Err(StrataError::Mount {
                    path: merged.display().to_string(),
                    message: "still mounted".to_string(),
                })
            } else {
                Ok(())
            }
        })?;

        self.loop_mounter.unmount(&self.inner.diff_path(id))?;
        self.backing_store.delete(id)?;
        self.limited.lock().remove(id);
        Ok(())
    }
}

impl GraphDriver for QuotaedOverlay {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn create(&self, id: &str, parent: Option<&str>) -> StrataResult<()> {
        self.inner.create(id, parent)
    }

    fn remove(&self, id: &str) -> StrataResult<()> {
        self.inner.remove(id)
    }

    fn get(&self, id: &str) -> StrataResult<PathBuf> {
        self.inner.get(id)
    }

    fn put(&self, id: &str) -> StrataResult<()> {
        if self.inner.release(id)? && self.is_limited(id) {
            self.teardown(id)?;
        }
        Ok(())
    }

    fn exists(&self, id: &str) -> bool {
        self.inner.exists(id)
    }

    fn apply_diff(&self, id: &str, diff: &mut dyn Read) -> StrataResult<u64> {
        self.inner.apply_diff(id, diff)
    }

    fn as_quotaed(&self) -> Option<&dyn QuotaedDriver> {
        Some(self)
    }
}

impl QuotaedDriver for QuotaedOverlay {
    fn get_quotaed(&self, id: &str, quota: i64) -> StrataResult<PathBuf> {
        if !self.inner.exists(id) {
            return Err(StrataError::not_found(id));
        }

        let diff = self.inner.diff_path(id);
        let image = self.backing_store.create(id, quota)?;

        if let Err(e) = self.loop_mounter.mount_file(&image, &diff) {
            if let Err(cleanup) = self.backing_store.delete(id) {
                tracing::warn!(id, error = %cleanup, "Failed to delete backing store");
            }
            return Err(e);
        }
        self.limited.lock().insert(id.to_string());

        match self.inner.get(id) {
            Ok(path) => {
                tracing::debug!(id, quota, path = %path.display(), "Quota-limited layer mounted");
                Ok(path)
            }
            Err(e) => {
                if let Err(cleanup) = self.loop_mounter.unmount(&diff) {
                    tracing::warn!(id, error = %cleanup, "Failed to unmount backing store");
                }
                if let Err(cleanup) = self.backing_store.delete(id) {
                    tracing::warn!(id, error = %cleanup, "Failed to delete backing store");
                }
                self.limited.lock().remove(id);
                Err(e)
            }
        }
    }
}
