//! Disk usage accounting.
//!
//! A container's usage has two parts: what it wrote itself (its diff layer,
//! which lives on a quota-sized loop filesystem) and the image underneath.
//! [`DriverQuotaManager`] measures the first with `df` and sums the second
//! from the recorded layer sizes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use strata_cake::{Cake, LayerId};
use strata_common::{CommandRunner, StrataError, StrataResult};

/// Disk usage of one container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStat {
    /// Bytes written by the container itself.
    pub exclusive_bytes_used: u64,
    /// Exclusive bytes plus the size of the image below.
    pub total_bytes_used: u64,
}

/// Reports disk usage for container root filesystems.
pub trait QuotaManager: Send + Sync {
    /// Usage of the container mounted at `rootfs`.
    ///
    /// # Errors
    ///
    /// Returns an error if either part of the usage cannot be determined.
    fn get_usage(&self, rootfs: &Path) -> StrataResult<DiskStat>;
}

/// Sums the sizes of the layers below a container.
pub trait BaseSizer: Send + Sync {
    /// Size of the layer mounted at `rootfs` plus all its ancestors.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first layer in the chain that is missing.
    fn base_size(&self, rootfs: &Path) -> StrataResult<u64>;
}

/// Measures what a container wrote.
pub trait DiffSizer: Send + Sync {
    /// Bytes used by the writable layer of the container at `rootfs`.
    ///
    /// # Errors
    ///
    /// Returns an error if `rootfs` does not exist or cannot be measured.
    fn diff_size(&self, rootfs: &Path) -> StrataResult<u64>;
}

/// Quota manager for drivers that cannot enforce quotas.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledQuotaManager;

impl QuotaManager for DisabledQuotaManager {
    fn get_usage(&self, _rootfs: &Path) -> StrataResult<DiskStat> {
        Ok(DiskStat::default())
    }
}

/// Quota manager combining a [`BaseSizer`] and a [`DiffSizer`].
pub struct DriverQuotaManager {
    base: Arc<dyn BaseSizer>,
    diff: Arc<dyn DiffSizer>,
}

impl DriverQuotaManager {
    /// Create a manager from its two halves.
    pub fn new(base: Arc<dyn BaseSizer>, diff: Arc<dyn DiffSizer>) -> Self {
        Self { base, diff }
    }
}

impl QuotaManager for DriverQuotaManager {
    fn get_usage(&self, rootfs: &Path) -> StrataResult<DiskStat> {
        let base = self.base.base_size(rootfs)?;
        let diff = self.diff.diff_size(rootfs)?;

        Ok(DiskStat {
            exclusive_bytes_used: diff,
            total_bytes_used: diff + base,
        })
    }
}

/// [`BaseSizer`] reading layer sizes from the cake. The final component of
/// the rootfs path is the graph id of the container layer.
pub struct CakeBaseSizer {
    cake: Arc<dyn Cake>,
}

impl CakeBaseSizer {
    /// Sizer reading records from `cake`.
    pub fn new(cake: Arc<dyn Cake>) -> Self {
        Self { cake }
    }
}

impl BaseSizer for CakeBaseSizer {
    fn base_size(&self, rootfs: &Path) -> StrataResult<u64> {
        let mut size = 0u64;
        let mut graph_id = rootfs
            .file_name()
            .map(|name| name.to_string_lossy().into_owned());

        while let Some(id) = graph_id.take() {
            let record = self
                .cake
                .get(&LayerId::Image(id.clone()))
                .map_err(|e| StrataError::internal(format!("base-size {id}: {e}")))?;

            tracing::debug!(layer = %id, size = record.size, total = size, "base-size");
            size += u64::try_from(record.size).unwrap_or(0);
            graph_id = record.parent;
        }

        Ok(size)
    }
}

/// Maps a container mount point `<graph>/mnt/<id>` to its diff directory
/// `<graph>/diff/<id>`.
#[must_use]
pub fn diff_path(rootfs: &Path) -> PathBuf {
    match (
        rootfs.parent().and_then(Path::parent),
        rootfs.file_name(),
    ) {
        (Some(graph), Some(id)) => graph.join("diff").join(id),
        _ => rootfs.to_path_buf(),
    }
}

/// [`DiffSizer`] running `df` on the container's diff directory, which is
/// the mount point of its quota filesystem.
pub struct DfDiffSizer {
    runner: Arc<dyn CommandRunner>,
}

impl DfDiffSizer {
    /// Sizer running `df` through `runner`.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl DiffSizer for DfDiffSizer {
    fn diff_size(&self, rootfs: &Path) -> StrataResult<u64> {
        if !rootfs.exists() {
            return Err(StrataError::not_found(rootfs.display().to_string()));
        }

        let diff = diff_path(rootfs);
        let span = tracing::debug_span!("diff-size", path = %diff.display());
        let _enter = span.enter();

        let diff_arg = diff.to_string_lossy();
        let output = self.runner.run("df", &["-B", "1", &diff_arg])?;

        let used = output
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| line.split_whitespace().nth(2))
            .and_then(|column| column.parse::<u64>().ok());

        match used {
            Some(bytes) => {
                tracing::debug!(bytes, "finished");
                Ok(bytes)
            }
            None => {
                tracing::warn!(output = %output.trim(), "Could not parse df output");
                Ok(0)
            }
        }
    }
}
