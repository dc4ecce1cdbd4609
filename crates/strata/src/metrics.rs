//! Per-container disk metrics.

use std::path::PathBuf;
use std::sync::Arc;

use strata_cake::LayerId;
use strata_common::StrataResult;

use crate::quota::{DiskStat, QuotaManager};

/// Reports disk usage for a container layer.
pub trait Metricser: Send + Sync {
    /// Usage of the layer `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the usage cannot be determined.
    fn metrics(&self, id: &LayerId) -> StrataResult<DiskStat>;
}

type IdToPath = dyn Fn(&LayerId) -> PathBuf + Send + Sync;

/// Adapts a [`QuotaManager`], which works on mount paths, to layer ids.
pub struct MetricsAdapter {
    quota: Arc<dyn QuotaManager>,
    id_to_path: Box<IdToPath>,
}

impl MetricsAdapter {
    /// Adapter resolving ids to mount paths with `id_to_path`.
    pub fn new(
        quota: Arc<dyn QuotaManager>,
        id_to_path: impl Fn(&LayerId) -> PathBuf + Send + Sync + 'static,
    ) -> Self {
        Self {
            quota,
            id_to_path: Box::new(id_to_path),
        }
    }
}

impl Metricser for MetricsAdapter {
    fn metrics(&self, id: &LayerId) -> StrataResult<DiskStat> {
        self.quota.get_usage(&(self.id_to_path)(id))
    }
}
