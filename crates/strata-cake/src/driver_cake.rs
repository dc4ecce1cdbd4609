//! A layer graph stored through a graph driver.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use strata_common::{RetryPolicy, StrataError, StrataResult};

use crate::cake::{Cake, LayerRecord};
use crate::driver::GraphDriver;
use crate::graph::Graph;
use crate::id::LayerId;

/// Mount lookups are retried this many times before giving up.
const PATH_ATTEMPTS: u32 = 5;

/// [`Cake`] keeping metadata in a [`Graph`] and contents in a driver.
pub struct DriverCake {
    graph: Graph,
    driver: Arc<dyn GraphDriver>,
    path_retry: RetryPolicy,
}

impl DriverCake {
    /// Open the cake whose metadata lives in `records`.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata cannot be loaded.
    pub fn open(records: impl Into<PathBuf>, driver: Arc<dyn GraphDriver>) -> StrataResult<Self> {
        Ok(Self {
            graph: Graph::open(records)?,
            driver,
            path_retry: RetryPolicy::immediate(PATH_ATTEMPTS),
        })
    }

    /// The underlying driver.
    pub fn driver(&self) -> &Arc<dyn GraphDriver> {
        &self.driver
    }

    fn check_new(&self, id: &str, parent: Option<&str>) -> StrataResult<()> {
        if self.graph.exists(id) {
            return Err(StrataError::AlreadyExists { id: id.to_string() });
        }
        if let Some(parent) = parent.filter(|p| !self.graph.exists(p)) {
            return Err(StrataError::not_found(parent));
        }
        Ok(())
    }

    fn require(&self, id: &str) -> StrataResult<LayerRecord> {
        self.graph.get(id).ok_or_else(|| StrataError::not_found(id))
    }

    /// Store `record` after the driver has created the layer, removing the
    /// driver's copy if that fails.
    fn commit(&self, record: LayerRecord) -> StrataResult<()> {
        let id = record.id.clone();
        if let Err(e) = self.graph.insert(record) {
            if let Err(cleanup) = self.driver.remove(&id) {
                tracing::warn!(id, error = %cleanup, "Failed to clean up layer storage");
            }
            return Err(e);
        }
        Ok(())
    }
}

impl Cake for DriverCake {
    fn driver_name(&self) -> &str {
        self.driver.name()
    }

    fn create(
        &self,
        layer: &LayerId,
        parent: Option<&LayerId>,
        container: &str,
    ) -> StrataResult<()> {
        let id = layer.graph_id();
        let parent = parent.map(LayerId::graph_id).filter(|p| !p.is_empty());
        self.check_new(&id, parent.as_deref())?;

        self.driver.create(&id, parent.as_deref())?;

        let mut record = LayerRecord::new(&id);
        record.parent = parent;
        record.container = container.to_string();
        self.commit(record)?;

        tracing::debug!(id, container, "Layer created");
        Ok(())
    }

    fn register(&self, mut record: LayerRecord, diff: Option<&mut dyn Read>) -> StrataResult<()> {
        self.check_new(&record.id, record.parent.as_deref())?;

        self.driver.create(&record.id, record.parent.as_deref())?;

        if let Some(diff) = diff {
            match self.driver.apply_diff(&record.id, diff) {
                Ok(size) => record.size = i64::try_from(size).unwrap_or(i64::MAX),
                Err(e) => {
                    if let Err(cleanup) = self.driver.remove(&record.id) {
                        tracing::warn!(id = %record.id, error = %cleanup, "Failed to clean up layer storage");
                    }
                    return Err(e);
                }
            }
        }

        tracing::debug!(id = %record.id, parent = ?record.parent, size = record.size, "Layer registered");
        self.commit(record)
    }

    fn get(&self, layer: &LayerId) -> StrataResult<LayerRecord> {
        self.require(&layer.graph_id())
    }

    fn unmount(&self, layer: &LayerId) -> StrataResult<()> {
        self.driver.put(&layer.graph_id())
    }

    fn remove(&self, layer: &LayerId) -> StrataResult<()> {
        let id = layer.graph_id();
        self.require(&id)?;
        if self.graph.has_children(&id) {
            return Err(StrataError::internal(format!(
                "layer {id} is the parent of another layer"
            )));
        }

        self.driver.put(&id)?;
        self.driver.remove(&id)?;
        self.graph.delete(&id)?;

        tracing::debug!(id, "Layer removed");
        Ok(())
    }

    fn path(&self, layer: &LayerId) -> StrataResult<PathBuf> {
        let id = layer.graph_id();
        self.require(&id)?;
        self.path_retry.run(|attempt| {
            self.driver.get(&id).inspect_err(|e| {
                tracing::debug!(id, attempt, error = %e, "Layer mount failed");
            })
        })
    }

    fn quotaed_path(&self, layer: &LayerId, quota: i64) -> StrataResult<PathBuf> {
        let id = layer.graph_id();
        self.require(&id)?;
        let driver = self
            .driver
            .as_quotaed()
            .ok_or_else(|| StrataError::QuotasUnsupported {
                driver: self.driver.name().to_string(),
            })?;
        driver.get_quotaed(&id, quota)
    }

    fn is_leaf(&self, layer: &LayerId) -> StrataResult<bool> {
        let id = layer.graph_id();
        self.require(&id)?;
        Ok(!self.graph.has_children(&id))
    }

    fn get_all_leaves(&self) -> StrataResult<Vec<LayerId>> {
        Ok(self.graph.heads().into_iter().map(LayerId::Image).collect())
    }

    fn all(&self) -> Vec<LayerRecord> {
        self.graph.all()
    }
}
