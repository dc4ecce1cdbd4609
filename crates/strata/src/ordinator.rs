//! Serializing garbage collection against container churn.
//!
//! Creating, measuring and destroying containers all read the layer graph
//! and may run side by side. Garbage collection rewrites it, so it takes the
//! graph exclusively: a pass waits for in-flight calls to finish and holds
//! new ones back until it is done.

use std::sync::Arc;

use strata_cake::cleaner::Cleaner;
use strata_cake::{Cake, LayerId};
use strata_common::{StrataError, StrataResult};
use strata_fetch::{Credentials, Reference, RepositoryFetcher};
use tokio::sync::RwLock;
use tracing::Instrument;

use crate::layer_creator::{LayerCreator, Rootfs};
use crate::metrics::Metricser;
use crate::quota::DiskStat;
use crate::spec::RootfsSpec;

/// Runs a garbage collection pass over a cake.
pub trait GarbageCollector: Send + Sync {
    /// Collect unused layers in `cake`.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the pass.
    fn gc(&self, cake: &dyn Cake) -> StrataResult<()>;
}

impl GarbageCollector for Cleaner {
    fn gc(&self, cake: &dyn Cake) -> StrataResult<()> {
        Self::gc(self, cake)
    }
}

/// Front door to the layer graph. There should be one per cake.
pub struct CakeOrdinator {
    lock: RwLock<()>,
    cake: Arc<dyn Cake>,
    fetcher: Arc<dyn RepositoryFetcher>,
    layer_creator: Arc<dyn LayerCreator>,
    metrics: Arc<dyn Metricser>,
    gc: Arc<dyn GarbageCollector>,
}

async fn blocking<T: Send + 'static>(
    task: impl FnOnce() -> StrataResult<T> + Send + 'static,
) -> StrataResult<T> {
    tokio::task::spawn_blocking(task)
        .await
        .map_err(|e| StrataError::internal(format!("blocking task failed: {e}")))?
}

impl CakeOrdinator {
    /// Create an ordinator.
    pub fn new(
        cake: Arc<dyn Cake>,
        fetcher: Arc<dyn RepositoryFetcher>,
        layer_creator: Arc<dyn LayerCreator>,
        metrics: Arc<dyn Metricser>,
        gc: Arc<dyn GarbageCollector>,
    ) -> Self {
        Self {
            lock: RwLock::new(()),
            cake,
            fetcher,
            layer_creator,
            metrics,
            gc,
        }
    }

    /// The cake being coordinated.
    pub fn cake(&self) -> &Arc<dyn Cake> {
        &self.cake
    }

    /// Fetch the image named by `spec` and create the container layer `id`
    /// on top of it.
    ///
    /// # Errors
    ///
    /// Returns the first fetch or layer-creation error. Callers should
    /// `destroy` the container afterwards to release anything created before
    /// the failure.
    pub async fn create(&self, id: &str, spec: &RootfsSpec) -> StrataResult<Rootfs> {
        let span = tracing::info_span!("create", id);
        async {
            tracing::info!("start");
            let _guard = self.lock.read().await;
            tracing::info!("lock-acquired");

            let reference = Reference::parse(&spec.rootfs)?;
            let credentials = Credentials::new(spec.username.clone(), spec.password.clone());
            let image = self
                .fetcher
                .fetch(&reference, &credentials, spec.fetcher_quota())
                .await?;

            let creator = Arc::clone(&self.layer_creator);
            let id = id.to_string();
            let spec = spec.clone();
            let rootfs = blocking(move || creator.create(&id, &image, &spec)).await?;

            tracing::info!("finished");
            Ok(rootfs)
        }
        .instrument(span)
        .await
    }

    /// Disk usage of container `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the usage cannot be determined.
    pub async fn metrics(&self, id: &str) -> StrataResult<DiskStat> {
        let span = tracing::info_span!("metrics", id);
        async {
            let _guard = self.lock.read().await;
            let metrics = Arc::clone(&self.metrics);
            let layer = LayerId::Container(id.to_string());
            blocking(move || metrics.metrics(&layer)).await
        }
        .instrument(span)
        .await
    }

    /// Remove the layer of container `id`. Destroying a container whose
    /// layer is already gone succeeds.
    ///
    /// # Errors
    ///
    /// Returns an error if the layer exists but cannot be removed.
    pub async fn destroy(&self, id: &str) -> StrataResult<()> {
        let span = tracing::info_span!("destroy", id);
        async {
            tracing::info!("start");
            let _guard = self.lock.read().await;

            let cake = Arc::clone(&self.cake);
            let layer = LayerId::Container(id.to_string());
            blocking(move || {
                if let Err(e) = cake.get(&layer) {
                    tracing::info!(graph_id = %layer.graph_id(), error = %e, "layer-already-deleted-skipping");
                    return Ok(());
                }
                cake.remove(&layer)
            })
            .await?;

            tracing::info!("finished");
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// Run a garbage collection pass with exclusive access to the graph.
    ///
    /// # Errors
    ///
    /// Returns the error that stopped the pass.
    pub async fn gc(&self) -> StrataResult<()> {
        let span = tracing::info_span!("gc");
        async {
            tracing::info!("start");
            let _guard = self.lock.write().await;
            tracing::info!("lock-acquired");

            let gc = Arc::clone(&self.gc);
            let cake = Arc::clone(&self.cake);
            blocking(move || gc.gc(cake.as_ref())).await?;

            tracing::info!("finished");
            Ok(())
        }
        .instrument(span)
        .await
    }
}
