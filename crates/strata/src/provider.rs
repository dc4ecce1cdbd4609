//! Wiring a configured layer store together.

use std::path::PathBuf;
use std::sync::Arc;

use strata_cake::cleaner::{Cleaner, threshold};
use strata_cake::driver::{BackingStore, GraphDriver, LoopMount, OverlayDriver, QuotaedOverlay, VfsDriver};
use strata_cake::{Cake, DriverCake, LayerId, NamespacedCake, Retainer};
use strata_common::{CommandRunner, StrataPaths, StrataResult, SystemRunner};
use strata_fetch::registry::{HttpDialer, InsecureRegistryList};
use strata_fetch::{
    CompositeFetcher, ImageRetainer, LocalFetcher, RemoteFetcher, RepositoryFetcher,
    RetryableFetcher,
};

use crate::config::{DriverKind, StrataConfig};
use crate::layer_creator::ContainerLayerCreator;
use crate::metrics::MetricsAdapter;
use crate::namespacer::{Namespacer, UidNamespacer, UidTranslator};
use crate::ordinator::CakeOrdinator;
use crate::quota::{CakeBaseSizer, DfDiffSizer, DisabledQuotaManager, DriverQuotaManager, QuotaManager};
use crate::volume::SimpleVolumeCreator;

/// A fully wired rootfs provider.
pub struct Provider {
    ordinator: CakeOrdinator,
    retainer: Arc<Retainer>,
    image_retainer: ImageRetainer,
    persistent_images: Vec<String>,
}

struct Storage {
    driver: Arc<dyn GraphDriver>,
    mount_root: PathBuf,
    quotas: bool,
}

fn storage(
    kind: DriverKind,
    paths: &StrataPaths,
    runner: &Arc<dyn CommandRunner>,
) -> StrataResult<Storage> {
    let root = paths.driver(&kind.to_string());
    match kind {
        DriverKind::Vfs => Ok(Storage {
            driver: Arc::new(VfsDriver::new(&root, Arc::clone(runner))?),
            mount_root: root,
            quotas: false,
        }),
        DriverKind::Overlay => {
            let overlay = OverlayDriver::new(&root)?;
            let store = BackingStore::new(paths.backing_stores(), Arc::clone(runner))?;
            let loops = LoopMount::new(Arc::clone(runner));
            Ok(Storage {
                driver: Arc::new(QuotaedOverlay::new(overlay, Arc::new(store), Arc::new(loops))),
                mount_root: root.join("mnt"),
                quotas: true,
            })
        }
    }
}

impl Provider {
    /// Build a provider from `config`, running host tools directly.
    ///
    /// # Errors
    ///
    /// Returns an error if the data directories, the driver or the registry
    /// client cannot be set up.
    pub fn build(config: &StrataConfig) -> StrataResult<Self> {
        Self::with_runner(config, Arc::new(SystemRunner))
    }

    /// Build a provider running host tools through `runner`.
    ///
    /// # Errors
    ///
    /// See [`Provider::build`].
    pub fn with_runner(config: &StrataConfig, runner: Arc<dyn CommandRunner>) -> StrataResult<Self> {
        let paths = config.paths();
        paths.create_dirs()?;

        let storage = storage(config.driver, &paths, &runner)?;
        let cake: Arc<dyn Cake> = Arc::new(NamespacedCake::new(
            DriverCake::open(paths.layer_records(), storage.driver)?,
            paths.metadata(),
            Arc::clone(&runner),
        ));
        tracing::info!(driver = %config.driver, root = %paths.root.display(), "Layer graph opened");

        let dialer = HttpDialer::new(InsecureRegistryList::new(&config.registry.insecure))?;
        let remote: Arc<dyn RepositoryFetcher> = Arc::new(RetryableFetcher::new(RemoteFetcher::new(
            Arc::clone(&cake),
            Arc::new(dialer),
            config.registry.default_host.clone(),
            paths.downloads(),
        )));
        let local: Arc<dyn RepositoryFetcher> = Arc::new(LocalFetcher::new(
            Arc::clone(&cake),
            config.default_rootfs.clone(),
        ));
        let fetcher = Arc::new(CompositeFetcher::new(local, Arc::clone(&remote)));

        let (uid_mappings, gid_mappings) = config.namespace.mappings();
        let namespacer: Arc<dyn Namespacer> = Arc::new(UidNamespacer::new(Arc::new(
            UidTranslator::new(uid_mappings, gid_mappings),
        )));

        let retainer = Arc::new(Retainer::new());
        let image_retainer =
            ImageRetainer::new(Arc::clone(&retainer), remote, namespacer.cache_key());
        let cleaner = Cleaner::new(threshold(config.gc.threshold_bytes()?), retainer.clone());

        let quota: Arc<dyn QuotaManager> = if storage.quotas {
            Arc::new(DriverQuotaManager::new(
                Arc::new(CakeBaseSizer::new(Arc::clone(&cake))),
                Arc::new(DfDiffSizer::new(Arc::clone(&runner))),
            ))
        } else {
            Arc::new(DisabledQuotaManager)
        };
        let mount_root = storage.mount_root;
        let metrics = MetricsAdapter::new(quota, move |id: &LayerId| mount_root.join(id.graph_id()));

        let layer_creator = ContainerLayerCreator::new(
            Arc::clone(&cake),
            Arc::new(SimpleVolumeCreator),
            namespacer,
        );

        Ok(Self {
            ordinator: CakeOrdinator::new(
                cake,
                fetcher,
                Arc::new(layer_creator),
                Arc::new(metrics),
                Arc::new(cleaner),
            ),
            retainer,
            image_retainer,
            persistent_images: config.persistent_images.clone(),
        })
    }

    /// The ordinator serving requests.
    pub const fn ordinator(&self) -> &CakeOrdinator {
        &self.ordinator
    }

    /// The layer graph.
    pub fn cake(&self) -> &Arc<dyn Cake> {
        self.ordinator.cake()
    }

    /// The retain set consulted by garbage collection.
    pub const fn retainer(&self) -> &Arc<Retainer> {
        &self.retainer
    }

    /// Pin the configured persistent images. Run once at startup, before
    /// any garbage collection.
    pub async fn retain_persistent_images(&self) -> Vec<LayerId> {
        self.image_retainer.retain(&self.persistent_images).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::RootfsSpec;
    use std::fs;

    fn config(root: &std::path::Path) -> StrataConfig {
        StrataConfig {
            graph_root: Some(root.join("data")),
            default_rootfs: Some(root.join("rootfs")),
            ..StrataConfig::default()
        }
    }

    #[tokio::test]
    async fn vfs_provider_serves_default_rootfs() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("rootfs/etc")).unwrap();
        fs::write(dir.path().join("rootfs/etc/hostname"), "strata").unwrap();

        let provider = Provider::build(&config(dir.path())).unwrap();
        let rootfs = provider
            .ordinator()
            .create("container-1", &RootfsSpec::default())
            .await
            .unwrap();

        assert!(rootfs.root_path.join("etc/hostname").exists());
        assert_eq!(provider.cake().all().len(), 2);

        let usage = provider.ordinator().metrics("container-1").await.unwrap();
        assert_eq!(usage.total_bytes_used, 0);

        provider.ordinator().destroy("container-1").await.unwrap();
        provider.ordinator().destroy("container-1").await.unwrap();
        assert_eq!(provider.cake().all().len(), 1);
    }

    #[tokio::test]
    async fn local_persistent_images_are_retained() {
        let dir = tempfile::tempdir().unwrap();
        let rootfs = dir.path().join("rootfs");
        fs::create_dir_all(&rootfs).unwrap();

        let mut config = config(dir.path());
        config.persistent_images = vec![rootfs.display().to_string()];
        let provider = Provider::build(&config).unwrap();

        let retained = provider.retain_persistent_images().await;
        assert_eq!(retained.len(), 1);
        assert_eq!(provider.retainer().len(), 2);
    }
}
