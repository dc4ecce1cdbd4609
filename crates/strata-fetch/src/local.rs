//! Importing host directories as layers.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use strata_cake::{Cake, LayerId, LayerRecord, archive};
use strata_common::{StrataError, StrataResult};
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::{Credentials, Image, Reference, RepositoryFetcher};

/// Derives layer identities for host directories.
#[derive(Debug, Clone, Copy, Default)]
pub struct LayerIdProvider;

impl LayerIdProvider {
    /// Identity of the directory at `path`, after following one symlink.
    ///
    /// The directory's modification time is part of the identity; if it
    /// cannot be read the identity uses the zero time.
    #[must_use]
    pub fn provide(&self, path: &Path) -> LayerId {
        let path = resolve_symlink(path);
        let modified = fs::metadata(&path).and_then(|m| m.modified()).ok();
        LayerId::Local { path, modified }
    }
}

fn resolve_symlink(path: &Path) -> PathBuf {
    match fs::read_link(path) {
        Ok(target) if target.is_relative() => path
            .parent()
            .map_or_else(|| target.clone(), |parent| parent.join(&target)),
        Ok(target) => target,
        Err(_) => path.to_path_buf(),
    }
}

/// Imports host directories, at most one at a time.
pub struct LocalFetcher {
    cake: Arc<dyn Cake>,
    default_rootfs: Option<PathBuf>,
    id_provider: LayerIdProvider,
    import_lock: Mutex<()>,
}

impl LocalFetcher {
    /// Create a fetcher registering into `cake`. Empty references resolve to
    /// `default_rootfs`.
    pub fn new(cake: Arc<dyn Cake>, default_rootfs: Option<PathBuf>) -> Self {
        Self {
            cake,
            default_rootfs: default_rootfs.filter(|p| !p.as_os_str().is_empty()),
            id_provider: LayerIdProvider,
            import_lock: Mutex::new(()),
        }
    }

    fn path_of(&self, reference: &Reference) -> StrataResult<PathBuf> {
        let Reference::Local(path) = reference else {
            return Err(StrataError::InvalidReference {
                reference: reference.to_string(),
                reason: "not a local path".to_string(),
            });
        };

        if !path.as_os_str().is_empty() {
            return Ok(path.clone());
        }
        self.default_rootfs
            .clone()
            .ok_or_else(|| StrataError::InvalidReference {
                reference: String::new(),
                reason: "RootFSPath: is a required parameter, since no default rootfs was provided to the server."
                    .to_string(),
            })
    }
}

#[async_trait]
impl RepositoryFetcher for LocalFetcher {
    async fn fetch(
        &self,
        reference: &Reference,
        _credentials: &Credentials,
        _disk_quota: i64,
    ) -> StrataResult<Image> {
        let path = self.path_of(reference)?;
        let id = self.id_provider.provide(&path);
        let graph_id = id.graph_id();
        let span = tracing::info_span!("fetch", path = %path.display(), graph_id = %graph_id);

        async move {
            let _guard = self.import_lock.lock().await;

            if let Ok(record) = self.cake.get(&id) {
                tracing::debug!("Using cached local layer");
                return Ok(Image {
                    image_id: graph_id,
                    size: record.size,
                    ..Image::default()
                });
            }

            let LayerId::Local { path: source, .. } = &id else {
                return Err(StrataError::internal("local fetch produced a non-local id"));
            };
            let source = source.clone();
            let cake = Arc::clone(&self.cake);
            let record_id = graph_id.clone();

            let record = tokio::task::spawn_blocking(move || {
                let packed = archive::pack_dir(&source)?;
                cake.register(LayerRecord::new(&record_id), Some(&mut packed.as_slice()))?;
                cake.get(&LayerId::Image(record_id))
            })
            .await
            .map_err(|e| StrataError::internal(format!("import task failed: {e}")))??;

            tracing::info!(size = record.size, "Imported local rootfs");
            Ok(Image {
                image_id: graph_id,
                size: record.size,
                ..Image::default()
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_id(&self, reference: &Reference) -> StrataResult<LayerId> {
        Ok(self.id_provider.provide(&self.path_of(reference)?))
    }
}
