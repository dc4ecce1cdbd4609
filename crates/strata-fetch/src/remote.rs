//! Pulling images from registries.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use strata_cake::{Cake, LayerId, LayerRecord};
use strata_common::{StrataError, StrataResult};
use tracing::Instrument;

use crate::digest::verify_blob;
use crate::lock::FetchLock;
use crate::reference::{DockerReference, ResolvedReference};
use crate::registry::{Conn, Dialer, ManifestLayer};
use crate::{Credentials, Image, Reference, RepositoryFetcher, merge_unique};

/// Fetches `docker://` references.
pub struct RemoteFetcher {
    cake: Arc<dyn Cake>,
    dialer: Arc<dyn Dialer>,
    default_host: String,
    downloads: PathBuf,
    locks: FetchLock,
}

impl RemoteFetcher {
    /// Create a fetcher registering into `cake`. Blobs are staged in
    /// `downloads` while they are verified.
    pub fn new(
        cake: Arc<dyn Cake>,
        dialer: Arc<dyn Dialer>,
        default_host: impl Into<String>,
        downloads: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cake,
            dialer,
            default_host: default_host.into(),
            downloads: downloads.into(),
            locks: FetchLock::new(),
        }
    }

    /// Share the blob lock table with another fetcher.
    #[must_use]
    pub fn with_locks(mut self, locks: FetchLock) -> Self {
        self.locks = locks;
        self
    }

    fn resolve(&self, reference: &Reference) -> StrataResult<ResolvedReference> {
        match reference {
            Reference::Docker(docker) => Ok(DockerReference::resolve(docker, &self.default_host)),
            Reference::Local(_) => Err(StrataError::InvalidReference {
                reference: reference.to_string(),
                reason: "not a registry reference".to_string(),
            }),
        }
    }

    async fn fetch_layer(&self, conn: &dyn Conn, layer: &ManifestLayer) -> StrataResult<()> {
        let _guard = self.locks.acquire(layer.blob_sum.to_string()).await;

        let id = LayerId::Image(layer.strong_id.clone());
        if self.cake.get(&id).is_ok() {
            tracing::debug!("Layer already present");
            return Ok(());
        }

        let stream = conn.get_blob(&layer.blob_sum).await?;
        let blob = verify_blob(stream, &layer.blob_sum, &self.downloads).await?;
        tracing::debug!(bytes = blob.size(), "Blob verified");

        let record = LayerRecord::new(&layer.strong_id)
            .with_parent(&layer.parent_strong_id)
            .with_size(layer.size);
        let cake = Arc::clone(&self.cake);

        tokio::task::spawn_blocking(move || {
            let mut reader = blob.reader()?;
            cake.register(record, Some(&mut reader))
        })
        .await
        .map_err(|e| StrataError::internal(format!("register task failed: {e}")))??;

        tracing::info!("Layer registered");
        Ok(())
    }
}

#[async_trait]
impl RepositoryFetcher for RemoteFetcher {
    async fn fetch(
        &self,
        reference: &Reference,
        credentials: &Credentials,
        disk_quota: i64,
    ) -> StrataResult<Image> {
        let resolved = self.resolve(reference)?;
        let span = tracing::info_span!(
            "fetch",
            host = %resolved.host,
            repository = %resolved.repository,
            tag = %resolved.tag,
        );

        async move {
            let conn = self
                .dialer
                .dial(&resolved.host, &resolved.repository, credentials)
                .await?;
            let manifest = conn.get_manifest(&resolved.tag).await?;

            let size = manifest.total_size();
            if disk_quota > 0 && size > disk_quota {
                return Err(StrataError::QuotaExceeded {
                    required: size,
                    quota: disk_quota,
                });
            }

            let top = manifest.top().ok_or_else(|| StrataError::Upstream {
                registry: resolved.host.clone(),
                repository: resolved.repository.clone(),
                message: "manifest has no layers".to_string(),
            })?;

            let mut env = Vec::new();
            let mut volumes = Vec::new();
            for layer in &manifest.layers {
                let span = tracing::debug_span!(
                    "fetch-layer",
                    blob = %layer.blob_sum,
                    graph_id = %layer.strong_id,
                );
                self.fetch_layer(conn.as_ref(), layer).instrument(span).await?;
                merge_unique(&mut env, &layer.env);
                merge_unique(&mut volumes, &layer.volumes);
            }

            tracing::info!(image_id = %top.strong_id, size, "Image fetched");
            Ok(Image {
                image_id: top.strong_id.clone(),
                env,
                volumes,
                size,
            })
        }
        .instrument(span)
        .await
    }

    async fn fetch_id(&self, reference: &Reference) -> StrataResult<LayerId> {
        let resolved = self.resolve(reference)?;
        let conn = self
            .dialer
            .dial(&resolved.host, &resolved.repository, &Credentials::default())
            .await?;
        let manifest = conn.get_manifest(&resolved.tag).await?;
        manifest
            .top()
            .map(|top| LayerId::Image(top.strong_id.clone()))
            .ok_or_else(|| StrataError::Upstream {
                registry: resolved.host,
                repository: resolved.repository,
                message: "manifest has no layers".to_string(),
            })
    }
}
