//! Pinning configured images against garbage collection.

use std::sync::Arc;

use strata_cake::{LayerId, Retainer};

use crate::local::LayerIdProvider;
use crate::{Reference, RepositoryFetcher};

/// Resolves rootfs URLs to layer ids and pins them, along with their
/// namespaced clones.
pub struct ImageRetainer {
    retainer: Arc<Retainer>,
    remote: Arc<dyn RepositoryFetcher>,
    id_provider: LayerIdProvider,
    cache_key: String,
}

impl ImageRetainer {
    /// Pin into `retainer`. Registry ids are resolved through `remote`;
    /// namespaced clones are identified by `cache_key`.
    pub fn new(
        retainer: Arc<Retainer>,
        remote: Arc<dyn RepositoryFetcher>,
        cache_key: impl Into<String>,
    ) -> Self {
        Self {
            retainer,
            remote,
            id_provider: LayerIdProvider,
            cache_key: cache_key.into(),
        }
    }

    /// Pin every image in `urls`. URLs that cannot be parsed or resolved are
    /// logged and skipped. Returns the pinned top-layer ids.
    pub async fn retain(&self, urls: &[String]) -> Vec<LayerId> {
        let mut retained = Vec::new();

        for url in urls {
            let reference = match Reference::parse(url) {
                Ok(reference) => reference,
                Err(e) => {
                    tracing::warn!(url, error = %e, "Skipping unparsable persistent image");
                    continue;
                }
            };

            let id = match &reference {
                Reference::Local(path) => self.id_provider.provide(path),
                Reference::Docker(_) => match self.remote.fetch_id(&reference).await {
                    Ok(id) => id,
                    Err(e) => {
                        tracing::warn!(url, error = %e, "Skipping unresolvable persistent image");
                        continue;
                    }
                },
            };

            self.retainer.retain(&id);
            self.retainer
                .retain(&LayerId::namespaced(id.clone(), self.cache_key.clone()));
            tracing::info!(url, graph_id = %id.graph_id(), "Image retained");
            retained.push(id);
        }

        retained
    }
}
