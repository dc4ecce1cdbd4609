//! Dispatch by reference scheme.

use std::sync::Arc;

use async_trait::async_trait;
use strata_cake::LayerId;
use strata_common::StrataResult;

use crate::{Credentials, Image, Reference, RepositoryFetcher};

/// Sends local paths to one fetcher and registry references to another.
pub struct CompositeFetcher {
    local: Arc<dyn RepositoryFetcher>,
    remote: Arc<dyn RepositoryFetcher>,
}

impl CompositeFetcher {
    /// Create a dispatcher.
    pub fn new(local: Arc<dyn RepositoryFetcher>, remote: Arc<dyn RepositoryFetcher>) -> Self {
        Self { local, remote }
    }

    fn pick(&self, reference: &Reference) -> &dyn RepositoryFetcher {
        match reference {
            Reference::Local(_) => self.local.as_ref(),
            Reference::Docker(_) => self.remote.as_ref(),
        }
    }
}

#[async_trait]
impl RepositoryFetcher for CompositeFetcher {
    async fn fetch(
        &self,
        reference: &Reference,
        credentials: &Credentials,
        disk_quota: i64,
    ) -> StrataResult<Image> {
        self.pick(reference)
            .fetch(reference, credentials, disk_quota)
            .await
    }

    async fn fetch_id(&self, reference: &Reference) -> StrataResult<LayerId> {
        self.pick(reference).fetch_id(reference).await
    }
}
