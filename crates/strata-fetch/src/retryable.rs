//! Bounded retries around a fetcher.

use async_trait::async_trait;
use strata_cake::LayerId;
use strata_common::{RetryPolicy, StrataResult};

use crate::{Credentials, Image, Reference, RepositoryFetcher};

/// Attempts made before a fetch failure is reported.
pub const MAX_ATTEMPTS: u32 = 3;

/// Retries the wrapped fetcher, returning the last error if every attempt
/// fails.
pub struct RetryableFetcher<F> {
    inner: F,
    policy: RetryPolicy,
}

impl<F: RepositoryFetcher> RetryableFetcher<F> {
    /// Retry `inner` up to [`MAX_ATTEMPTS`] times.
    pub const fn new(inner: F) -> Self {
        Self {
            inner,
            policy: RetryPolicy::immediate(MAX_ATTEMPTS),
        }
    }

    /// Use a custom policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }
}

#[async_trait]
impl<F: RepositoryFetcher> RepositoryFetcher for RetryableFetcher<F> {
    async fn fetch(
        &self,
        reference: &Reference,
        credentials: &Credentials,
        disk_quota: i64,
    ) -> StrataResult<Image> {
        let inner = &self.inner;
        let of = self.policy.max_attempts;
        self.policy
            .run_async(|attempt| async move {
                inner
                    .fetch(reference, credentials, disk_quota)
                    .await
                    .inspect_err(|e| {
                        tracing::warn!(%reference, attempt, of, error = %e, "failed-to-fetch");
                    })
            })
            .await
    }

    async fn fetch_id(&self, reference: &Reference) -> StrataResult<LayerId> {
        let inner = &self.inner;
        let of = self.policy.max_attempts;
        self.policy
            .run_async(|attempt| async move {
                inner.fetch_id(reference).await.inspect_err(|e| {
                    tracing::warn!(%reference, attempt, of, error = %e, "failed-to-fetch-id");
                })
            })
            .await
    }
}
