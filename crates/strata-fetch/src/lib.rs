//! Rootfs fetchers for Strata.
//!
//! A rootfs reference names either a directory on the host or an image in a
//! registry. Fetching it registers every layer it consists of in the cake
//! and returns an [`Image`] describing the top layer.
//!
//! - [`LocalFetcher`] imports host directories
//! - [`RemoteFetcher`] pulls registry images, downloading each blob at most
//!   once at a time
//! - [`CompositeFetcher`] picks one of the two by reference scheme
//! - [`RetryableFetcher`] retries any fetcher a bounded number of times

pub mod composite;
pub mod credentials;
pub mod digest;
pub mod local;
pub mod lock;
pub mod reference;
pub mod registry;
pub mod remote;
pub mod retainer;
pub mod retryable;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strata_cake::LayerId;
use strata_common::StrataResult;

pub use composite::CompositeFetcher;
pub use credentials::Credentials;
pub use digest::Digest;
pub use local::{LayerIdProvider, LocalFetcher};
pub use reference::{DockerReference, Reference};
pub use remote::RemoteFetcher;
pub use retainer::ImageRetainer;
pub use retryable::RetryableFetcher;

/// A fetched rootfs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    /// Graph id of the top layer.
    pub image_id: String,
    /// Environment declared by the image, as `KEY=value` entries.
    pub env: Vec<String>,
    /// Volume paths declared by the image.
    pub volumes: Vec<String>,
    /// Total size of the image in bytes.
    pub size: i64,
}

impl Image {
    /// Identity of the top layer.
    #[must_use]
    pub fn layer_id(&self) -> LayerId {
        LayerId::Image(self.image_id.clone())
    }
}

/// Resolves rootfs references into registered layers.
#[async_trait]
pub trait RepositoryFetcher: Send + Sync {
    /// Fetch `reference`, failing with `QuotaExceeded` if `disk_quota` is
    /// positive and smaller than the image.
    async fn fetch(
        &self,
        reference: &Reference,
        credentials: &Credentials,
        disk_quota: i64,
    ) -> StrataResult<Image>;

    /// Identity the top layer of `reference` would have, without fetching
    /// any layer contents.
    async fn fetch_id(&self, reference: &Reference) -> StrataResult<LayerId>;
}

/// Append the entries of `from` missing in `into`, keeping order.
pub(crate) fn merge_unique(into: &mut Vec<String>, from: &[String]) {
    for item in from {
        if !into.contains(item) {
            into.push(item.clone());
        }
    }
}
