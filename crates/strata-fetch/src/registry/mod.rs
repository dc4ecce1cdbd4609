//! Registry access.
//!
//! The remote fetcher talks to registries through two small traits:
//! a [`Dialer`] opens a [`Conn`] to one repository on one registry, and the
//! connection serves manifests and blobs. [`HttpDialer`] is the real
//! implementation; tests substitute their own.

mod client;
mod insecure;
mod manifest;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use sha2::{Digest as _, Sha256};
use strata_common::StrataResult;

pub use client::{HttpConn, HttpDialer};
pub use insecure::InsecureRegistryList;
pub use manifest::{Manifest, ManifestLayer};

use crate::credentials::Credentials;
use crate::digest::Digest;

/// A stream of blob bytes.
pub type BlobStream = BoxStream<'static, StrataResult<Bytes>>;

/// Opens connections to registries.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connect to `repository` on `host`, authenticating with `credentials`
    /// when the registry asks for them.
    async fn dial(
        &self,
        host: &str,
        repository: &str,
        credentials: &Credentials,
    ) -> StrataResult<Box<dyn Conn>>;
}

/// A connection to one repository.
#[async_trait]
pub trait Conn: Send + Sync {
    /// Resolve `tag` to a manifest.
    async fn get_manifest(&self, tag: &str) -> StrataResult<Manifest>;

    /// Stream the blob with `digest`.
    async fn get_blob(&self, digest: &Digest) -> StrataResult<BlobStream>;
}

/// Graph id of a layer: a digest over its parent's id and its own blob, so
/// the same blob under different parents gets different ids.
#[must_use]
pub fn chain_id(parent: &str, blob: &Digest) -> String {
    hex::encode(Sha256::digest(format!("{parent} {blob}").as_bytes()))
}
