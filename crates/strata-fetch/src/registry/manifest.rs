//! Image manifests.
//!
//! Registries serve Docker schema 2 and OCI manifests, possibly behind a
//! manifest list / image index that points at one manifest per platform.
//! Env and volumes come from the image config blob.

use std::collections::BTreeMap;

use serde::Deserialize;
use strata_common::StrataResult;

use super::chain_id;
use crate::digest::Digest;

pub(crate) const MEDIA_TYPES: &[&str] = &[
    "application/vnd.docker.distribution.manifest.v2+json",
    "application/vnd.docker.distribution.manifest.list.v2+json",
    "application/vnd.oci.image.manifest.v1+json",
    "application/vnd.oci.image.index.v1+json",
];

/// One layer of an image, in the order it is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestLayer {
    /// Digest of the layer blob.
    pub blob_sum: Digest,
    /// Graph id of this layer.
    pub strong_id: String,
    /// Graph id of the layer below, empty for the bottom layer.
    pub parent_strong_id: String,
    /// Declared blob size in bytes.
    pub size: i64,
    /// Environment declared at this layer.
    pub env: Vec<String>,
    /// Volumes declared at this layer.
    pub volumes: Vec<String>,
}

/// The layers of an image, bottom first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    /// Layers, bottom first.
    pub layers: Vec<ManifestLayer>,
}

impl Manifest {
    /// Build a manifest from `(blob digest, size)` pairs, bottom first. The
    /// image's env and volumes are attached to the top layer.
    #[must_use]
    pub fn new(blobs: Vec<(Digest, i64)>, env: Vec<String>, volumes: Vec<String>) -> Self {
        let count = blobs.len();
        let mut parent = String::new();
        let mut layers = Vec::with_capacity(count);

        for (index, (blob_sum, size)) in blobs.into_iter().enumerate() {
            let strong_id = chain_id(&parent, &blob_sum);
            let top = index + 1 == count;
            layers.push(ManifestLayer {
                blob_sum,
                parent_strong_id: std::mem::replace(&mut parent, strong_id.clone()),
                strong_id,
                size,
                env: if top { env.clone() } else { Vec::new() },
                volumes: if top { volumes.clone() } else { Vec::new() },
            });
        }

        Self { layers }
    }

    /// Sum of the declared layer sizes.
    #[must_use]
    pub fn total_size(&self) -> i64 {
        self.layers.iter().map(|l| l.size).sum()
    }

    /// The top layer, if the image has any.
    #[must_use]
    pub fn top(&self) -> Option<&ManifestLayer> {
        self.layers.last()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawManifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default)]
    pub config: Option<Descriptor>,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
    #[serde(default)]
    pub manifests: Vec<PlatformDescriptor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Descriptor {
    pub digest: String,
    #[serde(default)]
    pub size: i64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PlatformDescriptor {
    pub digest: String,
    #[serde(default)]
    pub platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Platform {
    pub architecture: String,
    pub os: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ImageConfig {
    #[serde(default)]
    pub config: Option<RunConfig>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct RunConfig {
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "Volumes", default)]
    pub volumes: Option<BTreeMap<String, serde_json::Value>>,
}

impl ImageConfig {
    pub(crate) fn env(&self) -> Vec<String> {
        self.config
            .as_ref()
            .and_then(|c| c.env.clone())
            .unwrap_or_default()
    }

    pub(crate) fn volumes(&self) -> Vec<String> {
        self.config
            .as_ref()
            .and_then(|c| c.volumes.as_ref())
            .map(|v| v.keys().cloned().collect())
            .unwrap_or_default()
    }
}

/// Architecture name as registries spell it.
pub(crate) fn registry_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

impl RawManifest {
    /// Entry of a manifest list matching this host.
    pub(crate) fn platform_digest(&self) -> Option<&str> {
        let arch = registry_arch();
        self.manifests
            .iter()
            .find(|m| {
                m.platform
                    .as_ref()
                    .is_some_and(|p| p.os == "linux" && p.architecture == arch)
            })
            .map(|m| m.digest.as_str())
    }

    /// `(digest, size)` of every layer, bottom first.
    pub(crate) fn layer_blobs(&self) -> StrataResult<Vec<(Digest, i64)>> {
        self.layers
            .iter()
            .map(|l| Ok((l.digest.parse()?, l.size)))
            .collect()
    }
}
