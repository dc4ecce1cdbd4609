//! Rootfs requests.

use std::fmt;

use serde::{Deserialize, Serialize};

/// What a disk limit is measured against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DiskLimitScope {
    /// The limit covers the image plus everything the container writes.
    #[default]
    Total,
    /// The limit covers only what the container writes.
    Exclusive,
}

impl fmt::Display for DiskLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Total => write!(f, "total"),
            Self::Exclusive => write!(f, "exclusive"),
        }
    }
}

/// A request for a container root filesystem.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootfsSpec {
    /// Rootfs reference: a host path, or `docker://[host]/repo[#tag]`. Empty
    /// selects the configured default rootfs.
    #[serde(default)]
    pub rootfs: String,

    /// Registry user name.
    #[serde(default)]
    pub username: String,

    /// Registry password.
    #[serde(default)]
    pub password: String,

    /// Re-own the image for the configured user namespace mappings.
    #[serde(default)]
    pub namespaced: bool,

    /// Disk limit in bytes; zero means unlimited.
    #[serde(default)]
    pub quota_size: i64,

    /// What the disk limit covers.
    #[serde(default)]
    pub quota_scope: DiskLimitScope,
}

impl RootfsSpec {
    /// Spec for `rootfs` with no limit and no namespacing.
    pub fn new(rootfs: impl Into<String>) -> Self {
        Self {
            rootfs: rootfs.into(),
            ..Self::default()
        }
    }

    /// Limit the container to `bytes`, measured per `scope`.
    #[must_use]
    pub const fn with_quota(mut self, bytes: i64, scope: DiskLimitScope) -> Self {
        self.quota_size = bytes;
        self.quota_scope = scope;
        self
    }

    /// Request a namespaced rootfs.
    #[must_use]
    pub const fn namespaced(mut self) -> Self {
        self.namespaced = true;
        self
    }

    /// Quota handed to the fetcher. Exclusive limits only constrain the
    /// container's own writes, so the image itself is not checked.
    #[must_use]
    pub const fn fetcher_quota(&self) -> i64 {
        match self.quota_scope {
            DiskLimitScope::Exclusive => 0,
            DiskLimitScope::Total => self.quota_size,
        }
    }
}
