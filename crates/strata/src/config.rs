//! Provider configuration.
//!
//! Loaded from a TOML file; every field has a default, so an empty file (or
//! no file at all) gives a working vfs-backed store under the standard root.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strata_common::{ByteSize, StrataError, StrataPaths, StrataResult};
use strata_fetch::reference::DOCKER_HUB;

use crate::namespacer::{IdMapping, MAX_ID, MappingList};

/// Graph driver selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Full copies, no mounts. Works unprivileged; no quotas.
    #[default]
    Vfs,
    /// Overlayfs with loop-mounted quota filesystems.
    Overlay,
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vfs => write!(f, "vfs"),
            Self::Overlay => write!(f, "overlay"),
        }
    }
}

/// Registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Host used for references without one.
    pub default_host: String,
    /// Hosts or CIDR ranges that may be reached over plain HTTP or with
    /// unverified certificates.
    pub insecure: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_host: DOCKER_HUB.to_string(),
            insecure: Vec::new(),
        }
    }
}

/// Garbage collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Collect once the graph grows beyond this size, e.g. `"10g"`. `"-1"`
    /// disables collection.
    pub threshold: String,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            threshold: "-1".to_string(),
        }
    }
}

impl GcConfig {
    /// Threshold in bytes; negative when disabled.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] if the threshold is not a size.
    pub fn threshold_bytes(&self) -> StrataResult<i64> {
        let threshold = self.threshold.trim();
        if threshold.starts_with('-') {
            return Ok(-1);
        }
        ByteSize::parse(threshold).map(|size| size.as_quota())
    }
}

/// User namespace mappings applied to namespaced rootfses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    /// Explicit uid mappings.
    pub uid_mappings: Vec<IdMapping>,
    /// Explicit gid mappings.
    pub gid_mappings: Vec<IdMapping>,
    /// Derive full-range mappings for this host user when no explicit
    /// mappings are given.
    pub rootless_uid: Option<u32>,
    /// Highest id covered by derived mappings.
    pub max_id: u32,
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self {
            uid_mappings: Vec::new(),
            gid_mappings: Vec::new(),
            rootless_uid: None,
            max_id: MAX_ID,
        }
    }
}

impl NamespaceConfig {
    /// Uid and gid mapping tables.
    #[must_use]
    pub fn mappings(&self) -> (MappingList, MappingList) {
        let derived = || MappingList::for_user(self.rootless_uid.unwrap_or(0), self.max_id);
        let pick = |explicit: &[IdMapping]| {
            if explicit.is_empty() {
                derived()
            } else {
                MappingList::new(explicit.to_vec())
            }
        };
        (pick(&self.uid_mappings), pick(&self.gid_mappings))
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrataConfig {
    /// Data root; defaults to `STRATA_ROOT` or `/var/lib/strata`.
    pub graph_root: Option<PathBuf>,
    /// Graph driver.
    pub driver: DriverKind,
    /// Rootfs used when a request names none.
    pub default_rootfs: Option<PathBuf>,
    /// Registry settings.
    pub registry: RegistryConfig,
    /// Garbage collection settings.
    pub gc: GcConfig,
    /// Rootfs URLs never garbage collected.
    pub persistent_images: Vec<String>,
    /// User namespace settings.
    pub namespace: NamespaceConfig,
}

impl StrataConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::Config`] if the document is invalid.
    pub fn from_toml(content: &str) -> StrataResult<Self> {
        toml::from_str(content).map_err(|e| StrataError::Config {
            message: format!("Failed to parse TOML: {e}"),
        })
    }

    /// Load a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> StrataResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Serialize to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be serialized.
    pub fn to_toml(&self) -> StrataResult<String> {
        toml::to_string_pretty(self).map_err(|e| StrataError::Internal {
            message: format!("Failed to serialize to TOML: {e}"),
        })
    }

    /// Data directory layout.
    #[must_use]
    pub fn paths(&self) -> StrataPaths {
        self.graph_root
            .as_ref()
            .map_or_else(StrataPaths::new, StrataPaths::with_root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config = StrataConfig::from_toml("").unwrap();
        assert_eq!(config.driver, DriverKind::Vfs);
        assert_eq!(config.registry.default_host, DOCKER_HUB);
        assert_eq!(config.gc.threshold_bytes().unwrap(), -1);
        assert!(config.persistent_images.is_empty());
    }

    #[test]
    fn full_document() {
        let config = StrataConfig::from_toml(
            r#"
            graph_root = "/srv/strata"
            driver = "overlay"
            default_rootfs = "/srv/rootfs"
            persistent_images = ["docker:///busybox"]

            [registry]
            default_host = "registry.example.com"
            insecure = ["10.0.0.0/8", "localhost:5000"]

            [gc]
            threshold = "10g"

            [namespace]
            rootless_uid = 1000
            max_id = 65535
            "#,
        )
        .unwrap();

        assert_eq!(config.paths().root, PathBuf::from("/srv/strata"));
        assert_eq!(config.driver, DriverKind::Overlay);
        assert_eq!(config.registry.insecure.len(), 2);
        assert_eq!(config.gc.threshold_bytes().unwrap(), 10_000_000_000);

        let (uids, gids) = config.namespace.mappings();
        assert_eq!(uids, gids);
        assert_eq!(uids.map(0), 1000);
    }

    #[test]
    fn explicit_mappings_win() {
        let config = StrataConfig::from_toml(
            r"
            [[namespace.uid_mappings]]
            container_id = 0
            host_id = 5000
            size = 100
            ",
        )
        .unwrap();

        let (uids, gids) = config.namespace.mappings();
        assert_eq!(uids.to_string(), "0-5000-100");
        assert_eq!(gids.map(0), MAX_ID);
    }

    #[test]
    fn bad_threshold_is_a_config_error() {
        let config = StrataConfig::from_toml("[gc]\nthreshold = \"lots\"").unwrap();
        assert!(matches!(
            config.gc.threshold_bytes(),
            Err(StrataError::Config { .. })
        ));
    }

    #[test]
    fn round_trips_through_toml() {
        let config = StrataConfig {
            driver: DriverKind::Overlay,
            ..StrataConfig::default()
        };
        let parsed = StrataConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(parsed.driver, DriverKind::Overlay);
    }
}
