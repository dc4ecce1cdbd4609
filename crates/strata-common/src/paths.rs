//! Standard filesystem paths for Strata.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Strata data.
pub static STRATA_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STRATA_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/strata"))
});

/// Name of the directory holding namespaced-layer bookkeeping.
pub const METADATA_DIR: &str = "strata-info";

/// Standard paths used by the layer store.
#[derive(Debug, Clone)]
pub struct StrataPaths {
    /// Root data directory (default: /var/lib/strata).
    pub root: PathBuf,
}

impl StrataPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root of the layer graph (metadata plus driver directories).
    #[must_use]
    pub fn graph(&self) -> PathBuf {
        self.root.join("graph")
    }

    /// Directory holding one metadata record per layer.
    #[must_use]
    pub fn layer_records(&self) -> PathBuf {
        self.graph().join("records")
    }

    /// Directory owned by a graph driver.
    #[must_use]
    pub fn driver(&self, name: &str) -> PathBuf {
        self.graph().join(name)
    }

    /// Relationship index for namespaced layers.
    #[must_use]
    pub fn metadata(&self) -> PathBuf {
        self.graph().join(METADATA_DIR)
    }

    /// Directory for quota backing-store files.
    #[must_use]
    pub fn backing_stores(&self) -> PathBuf {
        self.root.join("backing_stores")
    }

    /// Scratch directory for blobs awaiting verification.
    #[must_use]
    pub fn downloads(&self) -> PathBuf {
        self.root.join("downloads")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.layer_records())?;
        std::fs::create_dir_all(self.backing_stores())?;
        std::fs::create_dir_all(self.downloads())?;
        Ok(())
    }
}

impl Default for StrataPaths {
    fn default() -> Self {
        Self {
            root: STRATA_ROOT.clone(),
        }
    }
}
