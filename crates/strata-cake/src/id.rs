//! Layer identities.
//!
//! Every layer in the graph is addressed by a flat string, its graph id. A
//! [`LayerId`] records where that id came from so callers can derive it the
//! same way every time.

use std::fmt;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Identity of a layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LayerId {
    /// An image layer addressed by its graph id as-is.
    Image(String),
    /// The writable layer of a container, hashed from the container handle.
    Container(String),
    /// A directory imported from the local filesystem. The modification time
    /// is part of the identity, so touching the directory yields a new layer.
    Local {
        /// Directory the layer was imported from.
        path: PathBuf,
        /// Modification time of `path`, or `None` if it could not be read.
        modified: Option<SystemTime>,
    },
    /// A clone of `base` whose ownership was translated for a user namespace.
    Namespaced {
        /// Layer the clone was taken from.
        base: Box<LayerId>,
        /// Fingerprint of the id mappings applied to the clone.
        cache_key: String,
    },
}

impl LayerId {
    /// Identity of a namespaced clone of `base`.
    pub fn namespaced(base: LayerId, cache_key: impl Into<String>) -> Self {
        Self::Namespaced {
            base: Box::new(base),
            cache_key: cache_key.into(),
        }
    }

    /// The flat id this layer is stored under.
    ///
    /// Derivation is deterministic: the same identity always yields the same
    /// graph id.
    #[must_use]
    pub fn graph_id(&self) -> String {
        match self {
            Self::Image(id) => id.clone(),
            Self::Container(handle) => sha_id(handle),
            Self::Local { path, modified } => {
                let nanos = modified
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map_or(0, |d| d.as_nanos());
                sha_id(&format!("{}-{nanos}", path.display()))
            }
            Self::Namespaced { base, cache_key } => {
                sha_id(&format!("{}@{cache_key}", base.graph_id()))
            }
        }
    }

    /// True for namespaced clones.
    #[must_use]
    pub const fn is_namespaced(&self) -> bool {
        matches!(self, Self::Namespaced { .. })
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.graph_id())
    }
}

impl From<&str> for LayerId {
    fn from(id: &str) -> Self {
        Self::Image(id.to_string())
    }
}

/// Hex sha256 of `input`. The empty string maps to itself.
fn sha_id(input: &str) -> String {
    if input.is_empty() {
        return String::new();
    }
    hex::encode(Sha256::digest(input.as_bytes()))
}
