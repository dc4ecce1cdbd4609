//! The layer graph contract.

use std::io::Read;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strata_common::StrataResult;

use crate::id::LayerId;

/// Metadata kept for every layer in the graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerRecord {
    /// Graph id.
    pub id: String,
    /// Graph id of the parent layer, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Container handle for container layers, empty otherwise.
    #[serde(default)]
    pub container: String,
    /// Bytes added by this layer alone.
    #[serde(default)]
    pub size: i64,
}

impl LayerRecord {
    /// A record with no parent, container or size.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent: None,
            container: String::new(),
            size: 0,
        }
    }

    /// Set the parent id.
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        let parent = parent.into();
        self.parent = (!parent.is_empty()).then_some(parent);
        self
    }

    /// Set the recorded size.
    #[must_use]
    pub const fn with_size(mut self, size: i64) -> Self {
        self.size = size;
        self
    }
}

/// A graph of filesystem layers.
///
/// Implementations are shared between request handlers and must tolerate
/// concurrent calls.
pub trait Cake: Send + Sync {
    /// Name of the graph driver storing the layers.
    fn driver_name(&self) -> &str;

    /// Create an empty layer, optionally on top of `parent`, tagged with a
    /// container handle (empty for image layers).
    fn create(&self, layer: &LayerId, parent: Option<&LayerId>, container: &str)
    -> StrataResult<()>;

    /// Register a layer described by `record`, applying `diff` (a possibly
    /// compressed tar stream) into it when given.
    fn register(&self, record: LayerRecord, diff: Option<&mut dyn Read>) -> StrataResult<()>;

    /// Look up a layer.
    fn get(&self, layer: &LayerId) -> StrataResult<LayerRecord>;

    /// Release a mount previously obtained with [`Cake::path`].
    fn unmount(&self, layer: &LayerId) -> StrataResult<()>;

    /// Delete a layer.
    fn remove(&self, layer: &LayerId) -> StrataResult<()>;

    /// Mount a layer and return the directory holding its merged contents.
    fn path(&self, layer: &LayerId) -> StrataResult<PathBuf>;

    /// Like [`Cake::path`], but the writable part of the layer is limited to
    /// `quota` bytes.
    fn quotaed_path(&self, layer: &LayerId, quota: i64) -> StrataResult<PathBuf>;

    /// True if no layer has `layer` as its parent.
    fn is_leaf(&self, layer: &LayerId) -> StrataResult<bool>;

    /// Every layer that is not the parent of another.
    fn get_all_leaves(&self) -> StrataResult<Vec<LayerId>>;

    /// Records for every layer in the graph.
    fn all(&self) -> Vec<LayerRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_parent_is_none() {
        assert_eq!(LayerRecord::new("a").with_parent("").parent, None);
        assert_eq!(
            LayerRecord::new("a").with_parent("b").parent.as_deref(),
            Some("b")
        );
    }

    #[test]
    fn record_json_omits_missing_parent() {
        let json = serde_json::to_string(&LayerRecord::new("a").with_size(3)).unwrap();
        assert!(!json.contains("parent"));
        let back: LayerRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.size, 3);
    }
}
