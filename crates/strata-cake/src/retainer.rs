//! Layers pinned against garbage collection.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::id::LayerId;

/// Answers whether a layer must survive garbage collection.
pub trait RetainCheck: Send + Sync {
    /// True if `layer` is pinned.
    fn check(&self, layer: &LayerId) -> bool;
}

impl<F> RetainCheck for F
where
    F: Fn(&LayerId) -> bool + Send + Sync,
{
    fn check(&self, layer: &LayerId) -> bool {
        self(layer)
    }
}

/// Set of pinned layers, keyed by graph id.
#[derive(Debug, Default)]
pub struct Retainer {
    retained: RwLock<HashSet<String>>,
}

impl Retainer {
    /// An empty retainer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `layer`. Pinning twice is the same as pinning once.
    pub fn retain(&self, layer: &LayerId) {
        self.retained.write().insert(layer.graph_id());
    }

    /// Number of pinned layers.
    pub fn len(&self) -> usize {
        self.retained.read().len()
    }

    /// True if nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.retained.read().is_empty()
    }
}

impl RetainCheck for Retainer {
    fn check(&self, layer: &LayerId) -> bool {
        self.retained.read().contains(&layer.graph_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retained_by_graph_id() {
        let retainer = Retainer::new();
        let container = LayerId::Container("handle".into());
        retainer.retain(&container);
        retainer.retain(&container);

        assert_eq!(retainer.len(), 1);
        assert!(retainer.check(&container));
        assert!(retainer.check(&LayerId::Image(container.graph_id())));
        assert!(!retainer.check(&LayerId::from("other")));
    }

    #[test]
    fn closures_are_checks() {
        let check = |layer: &LayerId| layer.graph_id() == "keep";
        assert!(check.check(&"keep".into()));
        assert!(!check.check(&"drop".into()));
    }
}
