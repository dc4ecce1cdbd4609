//! Garbage collection of unused layers.
//!
//! A pass starts from every leaf of the graph and walks towards the root,
//! removing layers until it reaches one that is pinned, belongs to a
//! container, or still has other children.

mod threshold;

use std::sync::Arc;

use strata_common::{StrataError, StrataResult};

pub use threshold::{Disabled, SizeThreshold, Threshold, threshold};

use crate::cake::Cake;
use crate::id::LayerId;
use crate::retainer::RetainCheck;

/// Collects unused layers once the graph exceeds a threshold.
pub struct Cleaner {
    threshold: Box<dyn Threshold>,
    retain: Arc<dyn RetainCheck>,
}

impl Cleaner {
    /// Create a cleaner.
    pub fn new(threshold: Box<dyn Threshold>, retain: Arc<dyn RetainCheck>) -> Self {
        Self { threshold, retain }
    }

    /// Run one collection pass over `cake`.
    ///
    /// Does nothing while the threshold is not exceeded.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::GcAborted`] when a layer cannot be removed; the
    /// pass stops there.
    pub fn gc(&self, cake: &dyn Cake) -> StrataResult<()> {
        if !self.threshold.exceeded(cake) {
            tracing::debug!("Graph below cleanup threshold");
            return Ok(());
        }

        let leaves = cake.get_all_leaves()?;
        tracing::info!(leaves = leaves.len(), "Collecting unused layers");

        for leaf in leaves {
            self.remove_recursively(cake, leaf)?;
        }
        Ok(())
    }

    fn remove_recursively(&self, cake: &dyn Cake, leaf: LayerId) -> StrataResult<()> {
        let mut current = leaf;
        loop {
            let id = current.graph_id();
            if self.retain.check(&current) {
                tracing::debug!(id, "Layer retained");
                return Ok(());
            }

            let record = match cake.get(&current) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(id, error = %e, "Could not look up layer");
                    return Ok(());
                }
            };

            if !record.container.is_empty() {
                return Ok(());
            }

            cake.remove(&current).map_err(|e| StrataError::GcAborted {
                id: id.clone(),
                source: Box::new(e),
            })?;
            tracing::info!(id, "Layer collected");

            let Some(parent) = record.parent else {
                return Ok(());
            };
            let parent = LayerId::Image(parent);
            match cake.is_leaf(&parent) {
                Ok(true) => current = parent,
                _ => return Ok(()),
            }
        }
    }
}
