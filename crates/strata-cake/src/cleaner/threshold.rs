//! When the graph is big enough to be worth collecting.

use crate::cake::Cake;

/// Decides whether a collection pass should run.
pub trait Threshold: Send + Sync {
    /// True if `cake` has outgrown the threshold.
    fn exceeded(&self, cake: &dyn Cake) -> bool;
}

/// Build the threshold for a configured limit. Negative limits disable
/// collection.
#[must_use]
pub fn threshold(limit: i64) -> Box<dyn Threshold> {
    if limit < 0 {
        Box::new(Disabled)
    } else {
        Box::new(SizeThreshold { limit })
    }
}

/// Exceeded once the recorded sizes of all layers add up to more than
/// `limit` bytes.
#[derive(Debug, Clone, Copy)]
pub struct SizeThreshold {
    /// Size in bytes the graph may reach before collection.
    pub limit: i64,
}

impl Threshold for SizeThreshold {
    fn exceeded(&self, cake: &dyn Cake) -> bool {
        let mut total = 0i64;
        for record in cake.all() {
            total = total.saturating_add(record.size);
            if total > self.limit {
                return true;
            }
        }
        false
    }
}

/// Never exceeded.
#[derive(Debug, Clone, Copy)]
pub struct Disabled;

impl Threshold for Disabled {
    fn exceeded(&self, _cake: &dyn Cake) -> bool {
        false
    }
}
