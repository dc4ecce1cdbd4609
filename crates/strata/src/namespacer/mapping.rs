//! UID/GID mapping tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Highest id mapped by [`MappingList::for_user`] by default.
pub const MAX_ID: u32 = 4_294_967_294;

/// One contiguous range of mapped ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdMapping {
    /// First id inside the container.
    pub container_id: u32,
    /// Host id `container_id` maps to.
    pub host_id: u32,
    /// Number of ids in the range.
    pub size: u32,
}

impl IdMapping {
    /// Create a mapping.
    #[must_use]
    pub const fn new(container_id: u32, host_id: u32, size: u32) -> Self {
        Self {
            container_id,
            host_id,
            size,
        }
    }

    fn map(&self, id: u32) -> Option<u32> {
        let delta = id.checked_sub(self.container_id)?;
        (delta < self.size).then(|| self.host_id.saturating_add(delta))
    }
}

/// An ordered list of mappings; the first range containing an id wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MappingList(Vec<IdMapping>);

impl MappingList {
    /// Wrap explicit mappings.
    #[must_use]
    pub const fn new(mappings: Vec<IdMapping>) -> Self {
        Self(mappings)
    }

    /// Mappings covering `0..=max_id` for a container run by host user `id`.
    ///
    /// Container root maps to `id` (or to `max_id` when `id` is root
    /// itself), every other id maps to itself except that ids at or above
    /// `id` shift up by one to make room.
    #[must_use]
    pub fn for_user(id: u32, max_id: u32) -> Self {
        if id == 0 {
            return Self(vec![
                IdMapping::new(0, max_id, 1),
                IdMapping::new(1, 1, max_id.saturating_sub(1)),
            ]);
        }

        let mut mappings = vec![IdMapping::new(0, id, 1)];
        if id != 1 {
            mappings.push(IdMapping::new(1, 1, id - 1));
        }
        if id != max_id {
            mappings.push(IdMapping::new(id, id + 1, max_id.saturating_sub(id)));
        }
        Self(mappings)
    }

    /// Host id for container id `id`. Ids outside every range are returned
    /// unchanged.
    #[must_use]
    pub fn map(&self, id: u32) -> u32 {
        self.0.iter().find_map(|m| m.map(id)).unwrap_or(id)
    }

    /// The mappings, in order.
    #[must_use]
    pub fn mappings(&self) -> &[IdMapping] {
        &self.0
    }

    /// True if there are no mappings.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for MappingList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "empty");
        }
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|m| format!("{}-{}-{}", m.container_id, m.host_id, m.size))
            .collect();
        write!(f, "{}", parts.join(","))
    }
}
