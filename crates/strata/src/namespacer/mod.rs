//! Re-owning a rootfs for a user namespace.
//!
//! A namespaced container sees its files through the user namespace's id
//! mappings, so an image must be re-owned to the mapped host ids before the
//! container can use it. [`UidNamespacer`] walks a tree and hands every
//! entry to a [`Translator`]; [`UidTranslator`] maps the owner through a
//! pair of [`MappingList`]s.

mod chown;
mod mapping;

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;

use strata_common::StrataResult;
use walkdir::WalkDir;

pub use chown::{Chowner, SetuidingChowner};
pub use mapping::{IdMapping, MAX_ID, MappingList};

/// Re-owns a whole rootfs.
pub trait Namespacer: Send + Sync {
    /// Stable fingerprint of the translation, used to share translated
    /// layers between containers with identical mappings.
    fn cache_key(&self) -> String;

    /// Translate every entry under `rootfs`.
    ///
    /// # Errors
    ///
    /// Returns an error if the translation cannot be carried out.
    fn namespace(&self, rootfs: &Path) -> StrataResult<()>;
}

/// Translates a single filesystem entry.
pub trait Translator: Send + Sync {
    /// See [`Namespacer::cache_key`].
    fn cache_key(&self) -> String;

    /// Translate the entry at `path`, described by `metadata` (not following
    /// symlinks).
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be re-owned.
    fn translate(&self, path: &Path, metadata: &Metadata) -> StrataResult<()>;
}

/// Maps file owners through uid and gid mapping tables.
pub struct UidTranslator {
    uid_mappings: MappingList,
    gid_mappings: MappingList,
    chowner: Arc<dyn Chowner>,
}

impl UidTranslator {
    /// Translator for the given mappings.
    pub fn new(uid_mappings: MappingList, gid_mappings: MappingList) -> Self {
        Self::with_chowner(uid_mappings, gid_mappings, Arc::new(SetuidingChowner))
    }

    /// Translator re-owning entries through `chowner`.
    pub fn with_chowner(
        uid_mappings: MappingList,
        gid_mappings: MappingList,
        chowner: Arc<dyn Chowner>,
    ) -> Self {
        Self {
            uid_mappings,
            gid_mappings,
            chowner,
        }
    }
}

impl Translator for UidTranslator {
    fn cache_key(&self) -> String {
        format!("{}+{}", self.uid_mappings, self.gid_mappings)
    }

    fn translate(&self, path: &Path, metadata: &Metadata) -> StrataResult<()> {
        let (uid, gid) = (metadata.uid(), metadata.gid());
        let (to_uid, to_gid) = (self.uid_mappings.map(uid), self.gid_mappings.map(gid));

        if to_uid != uid || to_gid != gid {
            self.chowner.chown(path, to_uid, to_gid)?;
        }
        Ok(())
    }
}

/// Walks a rootfs, translating every entry.
pub struct UidNamespacer {
    translator: Arc<dyn Translator>,
}

impl UidNamespacer {
    /// Namespacer applying `translator`.
    pub fn new(translator: Arc<dyn Translator>) -> Self {
        Self { translator }
    }
}

impl Namespacer for UidNamespacer {
    fn cache_key(&self) -> String {
        self.translator.cache_key()
    }

    fn namespace(&self, rootfs: &Path) -> StrataResult<()> {
        let span = tracing::info_span!("namespace-rootfs", path = %rootfs.display());
        let _enter = span.enter();
        tracing::info!("namespace");

        let mut failures = 0usize;
        for entry in WalkDir::new(rootfs).follow_links(false) {
            let result = entry
                .map_err(|e| e.to_string())
                .and_then(|entry| {
                    let metadata = entry.metadata().map_err(|e| e.to_string())?;
                    self.translator
                        .translate(entry.path(), &metadata)
                        .map_err(|e| format!("{}: {e}", entry.path().display()))
                });
            if let Err(e) = result {
                failures += 1;
                tracing::error!(error = %e, "walk-failed");
            }
        }

        tracing::info!(failures, "namespaced");
        Ok(())
    }
}
