//! Namespaced clones.
//!
//! Containers running in a user namespace need an image whose files are
//! owned by the mapped ids. Rather than translating the image in place, the
//! image's top layer is copied into a fresh parentless layer (which the
//! caller then re-owns). [`NamespacedCake`] performs that copy and keeps the
//! clone/source relationship in a [`RelationshipIndex`], so the clone still
//! reports its source as parent and the source is not collected while
//! clones of it exist.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use strata_common::{CommandRunner, StrataError, StrataResult};

use crate::cake::{Cake, LayerRecord};
use crate::driver::vfs::copy_tree;
use crate::id::LayerId;
use crate::relations::RelationshipIndex;

/// A [`Cake`] decorator adding namespaced clones.
pub struct NamespacedCake<C> {
    inner: C,
    relations: RelationshipIndex,
    runner: Arc<dyn CommandRunner>,
}

impl<C: Cake> NamespacedCake<C> {
    /// Decorate `inner`, keeping relationships under `metadata_dir`.
    pub fn new(inner: C, metadata_dir: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            inner,
            relations: RelationshipIndex::new(metadata_dir.into()),
            runner,
        }
    }

    /// The decorated cake.
    pub const fn inner(&self) -> &C {
        &self.inner
    }

    fn clone_layer(&self, child: &LayerId, parent: &LayerId) -> StrataResult<()> {
        let child_id = child.graph_id();
        let parent_id = parent.graph_id();

        if self.relations.is_recorded(&child_id) {
            return Err(StrataError::AlreadyExists { id: child_id });
        }

        self.inner.create(child, None, "")?;

        let populated = self.inner.path(parent).and_then(|source| {
            let copied = self.inner.path(child).and_then(|dest| {
                let result = copy_tree(self.runner.as_ref(), &source, &dest);
                if let Err(e) = self.inner.unmount(child) {
                    tracing::warn!(id = %child_id, error = %e, "Failed to unmount clone");
                }
                result
            });
            let recorded = copied.and_then(|()| self.relations.record(&parent_id, &child_id));
            if let Err(e) = self.inner.unmount(parent) {
                tracing::warn!(id = %parent_id, error = %e, "Failed to unmount clone source");
            }
            recorded
        });

        if let Err(e) = populated {
            self.discard(child);
            return Err(e);
        }

        tracing::debug!(child = %child_id, parent = %parent_id, "Namespaced clone created");
        Ok(())
    }

    /// Drop a clone that could not be completed.
    fn discard(&self, child: &LayerId) {
        let id = child.graph_id();
        if let Err(e) = self.relations.forget(&id) {
            tracing::warn!(id, error = %e, "Failed to forget partial clone");
        }
        if let Err(e) = self.inner.remove(child) {
            tracing::warn!(id, error = %e, "Failed to remove partial clone");
        }
    }
}

impl<C: Cake> Cake for NamespacedCake<C> {
    fn driver_name(&self) -> &str {
        self.inner.driver_name()
    }

    fn create(
        &self,
        layer: &LayerId,
        parent: Option<&LayerId>,
        container: &str,
    ) -> StrataResult<()> {
        match (layer, parent) {
            (LayerId::Namespaced { .. }, Some(parent)) => self.clone_layer(layer, parent),
            (LayerId::Namespaced { .. }, None) => Err(StrataError::internal(format!(
                "namespaced layer {layer} needs a source layer"
            ))),
            _ => self.inner.create(layer, parent, container),
        }
    }

    fn register(&self, record: LayerRecord, diff: Option<&mut dyn Read>) -> StrataResult<()> {
        self.inner.register(record, diff)
    }

    fn get(&self, layer: &LayerId) -> StrataResult<LayerRecord> {
        let mut record = self.inner.get(layer)?;
        if record.parent.is_none() {
            record.parent = self.relations.parent_of(&record.id)?;
        }
        Ok(record)
    }

    fn unmount(&self, layer: &LayerId) -> StrataResult<()> {
        self.inner.unmount(layer)
    }

    fn remove(&self, layer: &LayerId) -> StrataResult<()> {
        self.inner.remove(layer)?;
        self.relations.forget(&layer.graph_id())
    }

    fn path(&self, layer: &LayerId) -> StrataResult<PathBuf> {
        self.inner.path(layer)
    }

    fn quotaed_path(&self, layer: &LayerId, quota: i64) -> StrataResult<PathBuf> {
        self.inner.quotaed_path(layer, quota)
    }

    fn is_leaf(&self, layer: &LayerId) -> StrataResult<bool> {
        Ok(self.inner.is_leaf(layer)? && !self.relations.has_children(&layer.graph_id())?)
    }

    fn get_all_leaves(&self) -> StrataResult<Vec<LayerId>> {
        let mut leaves = Vec::new();
        for leaf in self.inner.get_all_leaves()? {
            if !self.relations.has_children(&leaf.graph_id())? {
                leaves.push(leaf);
            }
        }
        Ok(leaves)
    }

    fn all(&self) -> Vec<LayerRecord> {
        self.inner
            .all()
            .into_iter()
            .map(|mut record| {
                if record.parent.is_none() {
                    record.parent = self.relations.parent_of(&record.id).ok().flatten();
                }
                record
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DriverCake;
    use crate::driver::VfsDriver;
    use std::fs;
    use std::path::Path;
    use strata_common::SystemRunner;

    fn cake(root: &Path) -> NamespacedCake<DriverCake> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let driver = VfsDriver::new(root.join("vfs"), runner.clone()).unwrap();
        let inner = DriverCake::open(root.join("records"), Arc::new(driver)).unwrap();
        NamespacedCake::new(inner, root.join("info"), runner)
    }

    fn base_with_file<C: Cake>(cake: &NamespacedCake<C>) -> LayerId {
        let base = LayerId::from("base");
        cake.create(&base, None, "").unwrap();
        let path = cake.path(&base).unwrap();
        fs::write(path.join("hello"), "world").unwrap();
        cake.unmount(&base).unwrap();
        base
    }

    #[test]
    fn clone_copies_contents_and_reports_parent() {
        let dir = tempfile::tempdir().unwrap();
        let cake = cake(dir.path());
        let base = base_with_file(&cake);
        let clone = LayerId::namespaced(base.clone(), "0-1000-65536");

        cake.create(&clone, Some(&base), "").unwrap();

        let path = cake.path(&clone).unwrap();
        assert_eq!(fs::read_to_string(path.join("hello")).unwrap(), "world");
        assert_eq!(cake.get(&clone).unwrap().parent.as_deref(), Some("base"));
        assert_eq!(cake.inner().get(&clone).unwrap().parent, None);
    }

    #[test]
    fn source_is_not_a_leaf_while_cloned() {
        let dir = tempfile::tempdir().unwrap();
        let cake = cake(dir.path());
        let base = base_with_file(&cake);
        let clone = LayerId::namespaced(base.clone(), "key");
        cake.create(&clone, Some(&base), "").unwrap();

        assert!(!cake.is_leaf(&base).unwrap());
        assert_eq!(
            cake.get_all_leaves().unwrap(),
            vec![LayerId::Image(clone.graph_id())]
        );

        cake.remove(&clone).unwrap();
        assert!(cake.is_leaf(&base).unwrap());
    }

    #[test]
    fn second_clone_with_same_key_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let cake = cake(dir.path());
        let base = base_with_file(&cake);
        let clone = LayerId::namespaced(base.clone(), "key");
        cake.create(&clone, Some(&base), "").unwrap();

        let err = cake.create(&clone, Some(&base), "").unwrap_err();
        assert!(matches!(err, StrataError::AlreadyExists { .. }));
        assert_eq!(err.to_string(), format!("{} already exists", clone.graph_id()));

        let children = fs::read_to_string(dir.path().join("info/parent-child/base")).unwrap();
        assert_eq!(children.lines().collect::<Vec<_>>(), [clone.graph_id()]);
    }

    #[test]
    fn failed_copy_leaves_no_clone_behind() {
        let dir = tempfile::tempdir().unwrap();
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let driver = VfsDriver::new(dir.path().join("vfs"), runner).unwrap();
        let inner = DriverCake::open(dir.path().join("records"), Arc::new(driver)).unwrap();
        let cake = NamespacedCake::new(inner, dir.path().join("info"), Arc::new(NoCopy));
        let base = base_with_file(&cake);
        let clone = LayerId::namespaced(base.clone(), "key");

        assert!(cake.create(&clone, Some(&base), "").is_err());

        assert!(cake.get(&clone).unwrap_err().is_not_found());
        assert!(cake.is_leaf(&base).unwrap());
        assert!(!dir.path().join("info/child-parent").join(clone.graph_id()).exists());
    }

    #[test]
    fn relationship_is_recorded_before_source_is_unmounted() {
        let dir = tempfile::tempdir().unwrap();
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let driver = VfsDriver::new(dir.path().join("vfs"), runner.clone()).unwrap();
        let inner = Observed {
            inner: DriverCake::open(dir.path().join("records"), Arc::new(driver)).unwrap(),
            index: dir.path().join("info/child-parent"),
            unmounts: parking_lot::Mutex::new(Vec::new()),
        };
        let cake = NamespacedCake::new(inner, dir.path().join("info"), runner);
        let base = base_with_file(&cake);
        cake.inner().unmounts.lock().clear();
        let clone = LayerId::namespaced(base.clone(), "key");

        cake.create(&clone, Some(&base), "").unwrap();

        let unmounts = cake.inner().unmounts.lock();
        let source = unmounts
            .iter()
            .find(|(id, _)| id == "base")
            .expect("source unmounted");
        assert!(source.1, "relationship missing when the source was unmounted");
    }

    struct NoCopy;

    impl CommandRunner for NoCopy {
        fn run(&self, program: &str, _args: &[&str]) -> StrataResult<String> {
            Err(StrataError::Command {
                program: program.to_string(),
                message: "No space left on device".to_string(),
            })
        }
    }

    /// Notes, for every unmount, whether any relationship had been recorded.
    struct Observed {
        inner: DriverCake,
        index: PathBuf,
        unmounts: parking_lot::Mutex<Vec<(String, bool)>>,
    }

    impl Cake for Observed {
        fn driver_name(&self) -> &str {
            self.inner.driver_name()
        }

        fn create(
            &self,
            layer: &LayerId,
            parent: Option<&LayerId>,
            container: &str,
        ) -> StrataResult<()> {
            self.inner.create(layer, parent, container)
        }

        fn register(&self, record: LayerRecord, diff: Option<&mut dyn Read>) -> StrataResult<()> {
            self.inner.register(record, diff)
        }

        fn get(&self, layer: &LayerId) -> StrataResult<LayerRecord> {
            self.inner.get(layer)
        }

        fn unmount(&self, layer: &LayerId) -> StrataResult<()> {
            let recorded = fs::read_dir(&self.index).is_ok_and(|mut d| d.next().is_some());
            self.unmounts.lock().push((layer.graph_id(), recorded));
            self.inner.unmount(layer)
        }

        fn remove(&self, layer: &LayerId) -> StrataResult<()> {
            self.inner.remove(layer)
        }

        fn path(&self, layer: &LayerId) -> StrataResult<PathBuf> {
            self.inner.path(layer)
        }

        fn quotaed_path(&self, layer: &LayerId, quota: i64) -> StrataResult<PathBuf> {
            self.inner.quotaed_path(layer, quota)
        }

        fn is_leaf(&self, layer: &LayerId) -> StrataResult<bool> {
            self.inner.is_leaf(layer)
        }

        fn get_all_leaves(&self) -> StrataResult<Vec<LayerId>> {
            self.inner.get_all_leaves()
        }

        fn all(&self) -> Vec<LayerRecord> {
            self.inner.all()
        }
    }

    #[test]
    fn failed_remove_keeps_relationship() {
        let dir = tempfile::tempdir().unwrap();
        let cake = cake(dir.path());
        let base = base_with_file(&cake);
        let clone = LayerId::namespaced(base.clone(), "key");
        cake.create(&clone, Some(&base), "").unwrap();
        let container = LayerId::Container("c".into());
        cake.create(&container, Some(&clone), "c").unwrap();

        assert!(cake.remove(&clone).is_err());
        assert_eq!(cake.get(&clone).unwrap().parent.as_deref(), Some("base"));
    }

    #[test]
    fn plain_layers_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let cake = cake(dir.path());
        let base = base_with_file(&cake);
        let container = LayerId::Container("handle".into());

        cake.create(&container, Some(&base), "handle").unwrap();
        assert_eq!(cake.get(&container).unwrap().container, "handle");
        assert!(!dir.path().join("info/child-parent").exists());
    }
}
