//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use strata::namespacer::Namespacer;
use strata_cake::{Cake, LayerId, LayerRecord};
use strata_common::{StrataError, StrataResult};

/// In-memory cake that logs every mutating call.
pub struct FakeCake {
    root: PathBuf,
    records: Mutex<BTreeMap<String, LayerRecord>>,
    calls: Mutex<Vec<String>>,
}

impl FakeCake {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            records: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_layer(self, record: LayerRecord) -> Self {
        self.records.lock().insert(record.id.clone(), record);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn log(&self, call: String) {
        self.calls.lock().push(call);
    }

    fn dir(&self, layer: &LayerId) -> StrataResult<PathBuf> {
        let id = layer.graph_id();
        if !self.records.lock().contains_key(&id) {
            return Err(StrataError::not_found(id));
        }
        let dir = self.root.join(&id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

impl Cake for FakeCake {
    fn driver_name(&self) -> &str {
        "fake"
    }

    fn create(&self, layer: &LayerId, parent: Option<&LayerId>, container: &str) -> StrataResult<()> {
        let id = layer.graph_id();
        let parent_id = parent.map(LayerId::graph_id).unwrap_or_default();
        self.log(format!("create {id} {parent_id} {container}"));

        let mut records = self.records.lock();
        if records.contains_key(&id) {
            return Err(StrataError::AlreadyExists { id });
        }
        let mut record = LayerRecord::new(&id).with_parent(parent_id);
        record.container = container.to_string();
        records.insert(id, record);
        Ok(())
    }

    fn register(&self, record: LayerRecord, _diff: Option<&mut dyn Read>) -> StrataResult<()> {
        self.records.lock().insert(record.id.clone(), record);
        Ok(())
    }

    fn get(&self, layer: &LayerId) -> StrataResult<LayerRecord> {
        let id = layer.graph_id();
        self.records
            .lock()
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::not_found(id))
    }

    fn unmount(&self, layer: &LayerId) -> StrataResult<()> {
        self.log(format!("unmount {}", layer.graph_id()));
        Ok(())
    }

    fn remove(&self, layer: &LayerId) -> StrataResult<()> {
        let id = layer.graph_id();
        self.log(format!("remove {id}"));
        self.records
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StrataError::not_found(id))
    }

    fn path(&self, layer: &LayerId) -> StrataResult<PathBuf> {
        self.log(format!("path {}", layer.graph_id()));
        self.dir(layer)
    }

    fn quotaed_path(&self, layer: &LayerId, quota: i64) -> StrataResult<PathBuf> {
        self.log(format!("quotaed_path {} {quota}", layer.graph_id()));
        self.dir(layer)
    }

    fn is_leaf(&self, layer: &LayerId) -> StrataResult<bool> {
        let id = layer.graph_id();
        Ok(!self
            .records
            .lock()
            .values()
            .any(|r| r.parent.as_deref() == Some(id.as_str())))
    }

    fn get_all_leaves(&self) -> StrataResult<Vec<LayerId>> {
        let records = self.records.lock();
        Ok(records
            .keys()
            .filter(|id| !records.values().any(|r| r.parent.as_deref() == Some(id.as_str())))
            .map(|id| LayerId::Image(id.clone()))
            .collect())
    }

    fn all(&self) -> Vec<LayerRecord> {
        self.records.lock().values().cloned().collect()
    }
}

/// Namespacer that counts translations.
pub struct CountingNamespacer {
    pub translated: Mutex<Vec<PathBuf>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub delay: Duration,
    /// Number of upcoming translations that fail.
    pub failures: AtomicUsize,
}

impl CountingNamespacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            translated: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay,
            failures: AtomicUsize::new(0),
        }
    }
}

impl Namespacer for CountingNamespacer {
    fn cache_key(&self) -> String {
        "0-1000-1+0-1000-1".to_string()
    }

    fn namespace(&self, rootfs: &Path) -> StrataResult<()> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StrataError::internal("lchown: operation not permitted"));
        }
        self.translated.lock().push(rootfs.to_path_buf());
        Ok(())
    }
}
