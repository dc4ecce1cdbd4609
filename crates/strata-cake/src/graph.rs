//! Persistent layer metadata.
//!
//! One JSON record per layer lives under the records directory. Records are
//! loaded once when the graph is opened and kept in memory; every mutation
//! is written through to disk before the in-memory view changes.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use strata_common::{StrataError, StrataResult};

use crate::cake::LayerRecord;

/// Layer metadata store.
#[derive(Debug)]
pub struct Graph {
    dir: PathBuf,
    records: RwLock<HashMap<String, LayerRecord>>,
}

impl Graph {
    /// Open the graph stored in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or a record is
    /// unreadable.
    pub fn open(dir: impl Into<PathBuf>) -> StrataResult<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let mut records = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: LayerRecord = serde_json::from_slice(&fs::read(&path)?)?;
            records.insert(record.id.clone(), record);
        }

        tracing::debug!(dir = %dir.display(), layers = records.len(), "Opened layer graph");

        Ok(Self {
            dir,
            records: RwLock::new(records),
        })
    }

    /// Look up a record.
    pub fn get(&self, id: &str) -> Option<LayerRecord> {
        self.records.read().get(id).cloned()
    }

    /// True if a record exists for `id`.
    pub fn exists(&self, id: &str) -> bool {
        self.records.read().contains_key(id)
    }

    /// Persist a new record.
    ///
    /// # Errors
    ///
    /// Fails if the id is unusable as a file name, the record already
    /// exists, or it cannot be written.
    pub fn insert(&self, record: LayerRecord) -> StrataResult<()> {
        validate_id(&record.id)?;

        let mut records = self.records.write();
        if records.contains_key(&record.id) {
            return Err(StrataError::AlreadyExists { id: record.id });
        }

        let path = self.record_path(&record.id);
        let tmp = self.dir.join(format!(".{}.tmp", record.id));
        fs::write(&tmp, serde_json::to_vec(&record)?)?;
        fs::rename(&tmp, &path)?;

        records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Forget a record.
    ///
    /// # Errors
    ///
    /// Returns [`StrataError::NotFound`] if there is no such record.
    pub fn delete(&self, id: &str) -> StrataResult<LayerRecord> {
        let mut records = self.records.write();
        let Some(record) = records.remove(id) else {
            return Err(StrataError::not_found(id));
        };

        match fs::remove_file(self.record_path(id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                records.insert(id.to_string(), record);
                return Err(e.into());
            }
        }
        Ok(record)
    }

    /// True if some record names `id` as its parent.
    pub fn has_children(&self, id: &str) -> bool {
        self.records
            .read()
            .values()
            .any(|r| r.parent.as_deref() == Some(id))
    }

    /// Ids of every layer that is nobody's parent.
    pub fn heads(&self) -> Vec<String> {
        let records = self.records.read();
        let parents: HashSet<&str> = records
            .values()
            .filter_map(|r| r.parent.as_deref())
            .collect();
        let mut heads: Vec<String> = records
            .keys()
            .filter(|id| !parents.contains(id.as_str()))
            .cloned()
            .collect();
        heads.sort();
        heads
    }

    /// Every record, ordered by id.
    pub fn all(&self) -> Vec<LayerRecord> {
        let mut all: Vec<_> = self.records.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Directory holding the records.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn validate_id(id: &str) -> StrataResult<()> {
    if id.is_empty() || id.starts_with('.') || id.contains('/') || id.contains('\0') {
        return Err(StrataError::internal(format!("invalid layer id: {id:?}")));
    }
    Ok(())
}
