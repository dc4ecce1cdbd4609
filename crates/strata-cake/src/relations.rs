//! Parent/child bookkeeping for namespaced clones.
//!
//! A namespaced clone is stored without a parent so that it does not pin its
//! source through the driver. The relationship is kept here instead, in two
//! directories of small text files named by graph id:
//!
//! - `parent-child/<parent>` lists the clones taken from `<parent>`, one per
//!   line
//! - `child-parent/<child>` holds the id the clone was taken from
//!
//! A missing directory or file simply means "no relationship".

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use strata_common::StrataResult;

const PARENT_CHILD: &str = "parent-child";
const CHILD_PARENT: &str = "child-parent";

/// Persistent parent/child index.
#[derive(Debug)]
pub struct RelationshipIndex {
    parent_child: PathBuf,
    child_parent: PathBuf,
    lock: Mutex<()>,
}

impl RelationshipIndex {
    /// Index stored under `dir`. Nothing is created until the first write.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            parent_child: dir.join(PARENT_CHILD),
            child_parent: dir.join(CHILD_PARENT),
            lock: Mutex::new(()),
        }
    }

    /// The parent recorded for `child`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    pub fn parent_of(&self, child: &str) -> StrataResult<Option<String>> {
        Ok(read_lines(&self.child_parent.join(child))?.into_iter().next())
    }

    /// True if any clone has been recorded for `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read.
    pub fn has_children(&self, parent: &str) -> StrataResult<bool> {
        Ok(!read_lines(&self.parent_child.join(parent))?.is_empty())
    }

    /// True if `child` already has a recorded parent.
    pub fn is_recorded(&self, child: &str) -> bool {
        self.child_parent.join(child).exists()
    }

    /// Record that `child` was cloned from `parent`.
    ///
    /// # Errors
    ///
    /// Returns an error if either record cannot be written.
    pub fn record(&self, parent: &str, child: &str) -> StrataResult<()> {
        let _guard = self.lock.lock();

        let children_file = self.parent_child.join(parent);
        let mut children = read_lines(&children_file)?;
        if !children.iter().any(|c| c == child) {
            children.push(child.to_string());
        }
        write_lines(&children_file, &children)?;
        write_lines(&self.child_parent.join(child), &[parent.to_string()])
    }

    /// Drop every record mentioning `child`.
    ///
    /// # Errors
    ///
    /// Returns an error if a record cannot be rewritten.
    pub fn forget(&self, child: &str) -> StrataResult<()> {
        let _guard = self.lock.lock();

        let Some(parent) = self.parent_of(child)? else {
            return Ok(());
        };

        match fs::remove_file(self.child_parent.join(child)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let children_file = self.parent_child.join(&parent);
        let remaining: Vec<String> = read_lines(&children_file)?
            .into_iter()
            .filter(|c| c != child)
            .collect();
        if remaining.is_empty() {
            match fs::remove_file(&children_file) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e.into()),
            }
        } else {
            write_lines(&children_file, &remaining)
        }
    }
}

fn read_lines(path: &Path) -> StrataResult<Vec<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_lines(path: &Path, lines: &[String]) -> StrataResult<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut contents = lines.join("\n");
    contents.push('\n');
    fs::write(path, contents)?;
    Ok(())
}
