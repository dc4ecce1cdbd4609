//! Ownership changes that keep file modes intact.

use std::fs;
use std::os::unix::fs::{PermissionsExt, lchown};
use std::path::Path;

use strata_common::StrataResult;

/// Changes the owner of a single filesystem entry.
pub trait Chowner: Send + Sync {
    /// Make `path` owned by `uid`:`gid`. Symlinks are re-owned themselves;
    /// their targets are left alone.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry cannot be inspected or re-owned.
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> StrataResult<()>;
}

/// Re-owns entries and then restores their original mode, since changing
/// the owner clears the setuid and setgid bits.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetuidingChowner;

impl Chowner for SetuidingChowner {
    fn chown(&self, path: &Path, uid: u32, gid: u32) -> StrataResult<()> {
        let original = fs::symlink_metadata(path)?;
        lchown(path, Some(uid), Some(gid))?;

        if original.file_type().is_symlink() {
            return Ok(());
        }

        let mode = original.permissions().mode();
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        Ok(())
    }
}
