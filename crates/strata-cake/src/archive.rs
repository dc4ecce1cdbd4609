//! Applying layer diffs.
//!
//! A diff is a tar stream, optionally gzip or zstd compressed, in which
//! deletions are expressed as whiteout entries: `.wh.<name>` removes `<name>`
//! from lower layers and `.wh..wh..opq` hides the whole directory below.

use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use strata_common::StrataResult;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_MARKER: &str = ".wh..wh..opq";

/// How whiteout entries are materialised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whiteouts {
    /// The layer directory is a full copy of its parent: delete the targets.
    Delete,
    /// The layer directory is an overlay upper dir: record whiteouts as 0/0
    /// character devices and opaque directories as the overlay xattr.
    Overlay,
}

#[derive(Debug, Clone, Copy)]
enum Compression {
    Gzip,
    Zstd,
    None,
}

fn detect(magic: &[u8]) -> Compression {
    if magic.starts_with(&GZIP_MAGIC) {
        Compression::Gzip
    } else if magic.starts_with(&ZSTD_MAGIC) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

/// Unpack `diff` into `dest`, returning the number of content bytes written.
///
/// # Errors
///
/// Returns an error if the stream is not a valid (compressed) tar archive or
/// the destination cannot be written.
pub fn apply_layer(diff: &mut dyn Read, dest: &Path, whiteouts: Whiteouts) -> StrataResult<u64> {
    let mut buffered = BufReader::new(diff);
    let compression = detect(buffered.fill_buf()?);

    let reader: Box<dyn Read + '_> = match compression {
        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(buffered)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::with_buffer(buffered)?),
        Compression::None => Box::new(buffered),
    };

    tracing::debug!(dest = %dest.display(), ?compression, "Applying layer diff");

    fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);
    archive.set_overwrite(true);

    let mut size = 0u64;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        let Some(relative) = relative(&path) else {
            tracing::warn!(path = %path.display(), "Skipping entry outside the layer");
            continue;
        };

        let name = relative.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let dir = dest.join(relative.parent().unwrap_or_else(|| Path::new("")));

        if name == OPAQUE_MARKER {
            make_opaque(&dir, whiteouts)?;
            continue;
        }
        if let Some(hidden) = name.strip_prefix(WHITEOUT_PREFIX) {
            whiteout(&dir.join(hidden), whiteouts)?;
            continue;
        }

        size += entry.size();
        entry.unpack_in(dest)?;
    }

    Ok(size)
}

/// Pack the contents of `dir` into an uncompressed tar stream.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn pack_dir(dir: &Path) -> StrataResult<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    Ok(builder.into_inner()?)
}

/// Normal components of `path`; `None` if it climbs out with `..`.
fn relative(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => return None,
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Some(out)
}

fn remove_any(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn whiteout(target: &Path, whiteouts: Whiteouts) -> StrataResult<()> {
    remove_any(target)?;
    if whiteouts == Whiteouts::Overlay {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        rustix::fs::mknodat(
            rustix::fs::CWD,
            target,
            rustix::fs::FileType::CharacterDevice,
            rustix::fs::Mode::empty(),
            0,
        )
        .map_err(std::io::Error::from)?;
    }
    Ok(())
}

fn make_opaque(dir: &Path, whiteouts: Whiteouts) -> StrataResult<()> {
    match whiteouts {
        Whiteouts::Delete => {
            if dir.is_dir() {
                for entry in fs::read_dir(dir)? {
                    remove_any(&entry?.path())?;
                }
            }
        }
        Whiteouts::Overlay => {
            fs::create_dir_all(dir)?;
            rustix::fs::setxattr(
                dir,
                "trusted.overlay.opaque",
                b"y",
                rustix::fs::XattrFlags::empty(),
            )
            .map_err(std::io::Error::from)?;
        }
    }
    Ok(())
}
