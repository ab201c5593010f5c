//! Skip-if-present directory synchronisation.
//!
//! Files are copied through a temporary file in the destination directory
//! and moved into place with `persist_noclobber`, so a destination file is
//! never overwritten or left half-written, even when two control processes
//! race on the same path.

use std::fs::{self, File};
use std::io;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{AppError, Result};

/// Counts produced by a single [`copy_tree`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    /// Files (and symlinks) newly created at the destination.
    pub files_copied: u64,
    /// Bytes written for newly created files.
    pub bytes_copied: u64,
    /// Files left untouched because the destination already had them.
    pub files_skipped: u64,
}

impl SyncSummary {
    /// Accumulate another summary into this one.
    pub fn absorb(&mut self, other: Self) {
        self.files_copied += other.files_copied;
        self.bytes_copied += other.bytes_copied;
        self.files_skipped += other.files_skipped;
    }
}

/// Copy the contents of `source` into `dest`, creating `dest` if needed.
///
/// With `skip_existing`, destination files that already exist are left
/// untouched. Without it, they are replaced atomically.
///
/// # Errors
///
/// Returns `AppError::Io` on any traversal, read, or write failure.
pub fn copy_tree(source: &Path, dest: &Path, skip_existing: bool) -> Result<SyncSummary> {
    let mut summary = SyncSummary::default();
    fs::create_dir_all(dest).map_err(|err| io_error("create", dest, &err))?;

    for entry in WalkDir::new(source).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|err| AppError::Io(format!("walk {}: {err}", source.display())))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| AppError::Io(format!("strip prefix: {err}")))?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|err| io_error("create", &target, &err))?;
            continue;
        }

        if fs::symlink_metadata(&target).is_ok() {
            if skip_existing {
                summary.files_skipped += 1;
                continue;
            }
            if file_type.is_symlink() {
                fs::remove_file(&target).map_err(|err| io_error("replace", &target, &err))?;
            }
        }

        if file_type.is_symlink() {
            if copy_symlink(entry.path(), &target)? {
                summary.files_copied += 1;
            } else {
                summary.files_skipped += 1;
            }
            continue;
        }

        match copy_file(entry.path(), &target, skip_existing)? {
            Some(bytes) => {
                summary.files_copied += 1;
                summary.bytes_copied += bytes;
            }
            None => summary.files_skipped += 1,
        }
    }

    debug!(
        source = %source.display(),
        dest = %dest.display(),
        copied = summary.files_copied,
        skipped = summary.files_skipped,
        "tree synchronised"
    );
    Ok(summary)
}

/// Copy one regular file. Returns `None` when a concurrent writer created
/// the destination first.
fn copy_file(source: &Path, target: &Path, skip_existing: bool) -> Result<Option<u64>> {
    let parent = target
        .parent()
        .ok_or_else(|| AppError::Io(format!("{} has no parent directory", target.display())))?;

    let mut input = File::open(source).map_err(|err| io_error("open", source, &err))?;
    let mut tmp = NamedTempFile::new_in(parent)
        .map_err(|err| io_error("create temporary file in", parent, &err))?;
    let bytes = io::copy(&mut input, tmp.as_file_mut())
        .map_err(|err| io_error("copy", source, &err))?;

    if let Ok(meta) = fs::metadata(source) {
        if let Err(err) = tmp.as_file().set_permissions(meta.permissions()) {
            warn!(path = %target.display(), %err, "failed to carry permissions over");
        }
    }

    if skip_existing {
        match tmp.persist_noclobber(target) {
            Ok(_) => Ok(Some(bytes)),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(None),
            Err(err) => Err(io_error("persist", target, &err.error)),
        }
    } else {
        tmp.persist(target)
            .map_err(|err| io_error("persist", target, &err.error))?;
        Ok(Some(bytes))
    }
}

#[cfg(unix)]
fn copy_symlink(source: &Path, target: &Path) -> Result<bool> {
    let link = fs::read_link(source).map_err(|err| io_error("read link", source, &err))?;
    match std::os::unix::fs::symlink(&link, target) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(io_error("symlink", target, &err)),
    }
}

#[cfg(not(unix))]
fn copy_symlink(source: &Path, target: &Path) -> Result<bool> {
    let resolved = fs::canonicalize(source).map_err(|err| io_error("resolve", source, &err))?;
    Ok(copy_file(&resolved, target, true)?.is_some())
}

fn io_error(action: &str, path: &Path, err: &io::Error) -> AppError {
    AppError::Io(format!("failed to {action} {}: {err}", path.display()))
}
