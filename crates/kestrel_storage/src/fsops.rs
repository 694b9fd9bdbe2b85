//! Crash-safe filesystem primitives.

use crate::error::StorageResult;
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Fsyncs a directory so that creations, renames and deletions inside it
/// are durable.
///
/// On non-Unix platforms this is a no-op; the filesystem journal already
/// orders metadata updates there.
///
/// # Errors
///
/// Returns an error if the directory cannot be opened or synced.
#[cfg(unix)]
pub fn sync_directory(dir: &Path) -> StorageResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

/// Fsyncs a directory so that creations, renames and deletions inside it
/// are durable.
///
/// # Errors
///
/// Never fails on this platform.
#[cfg(not(unix))]
pub fn sync_directory(_dir: &Path) -> StorageResult<()> {
    Ok(())
}

/// Atomically replaces `target` with the fully written `staged` file.
///
/// The staged file is fsynced, renamed over the target and the parent
/// directory is fsynced, so after a crash either the old or the new
/// contents are visible, never a mix.
///
/// # Errors
///
/// Returns an error if any of the sync or rename steps fail. The target is
/// left untouched in that case.
pub fn replace_file(staged: &Path, target: &Path) -> StorageResult<()> {
    File::open(staged)?.sync_all()?;
    fs::rename(staged, target)?;
    if let Some(parent) = target.parent() {
        sync_directory(parent)?;
    }
    tracing::debug!(target = %target.display(), "replaced file atomically");
    Ok(())
}

/// Deletes a file, treating a missing file as success.
///
/// Returns `true` when a file was actually removed.
///
/// # Errors
///
/// Returns any I/O error other than `NotFound`.
pub fn remove_file_if_exists(path: &Path) -> StorageResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn replace_swaps_contents() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("catalog.boot");
        let staged = dir.path().join("catalog.boot.tmp");
        fs::write(&target, b"old").unwrap();
        File::create(&staged).unwrap().write_all(b"new").unwrap();

        replace_file(&staged, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new");
        assert!(!staged.exists());
    }

    #[test]
    fn remove_missing_file_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.entity");
        fs::write(&path, b"x").unwrap();

        assert!(remove_file_if_exists(&path).unwrap());
        assert!(!remove_file_if_exists(&path).unwrap());
    }

    #[test]
    fn sync_directory_succeeds() {
        let dir = tempdir().unwrap();
        sync_directory(dir.path()).unwrap();
    }
}
