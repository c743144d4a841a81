//! Atomic file write operations.
//!
//! Artifact documents, lock records, and configuration files must never be
//! observable in a half-written state: a reader that loses the race against
//! a writer still sees either the old bytes or the new bytes, nothing in
//! between.
//!
//! All atomic writes follow the same pattern:
//! 1. Write content to a temporary file in the same directory
//! 2. Sync the file to disk (fsync)
//! 3. Atomically rename the temporary file over the target
//!
//! Source and destination stay in one directory, so the rename never
//! crosses a filesystem boundary. On POSIX, `rename()` replaces an existing
//! destination atomically. On crash, a stray `.{filename}.tmp` may remain;
//! the catalog scan ignores such files.

use crate::error::{Result, StoreError};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Atomically write bytes to a file.
///
/// The parent directory is created when missing. On any failure the
/// temporary file is removed and the target is untouched.
pub fn atomic_write<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<()> {
    let path = path.as_ref();

    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent).map_err(|e| StoreError::io("create directory", parent, e))?;
    }

    let temp_path = temp_path_for(path)?;
    write_and_sync(&temp_path, content)?;
    replace(&temp_path, path)?;

    Ok(())
}

/// Atomically write a string to a file.
///
/// Convenience wrapper around [`atomic_write`] for text content.
pub fn atomic_write_str<P: AsRef<Path>>(path: P, content: &str) -> Result<()> {
    atomic_write(path, content.as_bytes())
}

/// Temporary file path in the same directory as the target.
fn temp_path_for(target: &Path) -> Result<PathBuf> {
    let parent = target.parent().unwrap_or(Path::new("."));
    let filename = target
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            StoreError::io(
                "resolve",
                target,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid file name"),
            )
        })?;

    Ok(parent.join(format!(".{}.tmp", filename)))
}

/// Write content to a file and sync it to disk.
fn write_and_sync(path: &Path, content: &[u8]) -> Result<()> {
    let mut file = File::create(path).map_err(|e| StoreError::io("create", path, e))?;

    file.write_all(content).map_err(|e| {
        let _ = fs::remove_file(path);
        StoreError::io("write", path, e)
    })?;

    file.sync_all().map_err(|e| {
        let _ = fs::remove_file(path);
        StoreError::io("sync", path, e)
    })?;

    Ok(())
}

/// Atomically replace the target file with the source file.
fn replace(source: &Path, target: &Path) -> Result<()> {
    fs::rename(source, target).map_err(|e| {
        let _ = fs::remove_file(source);
        StoreError::io("replace", target, e)
    })?;

    // Sync the parent directory so the new directory entry is durable.
    if let Some(parent) = target.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }

    Ok(())
}
