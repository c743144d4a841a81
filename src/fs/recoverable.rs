//! Recoverable file operations: move-aside with undo.
//!
//! Filesystem rename is not transactional across "replace A with B",
//! especially when a save must update a document file and a directory tree
//! together, or when old and new names collide case-insensitively. The
//! engine therefore moves the current content *aside* before a risky
//! multi-step write:
//!
//! - [`RecoverableMove::new`] renames an existing path to a unique sibling
//!   backup (bounded retries with fresh suffixes).
//! - On failure, [`RecoverableMove::recover`] puts the original back.
//! - On success, [`RecoverableMove::delete`] discards the backup, or
//!   [`RecoverableMove::rename_to`] turns the backup into the content of a
//!   new location.
//!
//! Backup names start with a dot (`.{name}.bak-{suffix}`), so the catalog
//! scan's default ignore patterns skip them. An instance dropped without
//! recover/delete leaves its backup behind for the same reason.

use crate::error::{Result, StoreError};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::warn;

/// Bounded attempts at finding an unused backup name.
const MAX_BACKUP_ATTEMPTS: u32 = 8;

static SUFFIX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A single path moved aside so the caller can mutate its location and
/// still undo.
///
/// Invariant: while `backup` is set, the original path has been moved to
/// the backup location; when `backup` is `None`, either the original never
/// existed or the operation has been recovered or finalized.
#[derive(Debug)]
pub struct RecoverableMove {
    original: PathBuf,
    backup: Option<PathBuf>,
}

impl RecoverableMove {
    /// Move `path` aside to a generated unique backup name in the same
    /// parent directory.
    ///
    /// If `path` does not exist the operation is an inert placeholder:
    /// `recover` and `delete` return false, `rename_to` trivially succeeds.
    ///
    /// Fails with [`StoreError::BackupFailed`] when no backup name could be
    /// claimed within the bounded retries.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let original = path.as_ref().to_path_buf();

        if fs::symlink_metadata(&original).is_err() {
            return Ok(Self {
                original,
                backup: None,
            });
        }

        for _ in 0..MAX_BACKUP_ATTEMPTS {
            let candidate = backup_candidate(&original)?;
            if fs::symlink_metadata(&candidate).is_ok() {
                continue;
            }
            match fs::rename(&original, &candidate) {
                Ok(()) => {
                    return Ok(Self {
                        original,
                        backup: Some(candidate),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StoreError::io("move aside", &original, e)),
            }
        }

        Err(StoreError::BackupFailed {
            path: original,
            attempts: MAX_BACKUP_ATTEMPTS,
        })
    }

    /// The path this operation guards.
    pub fn original(&self) -> &Path {
        &self.original
    }

    /// Whether a backup is currently being tracked.
    pub fn has_backup(&self) -> bool {
        self.backup.is_some()
    }

    /// Undo: remove whatever now occupies the original path and rename the
    /// backup back into place.
    ///
    /// Returns true on success; false when there is nothing to recover or
    /// the restore failed (the backup is retained in that case so the call
    /// can be retried). Calling again after a successful recover returns
    /// false and changes nothing.
    pub fn recover(&mut self) -> bool {
        let Some(backup) = self.backup.take() else {
            return false;
        };

        if let Err(e) = remove_any(&self.original) {
            warn!(path = %self.original.display(), error = %e, "recover could not clear original path");
            self.backup = Some(backup);
            return false;
        }

        match fs::rename(&backup, &self.original) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    from = %backup.display(),
                    to = %self.original.display(),
                    error = %e,
                    "recover could not restore backup"
                );
                self.backup = Some(backup);
                false
            }
        }
    }

    /// Move the backed-up content to a new location, replacing anything
    /// already there.
    ///
    /// Without a backup this trivially succeeds (there is nothing to move).
    /// On success the operation tracks `new_path`, so a later
    /// [`RecoverableMove::delete`] removes the relocated content.
    pub fn rename_to<P: AsRef<Path>>(&mut self, new_path: P) -> bool {
        let new_path = new_path.as_ref();
        let Some(backup) = self.backup.take() else {
            return true;
        };

        if let Err(e) = remove_any(new_path) {
            warn!(path = %new_path.display(), error = %e, "rename target could not be cleared");
            self.backup = Some(backup);
            return false;
        }

        match fs::rename(&backup, new_path) {
            Ok(()) => {
                self.backup = Some(new_path.to_path_buf());
                true
            }
            Err(e) => {
                warn!(
                    from = %backup.display(),
                    to = %new_path.display(),
                    error = %e,
                    "rename of backup failed"
                );
                self.backup = Some(backup);
                false
            }
        }
    }

    /// Finalize: remove the tracked backup (or relocated content) if present.
    pub fn delete(&mut self) -> bool {
        let Some(backup) = self.backup.take() else {
            return false;
        };

        match remove_any(&backup) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %backup.display(), error = %e, "failed to delete backup");
                self.backup = Some(backup);
                false
            }
        }
    }
}

/// Generate a backup path candidate next to the original.
fn backup_candidate(original: &Path) -> Result<PathBuf> {
    let parent = original.parent().unwrap_or(Path::new("."));
    let filename = original
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| {
            StoreError::io(
                "resolve",
                original,
                io::Error::new(io::ErrorKind::InvalidInput, "invalid file name"),
            )
        })?;

    // Process id, a monotonic counter, and the clock make the suffix unique
    // across processes and across rapid retries within one process.
    let suffix = format!(
        "{:x}-{:x}-{:x}",
        std::process::id(),
        SUFFIX_COUNTER.fetch_add(1, Ordering::Relaxed),
        chrono::Utc::now().timestamp_subsec_nanos(),
    );
    Ok(parent.join(format!(".{}.bak-{}", filename, suffix)))
}

/// Remove a file or directory tree; absence is not an error.
fn remove_any(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
