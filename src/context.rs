//! Store layout resolution.
//!
//! This module provides the path layer that maps a store root directory to
//! the canonical locations of everything the engine persists. All engine
//! code resolves paths through [`StoreContext`] so the on-disk layout is
//! defined in exactly one place:
//!
//! ```text
//! {root}/
//!   store.yaml            shared configuration (read-mostly, watched)
//!   objects/              one JSON document per application
//!   server.json           server configuration document
//!   roles.json            role configuration document
//!   roots/                per-application request-root directories
//!   locks/                lock-state directory (journal records)
//!   audit.ndjson          audit log (when enabled by the host)
//! ```

use crate::error::{Result, StoreError};
use std::path::{Path, PathBuf};

/// Document file extension for persisted artifacts.
pub const DOCUMENT_EXT: &str = "json";

/// Resolved paths for an object store instance. All paths are absolute as
/// long as the root is.
#[derive(Debug, Clone)]
pub struct StoreContext {
    /// The store root directory.
    pub root: PathBuf,

    /// Directory holding one document per application.
    pub objects_dir: PathBuf,

    /// Directory holding per-application request roots.
    pub roots_dir: PathBuf,

    /// Lock-state directory for persisted lock bookkeeping.
    pub locks_dir: PathBuf,
}

impl StoreContext {
    /// Resolve the layout under a store root.
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref().to_path_buf();
        Self {
            objects_dir: root.join("objects"),
            roots_dir: root.join("roots"),
            locks_dir: root.join("locks"),
            root,
        }
    }

    /// Create the directory skeleton if any of it is missing.
    pub fn ensure_layout(&self) -> Result<()> {
        for dir in [&self.root, &self.objects_dir, &self.roots_dir, &self.locks_dir] {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::io("create directory", dir, e))?;
        }
        Ok(())
    }

    /// Path of the shared configuration file.
    pub fn config_path(&self) -> PathBuf {
        self.root.join("store.yaml")
    }

    /// Path of an application's document file.
    pub fn document_path(&self, name: &str) -> PathBuf {
        self.objects_dir.join(format!("{}.{}", name, DOCUMENT_EXT))
    }

    /// Path of the server configuration document.
    pub fn server_config_path(&self) -> PathBuf {
        self.root.join(format!("server.{}", DOCUMENT_EXT))
    }

    /// Path of the role configuration document.
    pub fn roles_config_path(&self) -> PathBuf {
        self.root.join(format!("roles.{}", DOCUMENT_EXT))
    }

    /// Path of an application's request-root directory.
    pub fn request_root(&self, root_path: &str) -> PathBuf {
        self.roots_dir.join(root_path)
    }

    /// Path of the default audit log file.
    pub fn audit_path(&self) -> PathBuf {
        self.root.join("audit.ndjson")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn layout_hangs_off_the_root() {
        let ctx = StoreContext::new("/srv/store");
        assert_eq!(ctx.objects_dir, Path::new("/srv/store/objects"));
        assert_eq!(ctx.locks_dir, Path::new("/srv/store/locks"));
        assert_eq!(ctx.config_path(), Path::new("/srv/store/store.yaml"));
        assert_eq!(
            ctx.document_path("Orders"),
            Path::new("/srv/store/objects/Orders.json")
        );
        assert_eq!(
            ctx.request_root("orders"),
            Path::new("/srv/store/roots/orders")
        );
        assert_eq!(ctx.server_config_path(), Path::new("/srv/store/server.json"));
        assert_eq!(ctx.roles_config_path(), Path::new("/srv/store/roles.json"));
    }

    #[test]
    fn ensure_layout_creates_the_skeleton() {
        let temp = TempDir::new().unwrap();
        let ctx = StoreContext::new(temp.path().join("store"));

        ctx.ensure_layout().unwrap();

        assert!(ctx.objects_dir.is_dir());
        assert!(ctx.roots_dir.is_dir());
        assert!(ctx.locks_dir.is_dir());
    }

    #[test]
    fn ensure_layout_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let ctx = StoreContext::new(temp.path());
        ctx.ensure_layout().unwrap();
        ctx.ensure_layout().unwrap();
    }
}
