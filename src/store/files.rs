//! Ad hoc application-file operations.
//!
//! Each application owns a request-root directory; callers store arbitrary
//! supporting files (templates, assets, uploads) under it. These operations
//! resolve relative paths through the virtual-directory map, require the
//! owning artifact's lock (unless the `unlocked_file_ops` compatibility
//! flag is set), and serialize per-path through the busy gate.
//!
//! Overwriting is an explicit caller decision: saves and renames take an
//! `overwrite` flag and report whether the target already existed, so the
//! dispatch layer can distinguish create from update.

use super::ObjectStore;
use crate::acl::Access;
use crate::artifact::ArtifactKind;
use crate::catalog::ObjectSummary;
use crate::error::{Result, StoreError};
use crate::fs::RecoverableMove;
use crate::identity::LockerIdentity;
use std::path::{Component, Path, PathBuf};

impl ObjectStore {
    /// Resolve a relative file path under an application's request root.
    ///
    /// Rejects absolute paths and any traversal outside the root.
    fn resolve_application_file(
        &self,
        app: &str,
        relative: &str,
    ) -> Result<(ObjectSummary, PathBuf)> {
        let summary = self.catalog.get_by_name(app).ok_or_else(|| {
            StoreError::NotFound {
                kind: ArtifactKind::Application,
                name: app.to_string(),
            }
        })?;

        let rel = Path::new(relative);
        let legal = !relative.is_empty()
            && !relative.contains('\\')
            && rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !legal {
            return Err(StoreError::ValidationFailed {
                name: relative.to_string(),
                reason: "file paths must be relative and must not traverse outside the \
                         application root"
                    .to_string(),
            });
        }

        let root = self
            .vdirs
            .resolve(&summary.name)
            .unwrap_or_else(|| self.ctx.request_root(&summary.root_path));
        let path = root.join(rel);
        Ok((summary, path))
    }

    /// Require the application lock unless the compatibility flag waives it.
    fn require_file_lock(&self, app_name: &str, actor: &LockerIdentity) -> Result<()> {
        if self.current_config().unlocked_file_ops {
            return Ok(());
        }
        let key = self.lock_key(ArtifactKind::Application, app_name);
        self.require_lock(actor, &key)
    }

    /// Write a file under an application's request root.
    ///
    /// Returns whether the target already existed. An existing target
    /// without `overwrite` fails with `NonUnique`.
    pub fn save_application_file(
        &self,
        app: &str,
        relative: &str,
        content: &[u8],
        overwrite: bool,
        actor: &LockerIdentity,
    ) -> Result<bool> {
        let (summary, path) = self.resolve_application_file(app, relative)?;
        self.check_application_acl(actor, &summary.name, Access::Update)?;
        self.require_file_lock(&summary.name, actor)?;

        let _busy = self.gate.enter(&path);

        let existed = path.exists();
        if existed && !overwrite {
            return Err(StoreError::NonUnique {
                name: relative.to_string(),
                detail: "file already exists and overwrite was not requested".to_string(),
            });
        }

        crate::fs::atomic_write(&path, content)?;
        Ok(existed)
    }

    /// Read a file under an application's request root.
    pub fn load_application_file(
        &self,
        app: &str,
        relative: &str,
        actor: &LockerIdentity,
    ) -> Result<Vec<u8>> {
        let (summary, path) = self.resolve_application_file(app, relative)?;
        self.check_application_acl(actor, &summary.name, Access::Read)?;

        let _busy = self.gate.enter(&path);
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind: ArtifactKind::Application,
                name: format!("{}/{}", summary.name, relative),
            });
        }
        std::fs::read(&path).map_err(|e| StoreError::io("read", &path, e))
    }

    /// Remove a file (or directory tree) under an application's request
    /// root.
    pub fn remove_application_file(
        &self,
        app: &str,
        relative: &str,
        actor: &LockerIdentity,
    ) -> Result<()> {
        let (summary, path) = self.resolve_application_file(app, relative)?;
        self.check_application_acl(actor, &summary.name, Access::Update)?;
        self.require_file_lock(&summary.name, actor)?;

        let _busy = self.gate.enter(&path);

        let meta = std::fs::symlink_metadata(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound {
                    kind: ArtifactKind::Application,
                    name: format!("{}/{}", summary.name, relative),
                }
            } else {
                StoreError::io("stat", &path, e)
            }
        })?;

        if meta.is_dir() {
            std::fs::remove_dir_all(&path).map_err(|e| StoreError::io("delete", &path, e))
        } else {
            std::fs::remove_file(&path).map_err(|e| StoreError::io("delete", &path, e))
        }
    }

    /// Rename a file within an application's request root.
    ///
    /// Returns whether the destination already existed. An existing
    /// destination without `overwrite` fails with `NonUnique`; with it, the
    /// displaced content is moved aside first and restored if the rename
    /// fails.
    pub fn rename_application_file(
        &self,
        app: &str,
        from: &str,
        to: &str,
        overwrite: bool,
        actor: &LockerIdentity,
    ) -> Result<bool> {
        let (summary, from_path) = self.resolve_application_file(app, from)?;
        let (_, to_path) = self.resolve_application_file(app, to)?;
        self.check_application_acl(actor, &summary.name, Access::Update)?;
        self.require_file_lock(&summary.name, actor)?;

        let _busy = self.gate.enter_many(&[&from_path, &to_path]);

        if !from_path.exists() {
            return Err(StoreError::NotFound {
                kind: ArtifactKind::Application,
                name: format!("{}/{}", summary.name, from),
            });
        }

        let existed = to_path.exists();
        if existed && !overwrite {
            return Err(StoreError::NonUnique {
                name: to.to_string(),
                detail: "destination already exists and overwrite was not requested".to_string(),
            });
        }

        if let Some(parent) = to_path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::io("create directory", parent, e))?;
        }

        let mut displaced = RecoverableMove::new(&to_path)?;
        match std::fs::rename(&from_path, &to_path) {
            Ok(()) => {
                displaced.delete();
                Ok(existed)
            }
            Err(e) => {
                displaced.recover();
                Err(StoreError::io("rename", &from_path, e))
            }
        }
    }
}
