//! Save and rename workflows.
//!
//! A save is the one multi-step disk mutation in the engine: it may rename
//! the document file, relocate the request-root directory, write new
//! content, and reindex the catalog, and it must look atomic to everyone
//! else. The sequence is strictly ordered (validate → ACL → lock-check →
//! pre-move → write → catalog → notify), and every step after the pre-move
//! runs under a rollback guard: on failure the move-aside operations are
//! recovered, any freshly created root directory is removed, and the
//! catalog is restored, so on-disk state returns to its pre-call condition.
//! The caller's lock is never released by a failed save.

use super::ObjectStore;
use crate::acl::{Access, AclHandle};
use crate::artifact::{ArtifactDocument, ArtifactKind};
use crate::catalog::ObjectSummary;
use crate::error::{Result, StoreError};
use crate::fs::RecoverableMove;
use crate::identity::LockerIdentity;
use crate::listeners::StoreEvent;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Move-aside operations opened during one save attempt, with the rollback
/// and finalize behavior each needs.
#[derive(Default)]
struct SaveMoves {
    /// The old document file, moved aside on rename. Recovered on failure,
    /// discarded on success.
    old_document: Option<RecoverableMove>,
    /// The old request root, relocated to the new root on root change.
    /// Recovered (moved back) on failure; on success the content is live at
    /// the new location and must NOT be discarded.
    relocated_root: Option<RecoverableMove>,
    /// Whether the new request root directory was created by this attempt.
    created_root: bool,
}

impl SaveMoves {
    fn rollback(&mut self, new_root: &Path) {
        if let Some(op) = &mut self.old_document {
            op.recover();
        }
        if let Some(op) = &mut self.relocated_root {
            op.recover();
        }
        if self.created_root {
            let _ = std::fs::remove_dir_all(new_root);
        }
    }

    fn finalize(&mut self) {
        if let Some(op) = &mut self.old_document {
            op.delete();
        }
        // relocated_root intentionally left alone: its content now lives at
        // the new location.
    }
}

impl ObjectStore {
    /// Save an application document, creating it when new and handling
    /// renames of the name and/or root path.
    ///
    /// The document is updated in place: a fresh id is allocated for new
    /// artifacts, the minor version is bumped, and creation metadata is
    /// stamped on first save. Validation runs when `validate` is requested
    /// or the document is enabled.
    ///
    /// Returns the refreshed catalog summary.
    pub fn save_application(
        &self,
        doc: &mut ArtifactDocument,
        actor: &LockerIdentity,
        validate: bool,
    ) -> Result<ObjectSummary> {
        if validate || doc.enabled {
            self.validator.validate(doc)?;
        }
        // Names and roots become file paths regardless of which validator
        // the host installed.
        crate::artifact::validate_name(&doc.name)?;
        let new_root_name = doc.effective_root();
        crate::artifact::validate_name(&new_root_name)?;

        let existing = if doc.id >= 1 { self.catalog.get(doc.id) } else { None };

        match &existing {
            Some(summary) => {
                self.check_application_acl(actor, &summary.name, Access::Update)?;
                let key = self.lock_key(ArtifactKind::Application, &summary.name);
                self.require_lock(actor, &key)?;
            }
            None => {
                let handle = AclHandle::compile(&doc.acl, doc.version());
                self.check_handle(actor, &handle, &doc.name, Access::Create)?;
                let key = self.lock_key(ArtifactKind::Application, &doc.name);
                self.require_lock(actor, &key)?;
                if self.catalog.contains_name(&doc.name) {
                    return Err(StoreError::NonUnique {
                        name: doc.name.clone(),
                        detail: "name already in use".to_string(),
                    });
                }
            }
        }

        let name_changed = existing.as_ref().is_some_and(|s| s.name != doc.name);
        let root_changed = existing.as_ref().is_some_and(|s| s.root_path != new_root_name);

        if name_changed
            && let Some(other) = self.catalog.get_by_name(&doc.name)
            && other.id != doc.id
        {
            return Err(StoreError::NonUnique {
                name: doc.name.clone(),
                detail: format!("name already in use by artifact {}", other.id),
            });
        }
        if (existing.is_none() || root_changed)
            && let Some(other) = self
                .catalog
                .snapshot()
                .into_iter()
                .find(|s| s.id != doc.id && s.root_path.eq_ignore_ascii_case(&new_root_name))
        {
            return Err(StoreError::NonUnique {
                name: doc.name.clone(),
                detail: format!("root path '{}' already in use by '{}'", new_root_name, other.name),
            });
        }

        // Envelope updates for this save attempt.
        let now = Utc::now();
        doc.minor_version = existing
            .as_ref()
            .map(|s| s.minor_version)
            .unwrap_or(doc.minor_version)
            .saturating_add(1);
        if existing.is_none() {
            if doc.created_by.is_none() {
                doc.created_by = Some(actor.user.clone());
            }
            if doc.created_on.is_none() {
                doc.created_on = Some(now);
            }
        }

        let old_doc_path = existing.as_ref().map(|s| self.ctx.document_path(&s.name));
        let new_doc_path = self.ctx.document_path(&doc.name);
        let old_root = existing.as_ref().map(|s| self.ctx.request_root(&s.root_path));
        let new_root = self.ctx.request_root(&new_root_name);

        let mut gate_paths: Vec<PathBuf> = vec![new_doc_path.clone(), new_root.clone()];
        gate_paths.extend(old_doc_path.clone());
        gate_paths.extend(old_root.clone());
        let _busy = self.gate.enter_many(&gate_paths);

        // New artifacts reserve their catalog entry (and id) up front; a
        // failed attempt removes it again.
        let mut reserved = None;
        if existing.is_none() {
            let allocate = doc.id < 1;
            let id = self.catalog.add(ObjectSummary::from_document(doc, None), allocate);
            doc.id = id;
            reserved = Some(id);
        }

        let mut moves = SaveMoves::default();
        let attempt = self.apply_save(
            doc,
            name_changed,
            root_changed,
            old_doc_path.as_deref(),
            &new_doc_path,
            old_root.as_deref(),
            &new_root,
            &mut moves,
        );

        match attempt {
            Ok(summary) => {
                moves.finalize();
                if name_changed && let Some(old) = &existing {
                    self.vdirs.unregister(&old.name);
                }
                self.vdirs.register(&doc.name, &new_root);

                let actor_string = actor.actor_string();
                if existing.is_none() {
                    debug!(artifact = %doc.name, id = doc.id, "created application");
                    self.listeners
                        .notify(&actor_string, StoreEvent::ApplicationCreated(&summary));
                } else {
                    debug!(artifact = %doc.name, id = doc.id, "saved application");
                    self.listeners
                        .notify(&actor_string, StoreEvent::ApplicationUpdated(&summary));
                }
                Ok(summary)
            }
            Err(e) => {
                moves.rollback(&new_root);
                if let Some(id) = reserved {
                    self.catalog.remove(id);
                }
                Err(e)
            }
        }
    }

    /// The failure-guarded middle of a save: pre-moves, root handling,
    /// document write, catalog update.
    #[allow(clippy::too_many_arguments)]
    fn apply_save(
        &self,
        doc: &ArtifactDocument,
        name_changed: bool,
        root_changed: bool,
        old_doc_path: Option<&Path>,
        new_doc_path: &Path,
        old_root: Option<&Path>,
        new_root: &Path,
        moves: &mut SaveMoves,
    ) -> Result<ObjectSummary> {
        if name_changed && let Some(old_path) = old_doc_path {
            moves.old_document = Some(RecoverableMove::new(old_path)?);
        }

        if root_changed && let Some(old_root) = old_root {
            let mut relocation = RecoverableMove::new(old_root)?;
            if relocation.has_backup() {
                let moved = relocation.rename_to(new_root);
                moves.relocated_root = Some(relocation);
                if !moved {
                    return Err(StoreError::io(
                        "relocate request root",
                        new_root,
                        std::io::Error::other("could not move directory into place"),
                    ));
                }
            }
        }
        if !new_root.exists() {
            std::fs::create_dir_all(new_root)
                .map_err(|e| StoreError::io("create directory", new_root, e))?;
            moves.created_root = true;
        }

        let json = doc.to_json(new_doc_path)?;
        crate::fs::atomic_write(new_doc_path, json.as_bytes())?;

        let summary = ObjectSummary::from_document(doc, Some(Utc::now()));
        self.catalog.add(summary.clone(), false);
        Ok(summary)
    }

    // =========================================================================
    // Singleton configuration saves
    // =========================================================================

    /// Save the server configuration document. Requires the server-config
    /// lock.
    pub fn save_server_config(
        &self,
        doc: &mut ArtifactDocument,
        actor: &LockerIdentity,
        validate: bool,
    ) -> Result<()> {
        self.save_singleton(ArtifactKind::ServerConfig, doc, actor, validate)
    }

    /// Save the role configuration document. Requires the role-config lock.
    pub fn save_role_config(
        &self,
        doc: &mut ArtifactDocument,
        actor: &LockerIdentity,
        validate: bool,
    ) -> Result<()> {
        self.save_singleton(ArtifactKind::RoleConfig, doc, actor, validate)
    }

    fn save_singleton(
        &self,
        kind: ArtifactKind,
        doc: &mut ArtifactDocument,
        actor: &LockerIdentity,
        validate: bool,
    ) -> Result<()> {
        let canonical = Self::singleton_name(kind);
        if doc.name != canonical {
            return Err(StoreError::ValidationFailed {
                name: doc.name.clone(),
                reason: format!("{} document must be named '{}'", kind, canonical),
            });
        }
        if validate || doc.enabled {
            self.validator.validate(doc)?;
        }

        let key = self.lock_key(kind, canonical);
        self.require_lock(actor, &key)?;

        let path = self.singleton_path(kind);
        let _busy = self.gate.enter(&path);

        // ACL and version base come from the current on-disk document.
        let current = if path.exists() {
            Some(ArtifactDocument::load(&path)?)
        } else {
            None
        };
        match &current {
            Some(current) => {
                let handle = AclHandle::compile(&current.acl, current.version());
                self.check_handle(actor, &handle, canonical, Access::Update)?;
                doc.minor_version = current.minor_version.saturating_add(1);
            }
            None => {
                let handle = AclHandle::compile(&doc.acl, doc.version());
                self.check_handle(actor, &handle, canonical, Access::Create)?;
                doc.minor_version = doc.minor_version.saturating_add(1);
                if doc.created_by.is_none() {
                    doc.created_by = Some(actor.user.clone());
                }
                if doc.created_on.is_none() {
                    doc.created_on = Some(Utc::now());
                }
            }
        }

        let mut backup = RecoverableMove::new(&path)?;
        let json = doc.to_json(&path)?;
        match crate::fs::atomic_write(&path, json.as_bytes()) {
            Ok(()) => {
                backup.delete();
                let event = match kind {
                    ArtifactKind::ServerConfig => StoreEvent::ServerConfigSaved,
                    ArtifactKind::RoleConfig => StoreEvent::RoleConfigSaved,
                    ArtifactKind::Application => unreachable!("applications are not singletons"),
                };
                debug!(document = canonical, "saved configuration document");
                self.listeners.notify(&actor.actor_string(), event);
                Ok(())
            }
            Err(e) => {
                backup.recover();
                Err(e)
            }
        }
    }
}
