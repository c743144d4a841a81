//! The object store engine.
//!
//! [`ObjectStore`] composes the lock manager, summary catalog, recoverable
//! file operations, ACL checks, and listener notification into the
//! higher-level operations the request-dispatch layer calls: locked
//! load/save/delete for applications and the singleton server/role
//! configuration documents, plus ad hoc file operations under each
//! application's request root.
//!
//! Every mutating operation follows the same strict order: validate →
//! ACL-check → lock-check → pre-move files → write new content → update
//! catalog → notify listeners. Later steps assume earlier steps'
//! postconditions, so the sequence is never reordered. On failure after the
//! pre-move step, every recoverable operation is recovered and the catalog
//! is left unchanged; the caller's lock is NOT released on failure; the
//! caller keeps it for a retry.
//!
//! The engine is constructed explicitly (one instance per store root,
//! injected into consumers); there is no global instance, and tests build
//! fresh stores per test.

use crate::acl::{Access, AccessPolicy, AclHandle, HandlePolicy};
use crate::artifact::{ArtifactDocument, ArtifactKind, ArtifactValidator, EnvelopeValidator};
use crate::catalog::{ObjectSummary, SummaryCatalog, repair_duplicate_ids};
use crate::config::{StoreConfig, WatchedConfig};
use crate::context::{DOCUMENT_EXT, StoreContext};
use crate::error::{Result, StoreError};
use crate::identity::LockerIdentity;
use crate::listeners::{ListenerRegistry, StoreEvent, StoreListener};
use crate::locks::journal::LockJournal;
use crate::locks::{LockInfo, LockKey, LockManager, Wait};
use busy::PathGate;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;
use tracing::{debug, warn};
use vdir::VirtualDirMap;

pub mod busy;
pub mod vdir;

mod files;
mod save;


/// Canonical name of the server configuration document.
pub const SERVER_CONFIG_NAME: &str = "server";

/// Canonical name of the role configuration document.
pub const ROLES_CONFIG_NAME: &str = "roles";

/// Lock-guarded, versioned object store over one root directory.
pub struct ObjectStore {
    ctx: StoreContext,
    config: Mutex<WatchedConfig>,
    locks: LockManager,
    catalog: SummaryCatalog,
    listeners: ListenerRegistry,
    vdirs: VirtualDirMap,
    gate: Arc<PathGate>,
    policy: Arc<dyn AccessPolicy>,
    validator: Arc<dyn ArtifactValidator>,
}

impl ObjectStore {
    /// Open a store with the default ACL policy and validator.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        Self::open_with(
            root,
            Arc::new(HandlePolicy),
            Arc::new(EnvelopeValidator),
        )
    }

    /// Open a store with an explicit ACL policy and validator.
    ///
    /// Creates the directory layout when missing, loads the shared
    /// configuration, reloads persisted locks, scans the objects directory
    /// into the catalog (repairing duplicate or invalid ids), and registers
    /// every application's request root.
    pub fn open_with<P: AsRef<Path>>(
        root: P,
        policy: Arc<dyn AccessPolicy>,
        validator: Arc<dyn ArtifactValidator>,
    ) -> Result<Self> {
        let ctx = StoreContext::new(root);
        ctx.ensure_layout()?;

        let config = WatchedConfig::load(ctx.config_path())?;

        let mut locks = LockManager::new(StdDuration::from_millis(config.config().lock_poll_ms));
        if config.config().persist_locks {
            locks = locks.with_journal(LockJournal::new(&ctx.locks_dir));
        }

        let store = Self {
            config: Mutex::new(config),
            locks,
            catalog: SummaryCatalog::new(),
            listeners: ListenerRegistry::new(),
            vdirs: VirtualDirMap::new(),
            gate: Arc::new(PathGate::new()),
            policy,
            validator,
            ctx,
        };

        store.scan()?;
        Ok(store)
    }

    /// The resolved store layout.
    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    /// Register a change listener.
    pub fn add_listener(&self, listener: Arc<dyn StoreListener>) {
        self.listeners.add(listener);
    }

    /// Deregister a change listener.
    pub fn remove_listener(&self, listener: &Arc<dyn StoreListener>) {
        self.listeners.remove(listener);
    }

    /// Snapshot of the current configuration, re-reading the config file
    /// first when its fingerprint changed.
    pub fn current_config(&self) -> StoreConfig {
        let mut watched = self
            .config
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        if let Err(e) = watched.refresh() {
            warn!(error = %e, "config refresh failed, keeping cached values");
        }
        watched.config().clone()
    }

    // =========================================================================
    // Startup scan
    // =========================================================================

    /// Scan the objects directory into the catalog.
    fn scan(&self) -> Result<()> {
        let ignore = self.current_config().ignore_set()?;

        let entries = std::fs::read_dir(&self.ctx.objects_dir)
            .map_err(|e| StoreError::io("read directory", &self.ctx.objects_dir, e))?;

        let mut docs: Vec<(ArtifactDocument, Option<DateTime<Utc>>)> = Vec::new();
        for entry in entries {
            let entry = entry
                .map_err(|e| StoreError::io("read directory", &self.ctx.objects_dir, e))?;
            let path = entry.path();
            let file_name = entry.file_name();

            if ignore.is_match(&file_name) {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(DOCUMENT_EXT) {
                continue;
            }

            match ArtifactDocument::load(&path) {
                Ok(doc) => {
                    let modified = entry
                        .metadata()
                        .and_then(|m| m.modified())
                        .ok()
                        .map(DateTime::<Utc>::from);
                    docs.push((doc, modified));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable document");
                }
            }
        }

        self.catalog_documents(docs);
        Ok(())
    }

    /// Repair ids, persist corrections, and fill catalog and vdir map.
    fn catalog_documents(&self, mut docs: Vec<(ArtifactDocument, Option<DateTime<Utc>>)>) {
        let mut documents: Vec<ArtifactDocument> = docs.iter().map(|(d, _)| d.clone()).collect();
        let repairs = repair_duplicate_ids(&mut documents);

        for repair in &repairs {
            let doc = &documents[repair.index];
            let path = self.ctx.document_path(&doc.name);
            let persisted = doc
                .to_json(&path)
                .and_then(|json| crate::fs::atomic_write(&path, json.as_bytes()));

            match persisted {
                Ok(()) => {
                    debug!(
                        artifact = %doc.name,
                        old_id = repair.old_id,
                        new_id = repair.new_id,
                        "renumbered duplicate artifact id"
                    );
                    docs[repair.index].0.id = repair.new_id;
                }
                Err(e) => {
                    // The server continues with the artifact un-renumbered.
                    warn!(
                        artifact = %doc.name,
                        old_id = repair.old_id,
                        error = %e,
                        "failed to persist repaired id, leaving artifact as found"
                    );
                }
            }
        }

        for (doc, modified) in docs {
            if doc.id < 1 {
                warn!(
                    artifact = %doc.name,
                    id = doc.id,
                    "artifact has no valid id and could not be renumbered, not cataloged"
                );
                continue;
            }
            let summary = ObjectSummary::from_document(&doc, modified);
            self.vdirs
                .register(&summary.name, self.ctx.request_root(&summary.root_path));
            self.catalog.add(summary, false);
        }
    }

    // =========================================================================
    // Locking facade
    // =========================================================================

    /// Lock key for an artifact kind and name.
    pub fn lock_key(&self, kind: ArtifactKind, name: &str) -> LockKey {
        LockKey::new(kind, name)
    }

    /// Lock key from a string resource tag, as supplied by the dispatch
    /// layer. Unknown tags fail with `InvalidResource`.
    pub fn lock_key_from_tag(&self, tag: &str, name: &str) -> Result<LockKey> {
        let kind = match tag {
            "application" => ArtifactKind::Application,
            "server-config" => ArtifactKind::ServerConfig,
            "role-config" => ArtifactKind::RoleConfig,
            other => {
                return Err(StoreError::InvalidResource {
                    kind: other.to_string(),
                });
            }
        };
        Ok(LockKey::new(kind, name))
    }

    /// Acquire or extend a lock for `minutes`.
    ///
    /// By the callers' convention a lease of 0 minutes means "unlock": the
    /// lock is released instead of acquired.
    pub fn lock(
        &self,
        actor: &LockerIdentity,
        key: &LockKey,
        minutes: u32,
        wait: Wait,
    ) -> Result<()> {
        if minutes == 0 {
            self.unlock(actor, key);
            return Ok(());
        }
        self.locks
            .acquire(actor, key, Some(chrono::Duration::minutes(minutes as i64)), wait)
            .into_result()
    }

    /// Release a lock. Releasing a lock not held by `actor` is a no-op.
    pub fn unlock(&self, actor: &LockerIdentity, key: &LockKey) {
        self.locks.release(actor, key);
    }

    /// Whether `actor` holds the lock on `key`.
    pub fn is_locked(&self, actor: &LockerIdentity, key: &LockKey) -> bool {
        self.locks.is_locked(actor, key)
    }

    /// Diagnostic properties of the lock on `key`, if held by anyone.
    pub fn lock_info(&self, key: &LockKey) -> Option<LockInfo> {
        self.locks.lock_info(key)
    }

    /// Require that `actor` holds the lock on `key`.
    fn require_lock(&self, actor: &LockerIdentity, key: &LockKey) -> Result<()> {
        if self.locks.is_locked(actor, key) {
            Ok(())
        } else {
            Err(StoreError::NotLocked {
                kind: key.kind(),
                name: key.name().to_string(),
            })
        }
    }

    /// Extend the lease of a lock the actor already holds.
    fn extend_lease(&self, actor: &LockerIdentity, key: &LockKey) {
        let lease = self.current_config().lease();
        // Same holder: this only ever lengthens the lease.
        let _ = self.locks.acquire(actor, key, Some(lease), Wait::NoWait);
    }

    // =========================================================================
    // ACL checks
    // =========================================================================

    fn check_handle(
        &self,
        actor: &LockerIdentity,
        handle: &AclHandle,
        name: &str,
        access: Access,
    ) -> Result<()> {
        if self.policy.allows(actor, handle, access) {
            Ok(())
        } else {
            Err(StoreError::Unauthorized {
                user: actor.user.clone(),
                name: name.to_string(),
                access,
            })
        }
    }

    /// ACL check against a cataloged application.
    fn check_application_acl(
        &self,
        actor: &LockerIdentity,
        name: &str,
        access: Access,
    ) -> Result<()> {
        let handle = self
            .catalog
            .acl_for(name)
            .ok_or_else(|| StoreError::NotFound {
                kind: ArtifactKind::Application,
                name: name.to_string(),
            })?;
        self.check_handle(actor, &handle, name, access)
    }

    // =========================================================================
    // Applications: read side
    // =========================================================================

    /// Point-in-time snapshot of every cataloged application summary.
    pub fn summaries(&self) -> Vec<ObjectSummary> {
        self.catalog.snapshot()
    }

    /// Summary of one application, if present.
    pub fn summary(&self, name: &str) -> Option<ObjectSummary> {
        self.catalog.get_by_name(name)
    }

    /// Summary of one application by id, if present.
    pub fn summary_by_id(&self, id: i64) -> Option<ObjectSummary> {
        self.catalog.get(id)
    }

    /// Load an application document for reading. Never touches lock state.
    pub fn load_application(
        &self,
        name: &str,
        actor: &LockerIdentity,
    ) -> Result<ArtifactDocument> {
        let summary = self.catalog.get_by_name(name).ok_or_else(|| {
            StoreError::NotFound {
                kind: ArtifactKind::Application,
                name: name.to_string(),
            }
        })?;
        self.check_application_acl(actor, &summary.name, Access::Read)?;

        let path = self.ctx.document_path(&summary.name);
        let _busy = self.gate.enter(&path);
        ArtifactDocument::load(&path)
    }

    /// Load an application document for editing.
    ///
    /// The caller must already hold the application's lock; the lease is
    /// extended as a side effect. Requires read and update access.
    pub fn load_application_for_edit(
        &self,
        name: &str,
        actor: &LockerIdentity,
    ) -> Result<ArtifactDocument> {
        let summary = self.catalog.get_by_name(name).ok_or_else(|| {
            StoreError::NotFound {
                kind: ArtifactKind::Application,
                name: name.to_string(),
            }
        })?;

        let key = self.lock_key(ArtifactKind::Application, &summary.name);
        self.require_lock(actor, &key)?;
        self.extend_lease(actor, &key);

        self.check_application_acl(actor, &summary.name, Access::Read)?;
        self.check_application_acl(actor, &summary.name, Access::Update)?;

        let path = self.ctx.document_path(&summary.name);
        let _busy = self.gate.enter(&path);
        ArtifactDocument::load(&path)
    }

    // =========================================================================
    // Applications: delete
    // =========================================================================

    /// Delete an application: its catalog entry, document file, and request
    /// root.
    ///
    /// Deletion is forward-only. A failure partway through is surfaced but
    /// not rolled back; the artifact may be left partially removed.
    /// Listener failures never fail a delete that already succeeded.
    pub fn delete_application(&self, name: &str, actor: &LockerIdentity) -> Result<()> {
        let summary = self.catalog.get_by_name(name).ok_or_else(|| {
            StoreError::NotFound {
                kind: ArtifactKind::Application,
                name: name.to_string(),
            }
        })?;

        self.check_application_acl(actor, &summary.name, Access::Delete)?;
        let key = self.lock_key(ArtifactKind::Application, &summary.name);
        self.require_lock(actor, &key)?;

        let doc_path = self.ctx.document_path(&summary.name);
        let root_path = self.ctx.request_root(&summary.root_path);
        let _busy = self.gate.enter_many(&[&doc_path, &root_path]);

        debug!(artifact = %summary.name, id = summary.id, "deleting application");

        self.catalog.remove(summary.id);

        std::fs::remove_file(&doc_path).map_err(|e| StoreError::io("delete", &doc_path, e))?;
        if root_path.exists() {
            std::fs::remove_dir_all(&root_path)
                .map_err(|e| StoreError::io("delete", &root_path, e))?;
        }

        self.vdirs.unregister(&summary.name);
        self.listeners.notify(
            &actor.actor_string(),
            StoreEvent::ApplicationRemoved(&summary),
        );
        Ok(())
    }

    // =========================================================================
    // Singleton configuration documents
    // =========================================================================

    fn singleton_path(&self, kind: ArtifactKind) -> std::path::PathBuf {
        match kind {
            ArtifactKind::ServerConfig => self.ctx.server_config_path(),
            ArtifactKind::RoleConfig => self.ctx.roles_config_path(),
            ArtifactKind::Application => unreachable!("applications are not singletons"),
        }
    }

    fn singleton_name(kind: ArtifactKind) -> &'static str {
        match kind {
            ArtifactKind::ServerConfig => SERVER_CONFIG_NAME,
            ArtifactKind::RoleConfig => ROLES_CONFIG_NAME,
            ArtifactKind::Application => unreachable!("applications are not singletons"),
        }
    }

    fn load_singleton(
        &self,
        kind: ArtifactKind,
        actor: &LockerIdentity,
        access: Access,
    ) -> Result<ArtifactDocument> {
        let path = self.singleton_path(kind);
        if !path.exists() {
            return Err(StoreError::NotFound {
                kind,
                name: Self::singleton_name(kind).to_string(),
            });
        }

        let doc = {
            let _busy = self.gate.enter(&path);
            ArtifactDocument::load(&path)?
        };

        let handle = AclHandle::compile(&doc.acl, doc.version());
        self.check_handle(actor, &handle, &doc.name, Access::Read)?;
        if access != Access::Read {
            self.check_handle(actor, &handle, &doc.name, access)?;
        }
        Ok(doc)
    }

    /// Load the server configuration for reading.
    pub fn load_server_config(&self, actor: &LockerIdentity) -> Result<ArtifactDocument> {
        self.load_singleton(ArtifactKind::ServerConfig, actor, Access::Read)
    }

    /// Load the server configuration for editing; requires the server-config
    /// lock and extends its lease.
    pub fn load_server_config_for_edit(
        &self,
        actor: &LockerIdentity,
    ) -> Result<ArtifactDocument> {
        let key = self.lock_key(ArtifactKind::ServerConfig, SERVER_CONFIG_NAME);
        self.require_lock(actor, &key)?;
        self.extend_lease(actor, &key);
        self.load_singleton(ArtifactKind::ServerConfig, actor, Access::Update)
    }

    /// Load the role configuration for reading.
    pub fn load_role_config(&self, actor: &LockerIdentity) -> Result<ArtifactDocument> {
        self.load_singleton(ArtifactKind::RoleConfig, actor, Access::Read)
    }

    /// Load the role configuration for editing; requires the role-config
    /// lock and extends its lease.
    pub fn load_role_config_for_edit(&self, actor: &LockerIdentity) -> Result<ArtifactDocument> {
        let key = self.lock_key(ArtifactKind::RoleConfig, ROLES_CONFIG_NAME);
        self.require_lock(actor, &key)?;
        self.extend_lease(actor, &key);
        self.load_singleton(ArtifactKind::RoleConfig, actor, Access::Update)
    }
}

impl std::fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectStore")
            .field("root", &self.ctx.root)
            .field("applications", &self.catalog.len())
            .finish()
    }
}
