//! Error types for the coffer object store.
//!
//! Uses thiserror for derive macros. The whole subsystem surfaces a single
//! tagged error enum instead of a hierarchy of failure classes: callers
//! match on the variant to map a failure to whatever external status
//! representation they need.

use crate::artifact::ArtifactKind;
use crate::locks::LockConflict;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for object store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The named or identified artifact does not exist on disk or in the catalog.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ArtifactKind, name: String },

    /// The ACL check denied the requested access level for the given identity.
    #[error("user '{user}' is not authorized for {access} access to '{name}'")]
    Unauthorized {
        user: String,
        name: String,
        access: crate::acl::Access,
    },

    /// The operation requires a lock the caller does not currently hold.
    #[error("operation requires a lock on {kind} '{name}' that the caller does not hold")]
    NotLocked { kind: ArtifactKind, name: String },

    /// Lock acquisition failed because another identity holds the lock.
    #[error("lock acquisition failed: {0}")]
    LockConflict(LockConflict),

    /// An attempted create collides with an existing name or root path.
    #[error("'{name}' collides with an existing artifact: {detail}")]
    NonUnique { name: String, detail: String },

    /// The artifact failed structural or business validation before save.
    #[error("validation of '{name}' failed: {reason}")]
    ValidationFailed { name: String, reason: String },

    /// An underlying filesystem operation failed.
    #[error("failed to {op} '{path}': {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A recoverable file operation could not create its move-aside backup
    /// after bounded retries. Fatal for the enclosing save or rename.
    #[error("failed to create a move-aside backup for '{path}' after {attempts} attempts")]
    BackupFailed { path: PathBuf, attempts: u32 },

    /// The resource type cannot be locked.
    #[error("resource type '{kind}' cannot be locked")]
    InvalidResource { kind: String },

    /// The store configuration file could not be parsed or is invalid.
    #[error("invalid store configuration: {reason}")]
    InvalidConfig { reason: String },

    /// A persisted artifact document could not be parsed or serialized.
    #[error("failed to {op} document '{path}': {reason}")]
    Document {
        op: &'static str,
        path: PathBuf,
        reason: String,
    },
}

impl StoreError {
    /// Wrap an I/O error with the operation and path that produced it.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// True for failures the caller may retry after re-acquiring the lock.
    ///
    /// ACL and validation failures are terminal for the request; lock-state
    /// failures are terminal for the call but not for the session.
    pub fn is_lock_state(&self) -> bool {
        matches!(
            self,
            StoreError::NotLocked { .. } | StoreError::LockConflict(_)
        )
    }
}

/// Result type alias for object store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Access;

    #[test]
    fn not_found_message_names_kind_and_artifact() {
        let err = StoreError::NotFound {
            kind: ArtifactKind::Application,
            name: "Orders".to_string(),
        };
        assert_eq!(err.to_string(), "application 'Orders' not found");
    }

    #[test]
    fn unauthorized_message_names_access_level() {
        let err = StoreError::Unauthorized {
            user: "alice".to_string(),
            name: "Orders".to_string(),
            access: Access::Update,
        };
        assert!(err.to_string().contains("update"));
        assert!(err.to_string().contains("alice"));
    }

    #[test]
    fn io_error_carries_path_and_operation() {
        let err = StoreError::io(
            "rename",
            "/store/objects/Orders.json",
            std::io::Error::other("disk full"),
        );
        let msg = err.to_string();
        assert!(msg.contains("rename"));
        assert!(msg.contains("Orders.json"));
        assert!(msg.contains("disk full"));
    }

    #[test]
    fn lock_state_classification() {
        let err = StoreError::NotLocked {
            kind: ArtifactKind::Application,
            name: "Orders".to_string(),
        };
        assert!(err.is_lock_state());

        let err = StoreError::NonUnique {
            name: "Orders".to_string(),
            detail: "name already in use".to_string(),
        };
        assert!(!err.is_lock_state());
    }
}
