//! Access control for persisted artifacts.
//!
//! Each artifact document carries an [`AclSpec`]: plain lists of user names
//! allowed to read or edit it. The engine never evaluates the spec directly;
//! it compiles the spec into an [`AclHandle`] (case-folded sets, stamped
//! with the document version it was built from) and asks an
//! [`AccessPolicy`] whether a given identity may perform a given access.
//!
//! The handle is cached inside each catalog summary and rebuilt on demand
//! whenever the summary's version moves, so a stale handle is never
//! consulted after a save refreshes the artifact.
//!
//! The default policy ([`HandlePolicy`]) answers from the handle alone.
//! Hosts with an external security framework implement [`AccessPolicy`]
//! themselves and ignore the handle as they see fit.

use crate::identity::LockerIdentity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Access level requested for an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Load an artifact or list it in the catalog.
    Read,
    /// Save changes to an existing artifact.
    Update,
    /// Remove an artifact and its file tree.
    Delete,
    /// Create a new artifact.
    Create,
}

impl std::fmt::Display for Access {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Update => write!(f, "update"),
            Access::Delete => write!(f, "delete"),
            Access::Create => write!(f, "create"),
        }
    }
}

/// Declarative access lists persisted with each artifact.
///
/// Empty lists mean "open": an artifact with no ACL is readable and editable
/// by any authenticated identity. Unknown fields are ignored for forward
/// compatibility.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AclSpec {
    /// Owning user; always granted every access level.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Users granted read access.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub readers: Vec<String>,

    /// Users granted read, update, delete, and create access.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub editors: Vec<String>,
}

impl AclSpec {
    /// True when the spec grants access to everyone.
    pub fn is_open(&self) -> bool {
        self.owner.is_none() && self.readers.is_empty() && self.editors.is_empty()
    }
}

/// Compiled form of an [`AclSpec`], stamped with the document version it was
/// built from so callers can detect staleness.
#[derive(Debug, Clone)]
pub struct AclHandle {
    built_for: (u32, u32),
    open: bool,
    owner: Option<String>,
    readers: BTreeSet<String>,
    editors: BTreeSet<String>,
}

impl AclHandle {
    /// Compile a spec for the given (major, minor) document version.
    ///
    /// User names are folded to lowercase here once so permission checks are
    /// case-insensitive without repeated allocation.
    pub fn compile(spec: &AclSpec, version: (u32, u32)) -> Self {
        Self {
            built_for: version,
            open: spec.is_open(),
            owner: spec.owner.as_ref().map(|o| o.to_lowercase()),
            readers: spec.readers.iter().map(|u| u.to_lowercase()).collect(),
            editors: spec.editors.iter().map(|u| u.to_lowercase()).collect(),
        }
    }

    /// The (major, minor) version this handle was compiled for.
    pub fn built_for(&self) -> (u32, u32) {
        self.built_for
    }

    /// Whether this handle is current for the given document version.
    pub fn is_current(&self, version: (u32, u32)) -> bool {
        self.built_for == version
    }

    /// Whether the named user is granted the requested access.
    pub fn permits(&self, user: &str, access: Access) -> bool {
        if self.open {
            return true;
        }

        let user = user.to_lowercase();
        if self.owner.as_deref() == Some(user.as_str()) || self.editors.contains(&user) {
            return true;
        }

        match access {
            Access::Read => self.readers.contains(&user),
            Access::Update | Access::Delete | Access::Create => false,
        }
    }
}

/// Pluggable ACL decision seam.
///
/// The engine consults this for every operation; the compiled handle for the
/// target artifact is supplied so the default implementation can answer
/// without touching disk.
pub trait AccessPolicy: Send + Sync {
    /// Whether `actor` may perform `access` on the artifact behind `handle`.
    fn allows(&self, actor: &LockerIdentity, handle: &AclHandle, access: Access) -> bool;
}

/// Default policy: answer from the artifact's own ACL lists.
#[derive(Debug, Default)]
pub struct HandlePolicy;

impl AccessPolicy for HandlePolicy {
    fn allows(&self, actor: &LockerIdentity, handle: &AclHandle, access: Access) -> bool {
        handle.permits(&actor.user, access)
    }
}
