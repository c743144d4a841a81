//! Persisted artifact documents.
//!
//! Every configuration object the store manages (an application, the
//! server configuration, the role configuration) is persisted as a JSON
//! document with a common envelope (identity, version, flags, ACL) around
//! an opaque body supplied by the caller. The store reads and rewrites the
//! envelope; it never interprets the body.
//!
//! # Document Format
//!
//! ```text
//! {
//!   "id": 7,
//!   "name": "Orders",
//!   "root_path": "orders",
//!   "major_version": 1,
//!   "minor_version": 4,
//!   "enabled": true,
//!   "hidden": false,
//!   "created_by": "alice",
//!   "created_on": "2026-02-11T09:30:00Z",
//!   "acl": { "editors": ["alice"] },
//!   "body": { ... caller-defined ... }
//! }
//! ```

use crate::acl::AclSpec;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;

/// Artifact classes managed by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A catalogued application object with its own request-root directory.
    Application,
    /// The singleton server configuration document.
    ServerConfig,
    /// The singleton role configuration document.
    RoleConfig,
}

impl ArtifactKind {
    /// Short tag used in lock keys, journal file names, and log output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Application => "application",
            ArtifactKind::ServerConfig => "server-config",
            ArtifactKind::RoleConfig => "role-config",
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Legal artifact names: they become file and directory names.
///
/// A name starts with an alphanumeric and continues with alphanumerics,
/// spaces, dots, underscores, or dashes, up to 128 characters.
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9 ._-]{0,127}$").expect("valid pattern"));

/// Check that a name is legal for use as an artifact name.
pub fn validate_name(name: &str) -> Result<()> {
    if NAME_PATTERN.is_match(name) && !name.ends_with('.') && !name.ends_with(' ') {
        Ok(())
    } else {
        Err(StoreError::ValidationFailed {
            name: name.to_string(),
            reason: "artifact names must start with a letter or digit and may contain \
                     letters, digits, spaces, dots, underscores, and dashes (max 128 chars)"
                .to_string(),
        })
    }
}

/// A persisted configuration artifact.
///
/// Known envelope fields are explicitly typed; the `body` value is preserved
/// verbatim for the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDocument {
    /// Numeric identity, unique within the catalog. Values below 1 mean
    /// "unassigned": the store allocates an id on first save.
    #[serde(default)]
    pub id: i64,

    /// Artifact name, unique case-insensitively within the catalog.
    pub name: String,

    /// Request-root directory name for ad hoc application files, relative
    /// to the store's roots directory. Unused for singleton documents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_path: Option<String>,

    /// Caller-owned major version.
    #[serde(default = "default_major")]
    pub major_version: u32,

    /// Store-owned minor version, bumped on every successful save.
    #[serde(default)]
    pub minor_version: u32,

    /// Whether the artifact is live. Enabled artifacts are always validated
    /// before save.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Hidden artifacts are excluded from external listings but otherwise
    /// behave normally.
    #[serde(default)]
    pub hidden: bool,

    /// User that first saved the artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,

    /// Timestamp of the first save.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_on: Option<DateTime<Utc>>,

    /// Access lists for this artifact.
    #[serde(default)]
    pub acl: AclSpec,

    /// Opaque caller-defined payload.
    #[serde(default)]
    pub body: serde_json::Value,
}

fn default_major() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl ArtifactDocument {
    /// Create a new, unsaved document with the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            root_path: None,
            major_version: 1,
            minor_version: 0,
            enabled: true,
            hidden: false,
            created_by: None,
            created_on: None,
            acl: AclSpec::default(),
            body: serde_json::Value::Null,
        }
    }

    /// The request-root directory name, defaulting to the lowercased name.
    pub fn effective_root(&self) -> String {
        self.root_path
            .clone()
            .unwrap_or_else(|| self.name.to_lowercase())
    }

    /// Current (major, minor) version pair.
    pub fn version(&self) -> (u32, u32) {
        (self.major_version, self.minor_version)
    }

    /// Parse a document from a JSON string.
    pub fn from_json(json: &str, origin: &Path) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::Document {
            op: "parse",
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Serialize the document to pretty-printed JSON.
    pub fn to_json(&self, origin: &Path) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StoreError::Document {
            op: "serialize",
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Load a document from a file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| StoreError::io("read", path, e))?;
        Self::from_json(&content, path)
    }
}

/// External validation seam for artifact documents.
///
/// Schema and business-rule validation live outside the store; the engine
/// invokes this before a save when the caller requests validation or the
/// document is enabled.
pub trait ArtifactValidator: Send + Sync {
    /// Validate the document, returning `ValidationFailed` on rejection.
    fn validate(&self, doc: &ArtifactDocument) -> Result<()>;
}

/// Baseline validator: checks the name and version envelope only.
#[derive(Debug, Default)]
pub struct EnvelopeValidator;

impl ArtifactValidator for EnvelopeValidator {
    fn validate(&self, doc: &ArtifactDocument) -> Result<()> {
        validate_name(&doc.name)?;

        if doc.major_version < 1 {
            return Err(StoreError::ValidationFailed {
                name: doc.name.clone(),
                reason: "major_version must be at least 1".to_string(),
            });
        }

        if let Some(root) = &doc.root_path {
            validate_name(root).map_err(|_| StoreError::ValidationFailed {
                name: doc.name.clone(),
                reason: format!("root_path '{}' is not a legal directory name", root),
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names_pass() {
        for name in ["Orders", "orders 2", "a", "A-b_c.d", "App 1.2"] {
            assert!(validate_name(name).is_ok(), "expected '{}' to pass", name);
        }
    }

    #[test]
    fn invalid_names_fail() {
        for name in ["", ".hidden", "-dash", "a/b", "a\\b", "trailing.", "trailing ", "a:b"] {
            assert!(validate_name(name).is_err(), "expected '{}' to fail", name);
        }
    }

    #[test]
    fn name_length_limit_is_128() {
        let ok = "a".repeat(128);
        let too_long = "a".repeat(129);
        assert!(validate_name(&ok).is_ok());
        assert!(validate_name(&too_long).is_err());
    }

    #[test]
    fn document_round_trips_through_json() {
        let mut doc = ArtifactDocument::new("Orders");
        doc.id = 7;
        doc.root_path = Some("orders".to_string());
        doc.body = serde_json::json!({"fields": ["sku", "qty"]});

        let json = doc.to_json(Path::new("Orders.json")).unwrap();
        let parsed = ArtifactDocument::from_json(&json, Path::new("Orders.json")).unwrap();

        assert_eq!(parsed.id, 7);
        assert_eq!(parsed.name, "Orders");
        assert_eq!(parsed.effective_root(), "orders");
        assert_eq!(parsed.body["fields"][0], "sku");
    }

    #[test]
    fn missing_envelope_fields_take_defaults() {
        let parsed =
            ArtifactDocument::from_json(r#"{"name": "Bare"}"#, Path::new("Bare.json")).unwrap();
        assert_eq!(parsed.id, 0);
        assert_eq!(parsed.major_version, 1);
        assert_eq!(parsed.minor_version, 0);
        assert!(parsed.enabled);
        assert!(!parsed.hidden);
        assert_eq!(parsed.effective_root(), "bare");
    }

    #[test]
    fn envelope_validator_rejects_bad_root() {
        let mut doc = ArtifactDocument::new("Orders");
        doc.root_path = Some("../escape".to_string());
        let err = EnvelopeValidator.validate(&doc).unwrap_err();
        assert!(matches!(err, StoreError::ValidationFailed { .. }));
    }

    #[test]
    fn parse_failure_names_the_file() {
        let err = ArtifactDocument::from_json("{not json", Path::new("Broken.json")).unwrap_err();
        assert!(err.to_string().contains("Broken.json"));
    }
}
