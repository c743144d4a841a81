//! Append-only audit log of store mutations.
//!
//! [`AuditLog`] is a built-in [`StoreListener`] that appends one JSON
//! object per line (NDJSON) to an audit file for every successful
//! create/update/remove. The log supports recovery and review across
//! restarts: each record carries a timestamp, the action, the acting
//! `user@session` string, and the affected artifact.
//!
//! The log is written while the engine still holds the artifact lock, so
//! record order matches mutation order for any single artifact.

use crate::error::{Result, StoreError};
use crate::listeners::{StoreEvent, StoreListener};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

/// One audit record, serialized as a single NDJSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// RFC3339 timestamp when the mutation completed.
    pub ts: DateTime<Utc>,

    /// Action tag (`application_created`, `server_config_saved`, ...).
    pub action: String,

    /// The acting `user@session` string.
    pub actor: String,

    /// Affected artifact name, absent for singleton configuration saves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,

    /// Artifact id, absent for singleton configuration saves.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<i64>,
}

impl AuditRecord {
    /// Serialize the record to a single-line JSON string.
    pub fn to_ndjson_line(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StoreError::Document {
            op: "serialize",
            path: PathBuf::from("audit.ndjson"),
            reason: e.to_string(),
        })
    }
}

/// NDJSON audit log listener.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    // Serializes appends from concurrent engine operations so lines never
    // interleave.
    write: Mutex<()>,
}

impl AuditLog {
    /// Create a log appending to the given file. The file and its parent
    /// directory are created on first append.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    /// The audit file path.
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn append(&self, record: &AuditRecord) -> Result<()> {
        let line = record.to_ndjson_line()?;

        let _guard = self.write.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(parent) = self.path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::io("create directory", parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io("open", &self.path, e))?;

        writeln!(file, "{}", line).map_err(|e| StoreError::io("append", &self.path, e))?;
        Ok(())
    }

    /// Read every record currently in the log, skipping unparseable lines.
    pub fn read_all(&self) -> Result<Vec<AuditRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("read", &self.path, e)),
        };

        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

impl StoreListener for AuditLog {
    fn notify(&self, actor: &str, event: &StoreEvent<'_>) -> Result<()> {
        let (artifact, artifact_id) = match event {
            StoreEvent::ApplicationCreated(s)
            | StoreEvent::ApplicationUpdated(s)
            | StoreEvent::ApplicationRemoved(s) => (Some(s.name.clone()), Some(s.id)),
            StoreEvent::ServerConfigSaved | StoreEvent::RoleConfigSaved => (None, None),
        };

        self.append(&AuditRecord {
            ts: Utc::now(),
            action: event.action().to_string(),
            actor: actor.to_string(),
            artifact,
            artifact_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactDocument;
    use crate::catalog::ObjectSummary;
    use tempfile::TempDir;

    fn summary(name: &str, id: i64) -> ObjectSummary {
        let mut doc = ArtifactDocument::new(name);
        doc.id = id;
        ObjectSummary::from_document(&doc, None)
    }

    #[test]
    fn records_round_trip_through_the_file() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path().join("audit.ndjson"));

        let orders = summary("Orders", 1);
        log.notify("alice@s1", &StoreEvent::ApplicationCreated(&orders))
            .unwrap();
        log.notify("bob@s2", &StoreEvent::ApplicationUpdated(&orders))
            .unwrap();
        log.notify("alice@s1", &StoreEvent::ServerConfigSaved).unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].action, "application_created");
        assert_eq!(records[0].artifact.as_deref(), Some("Orders"));
        assert_eq!(records[0].artifact_id, Some(1));
        assert_eq!(records[1].actor, "bob@s2");
        assert!(records[2].artifact.is_none());
    }

    #[test]
    fn missing_log_file_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path().join("never-written.ndjson"));
        assert!(log.read_all().unwrap().is_empty());
    }

    #[test]
    fn garbage_lines_are_skipped_on_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("audit.ndjson");
        let log = AuditLog::new(&path);

        let orders = summary("Orders", 1);
        log.notify("alice@s1", &StoreEvent::ApplicationRemoved(&orders))
            .unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{corrupted\n")
            .unwrap();

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].action, "application_removed");
    }
}
