//! Persisted lock bookkeeping.
//!
//! The lock table is in-memory and authoritative; the journal mirrors it to
//! a lock-state directory as one JSON record per held key so that unexpired
//! locks survive a process restart. Every journal operation is best-effort:
//! a journal failure is logged and the manager keeps working from memory.
//!
//! Record files are named `{kind}.{sanitized-name}-{hash}.lock`; the hash
//! keeps two names that sanitize identically from sharing a record file.

use super::LockEntry;
use crate::artifact::ArtifactKind;
use crate::identity::LockerIdentity;
use crate::locks::LockKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::warn;

/// A persisted lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    /// Artifact kind of the locked resource.
    pub kind: ArtifactKind,

    /// Artifact name as given at acquisition.
    pub name: String,

    /// Holder user name.
    pub user: String,

    /// Holder session.
    pub session: String,

    #[serde(default)]
    pub override_same_user: bool,

    #[serde(default)]
    pub override_different_user: bool,

    /// `user@host` string of the process that wrote the record.
    pub recorded_by: String,

    /// Timestamp when the lock was acquired (RFC3339).
    pub acquired_at: DateTime<Utc>,

    /// Lease expiry; absent for never-expiring leases.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl LockRecord {
    /// Whether the recorded lease has elapsed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Get the `user@host` string recorded with each lock file.
fn recorder_string() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    format!("{}@{}", user, host)
}

/// Writes lock records into a lock-state directory.
#[derive(Debug)]
pub struct LockJournal {
    dir: PathBuf,
}

impl LockJournal {
    /// Create a journal over the given directory. The directory is created
    /// lazily on the first record.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the record file for a key.
    fn record_path(&self, key: &LockKey) -> PathBuf {
        let sanitized: String = key
            .folded()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!(
            "{}.{}-{:08x}.lock",
            key.kind().as_str(),
            sanitized,
            fnv1a(key.folded().as_bytes())
        ))
    }

    /// Record (or refresh) a held lock. Best-effort.
    pub fn record(
        &self,
        key: &LockKey,
        holder: &LockerIdentity,
        acquired_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
    ) {
        let record = LockRecord {
            kind: key.kind(),
            name: key.name().to_string(),
            user: holder.user.clone(),
            session: holder.session.clone(),
            override_same_user: holder.override_same_user,
            override_different_user: holder.override_different_user,
            recorded_by: recorder_string(),
            acquired_at,
            expires_at,
        };

        let path = self.record_path(key);
        let json = match serde_json::to_string_pretty(&record) {
            Ok(json) => json,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to serialize lock record");
                return;
            }
        };
        if let Err(e) = crate::fs::atomic_write(&path, json.as_bytes()) {
            warn!(key = %key, error = %e, "failed to write lock record");
        }
    }

    /// Remove the record for a key. Best-effort.
    pub fn clear(&self, key: &LockKey) {
        let path = self.record_path(key);
        if let Err(e) = fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(key = %key, error = %e, "failed to remove lock record");
        }
    }

    /// Load all unexpired records, dropping expired and unparseable files.
    pub(super) fn load_unexpired(&self) -> Vec<(LockKey, LockEntry)> {
        let mut loaded = Vec::new();

        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(_) => return loaded,
        };

        let now = Utc::now();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }

            let record: LockRecord = match fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str(&content).ok())
            {
                Some(record) => record,
                None => {
                    warn!(path = %path.display(), "skipping unreadable lock record");
                    continue;
                }
            };

            if record.is_expired(now) {
                let _ = fs::remove_file(&path);
                continue;
            }

            let holder = LockerIdentity {
                user: record.user,
                session: record.session,
                override_same_user: record.override_same_user,
                override_different_user: record.override_different_user,
            };
            loaded.push((
                LockKey::new(record.kind, record.name),
                LockEntry {
                    holder,
                    acquired_at: record.acquired_at,
                    expires_at: record.expires_at,
                },
            ));
        }

        loaded
    }
}

fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::{LockManager, Wait};
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    fn key(name: &str) -> LockKey {
        LockKey::new(ArtifactKind::Application, name)
    }

    #[test]
    fn record_and_reload_round_trip() {
        let temp = TempDir::new().unwrap();
        let journal = LockJournal::new(temp.path());
        let alice = LockerIdentity::new("alice", "s1");
        let k = key("Orders");

        journal.record(&k, &alice, Utc::now(), Some(Utc::now() + Duration::minutes(30)));

        let loaded = journal.load_unexpired();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, k);
        assert_eq!(loaded[0].1.holder.user, "alice");
    }

    #[test]
    fn expired_records_are_dropped_and_removed() {
        let temp = TempDir::new().unwrap();
        let journal = LockJournal::new(temp.path());
        let alice = LockerIdentity::new("alice", "s1");
        let k = key("Orders");

        journal.record(&k, &alice, Utc::now(), Some(Utc::now() - Duration::minutes(1)));

        assert!(journal.load_unexpired().is_empty());
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[test]
    fn clear_removes_the_record_file() {
        let temp = TempDir::new().unwrap();
        let journal = LockJournal::new(temp.path());
        let alice = LockerIdentity::new("alice", "s1");
        let k = key("Orders");

        journal.record(&k, &alice, Utc::now(), None);
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 1);

        journal.clear(&k);
        assert_eq!(fs::read_dir(temp.path()).unwrap().count(), 0);

        // Clearing again is harmless.
        journal.clear(&k);
    }

    #[test]
    fn unparseable_records_are_skipped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("garbage.lock"), "{not json").unwrap();

        let journal = LockJournal::new(temp.path());
        assert!(journal.load_unexpired().is_empty());
    }

    #[test]
    fn distinct_names_get_distinct_record_files() {
        let temp = TempDir::new().unwrap();
        let journal = LockJournal::new(temp.path());

        // Both sanitize to "a_b" but must not share a record file.
        let first = journal.record_path(&key("a b"));
        let second = journal.record_path(&key("a_b"));
        assert_ne!(first, second);
    }

    #[test]
    fn manager_reloads_unexpired_locks_across_restart() {
        let temp = TempDir::new().unwrap();
        let alice = LockerIdentity::new("alice", "s1");
        let bob = LockerIdentity::new("bob", "s2");
        let k = key("Orders");

        {
            let mgr = LockManager::new(StdDuration::from_millis(10))
                .with_journal(LockJournal::new(temp.path()));
            assert!(
                mgr.acquire(&alice, &k, Some(Duration::minutes(30)), Wait::NoWait)
                    .is_acquired()
            );
        }

        // A fresh manager over the same directory sees alice's lock.
        let mgr = LockManager::new(StdDuration::from_millis(10))
            .with_journal(LockJournal::new(temp.path()));
        assert!(mgr.is_locked(&alice, &k));
        assert!(!mgr.acquire(&bob, &k, Some(Duration::minutes(5)), Wait::NoWait).is_acquired());
    }
}
