//! Shared helpers for store tests.

use crate::artifact::{ArtifactDocument, ArtifactKind};
use crate::identity::LockerIdentity;
use crate::locks::Wait;
use crate::store::ObjectStore;
use tempfile::TempDir;

/// Fresh store over a temporary root.
pub(crate) fn new_store() -> (TempDir, ObjectStore) {
    let temp = TempDir::new().unwrap();
    let store = ObjectStore::open(temp.path().join("store")).unwrap();
    (temp, store)
}

/// An editing identity for tests.
pub(crate) fn editor(user: &str, session: &str) -> LockerIdentity {
    LockerIdentity::new(user, session)
}

/// Acquire the application lock for `name`, asserting success.
pub(crate) fn lock_app(store: &ObjectStore, actor: &LockerIdentity, name: &str) {
    let key = store.lock_key(ArtifactKind::Application, name);
    store.lock(actor, &key, 30, Wait::NoWait).unwrap();
}

/// A minimal application document with a small payload.
pub(crate) fn sample_doc(name: &str) -> ArtifactDocument {
    let mut doc = ArtifactDocument::new(name);
    doc.body = serde_json::json!({"fields": ["title", "body"]});
    doc
}
