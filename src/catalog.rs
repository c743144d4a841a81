//! In-memory summary catalog.
//!
//! The catalog is the single in-memory source of truth for "does this
//! artifact exist and what is its current version". It indexes a lightweight
//! [`ObjectSummary`] per persisted artifact twice, by numeric id and by
//! lowercase name, and keeps both indices consistent under one mutex:
//! every summary reachable by id is reachable by its current name and vice
//! versa, after any sequence of add/remove operations.
//!
//! The catalog also owns numeric identity: [`SummaryCatalog::add`] can
//! allocate the smallest unused positive id, and
//! [`repair_duplicate_ids`] renumbers colliding or invalid on-disk ids at
//! startup.

use crate::acl::{AclHandle, AclSpec};
use crate::artifact::ArtifactDocument;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

/// Lightweight metadata for one persisted artifact.
#[derive(Debug, Clone)]
pub struct ObjectSummary {
    /// Positive numeric identity, unique within the catalog.
    pub id: i64,
    /// Artifact name, unique case-insensitively within the catalog.
    pub name: String,
    /// Request-root directory name for the artifact's ad hoc files.
    pub root_path: String,
    pub major_version: u32,
    pub minor_version: u32,
    pub enabled: bool,
    pub hidden: bool,
    pub created_by: Option<String>,
    pub created_on: Option<DateTime<Utc>>,
    /// Modification timestamp of the document file at last refresh.
    pub modified_on_disk: Option<DateTime<Utc>>,
    /// Access lists as persisted with the document.
    pub acl_spec: AclSpec,
    /// Compiled ACL, rebuilt on demand when the version moves.
    acl_cache: Option<AclHandle>,
}

impl ObjectSummary {
    /// Build a summary from a document and its file modification time.
    pub fn from_document(doc: &ArtifactDocument, modified_on_disk: Option<DateTime<Utc>>) -> Self {
        Self {
            id: doc.id,
            name: doc.name.clone(),
            root_path: doc.effective_root(),
            major_version: doc.major_version,
            minor_version: doc.minor_version,
            enabled: doc.enabled,
            hidden: doc.hidden,
            created_by: doc.created_by.clone(),
            created_on: doc.created_on,
            modified_on_disk,
            acl_spec: doc.acl.clone(),
            acl_cache: None,
        }
    }

    /// Current (major, minor) version pair.
    pub fn version(&self) -> (u32, u32) {
        (self.major_version, self.minor_version)
    }

    /// The compiled ACL for this summary, rebuilt if the cached handle was
    /// compiled for an older version.
    pub fn acl_handle(&mut self) -> &AclHandle {
        let version = self.version();
        let stale = !self
            .acl_cache
            .as_ref()
            .is_some_and(|handle| handle.is_current(version));
        if stale {
            self.acl_cache = Some(AclHandle::compile(&self.acl_spec, version));
        }
        self.acl_cache.as_ref().expect("cache populated above")
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_id: HashMap<i64, ObjectSummary>,
    /// Lowercased name → id.
    by_name: HashMap<String, i64>,
    highest_id: i64,
}

/// Synchronized dual-index catalog of artifact summaries.
#[derive(Debug, Default)]
pub struct SummaryCatalog {
    inner: Mutex<Inner>,
}

impl SummaryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Add or replace a summary, returning its id.
    ///
    /// With `allocate_id`, the smallest unused positive id is assigned to
    /// the summary before insertion. Without it, the summary's own id is
    /// used and any prior summary under that id is replaced, including its
    /// name-index entry, which makes a single `add` call the atomic reindex
    /// step for a rename.
    pub fn add(&self, mut summary: ObjectSummary, allocate_id: bool) -> i64 {
        let mut inner = self.lock_inner();

        if allocate_id {
            summary.id = smallest_unused(&inner.by_id);
        }
        let id = summary.id;
        let folded = summary.name.to_lowercase();

        // Drop the displaced entries from both indices before inserting so
        // the bidirectional invariant holds at every exit.
        if let Some(previous) = inner.by_id.remove(&id) {
            inner.by_name.remove(&previous.name.to_lowercase());
        }
        if let Some(&other_id) = inner.by_name.get(&folded)
            && other_id != id
        {
            inner.by_id.remove(&other_id);
        }

        inner.by_name.insert(folded, id);
        inner.by_id.insert(id, summary);
        if id > inner.highest_id {
            inner.highest_id = id;
        }
        id
    }

    /// Look up a summary by id.
    pub fn get(&self, id: i64) -> Option<ObjectSummary> {
        self.lock_inner().by_id.get(&id).cloned()
    }

    /// Look up a summary by name, case-insensitively.
    pub fn get_by_name(&self, name: &str) -> Option<ObjectSummary> {
        let inner = self.lock_inner();
        let id = inner.by_name.get(&name.to_lowercase())?;
        inner.by_id.get(id).cloned()
    }

    /// Whether a name is present, case-insensitively.
    pub fn contains_name(&self, name: &str) -> bool {
        self.lock_inner().by_name.contains_key(&name.to_lowercase())
    }

    /// Remove a summary by id. Absent entries are not an error.
    pub fn remove(&self, id: i64) -> Option<ObjectSummary> {
        let mut inner = self.lock_inner();
        let summary = inner.by_id.remove(&id)?;
        inner.by_name.remove(&summary.name.to_lowercase());
        Some(summary)
    }

    /// Remove a summary by name. Absent entries are not an error.
    pub fn remove_by_name(&self, name: &str) -> Option<ObjectSummary> {
        let mut inner = self.lock_inner();
        let id = inner.by_name.remove(&name.to_lowercase())?;
        inner.by_id.remove(&id)
    }

    /// Consistent point-in-time copy of every summary, ordered by id.
    ///
    /// The snapshot does not reflect later mutations.
    pub fn snapshot(&self) -> Vec<ObjectSummary> {
        let inner = self.lock_inner();
        let mut all: Vec<ObjectSummary> = inner.by_id.values().cloned().collect();
        all.sort_by_key(|s| s.id);
        all
    }

    /// Highest id ever assigned or observed.
    pub fn highest_id(&self) -> i64 {
        self.lock_inner().highest_id
    }

    pub fn len(&self) -> usize {
        self.lock_inner().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Compiled ACL for the named artifact, rebuilding the cached handle in
    /// place when the summary's version has moved since it was compiled.
    pub fn acl_for(&self, name: &str) -> Option<AclHandle> {
        let mut inner = self.lock_inner();
        let id = *inner.by_name.get(&name.to_lowercase())?;
        inner
            .by_id
            .get_mut(&id)
            .map(|summary| summary.acl_handle().clone())
    }
}

/// Smallest positive id not currently in use.
fn smallest_unused(by_id: &HashMap<i64, ObjectSummary>) -> i64 {
    let mut candidate = 1;
    while by_id.contains_key(&candidate) {
        candidate += 1;
    }
    candidate
}

/// One id correction made by [`repair_duplicate_ids`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdRepair {
    /// Index of the corrected document in the input slice.
    pub index: usize,
    pub old_id: i64,
    pub new_id: i64,
}

/// Renumber documents whose ids are invalid (< 1) or collide.
///
/// Documents are walked in ascending id order; a document is renumbered
/// when its id is below 1 or equal to the next document's id, receiving the
/// smallest positive integer unused by any document in the full set at that
/// moment. Reassigning one id can affect the search for the next, so the
/// used-id set is maintained across the whole pass. After the pass all ids
/// are pairwise distinct and >= 1.
///
/// The corrected ids are written into the documents; the caller persists
/// them to disk.
pub fn repair_duplicate_ids(docs: &mut [ArtifactDocument]) -> Vec<IdRepair> {
    let mut order: Vec<usize> = (0..docs.len()).collect();
    order.sort_by_key(|&i| docs[i].id);

    let mut used: BTreeSet<i64> = docs.iter().map(|d| d.id).filter(|&id| id >= 1).collect();
    let mut repairs = Vec::new();

    for pos in 0..order.len() {
        let index = order[pos];
        let id = docs[index].id;
        let collides_with_next = order.get(pos + 1).is_some_and(|&next| docs[next].id == id);

        if id < 1 || collides_with_next {
            let mut candidate = 1;
            while used.contains(&candidate) {
                candidate += 1;
            }
            used.insert(candidate);
            repairs.push(IdRepair {
                index,
                old_id: id,
                new_id: candidate,
            });
            docs[index].id = candidate;
        }
    }

    repairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::Access;

    fn summary(id: i64, name: &str) -> ObjectSummary {
        let mut doc = ArtifactDocument::new(name);
        doc.id = id;
        ObjectSummary::from_document(&doc, None)
    }

    fn doc(id: i64, name: &str) -> ArtifactDocument {
        let mut doc = ArtifactDocument::new(name);
        doc.id = id;
        doc
    }

    #[test]
    fn allocation_fills_the_smallest_gap() {
        let catalog = SummaryCatalog::new();
        catalog.add(summary(1, "A"), false);
        catalog.add(summary(2, "B"), false);
        catalog.add(summary(4, "D"), false);
        assert_eq!(catalog.highest_id(), 4);

        let id = catalog.add(summary(0, "C"), true);
        assert_eq!(id, 3);
        assert_eq!(catalog.get(3).unwrap().name, "C");
        assert_eq!(catalog.highest_id(), 4);
    }

    #[test]
    fn allocation_extends_past_a_dense_prefix() {
        let catalog = SummaryCatalog::new();
        for (id, name) in [(1, "A"), (2, "B"), (3, "C")] {
            catalog.add(summary(id, name), false);
        }

        let id = catalog.add(summary(0, "D"), true);
        assert_eq!(id, 4);
        assert_eq!(catalog.highest_id(), 4);
    }

    #[test]
    fn add_without_allocation_overwrites_and_repoints_the_name_index() {
        let catalog = SummaryCatalog::new();
        catalog.add(summary(7, "Old"), false);

        // Same id, new name: the rename case.
        catalog.add(summary(7, "New"), false);

        assert!(catalog.get_by_name("Old").is_none());
        assert_eq!(catalog.get_by_name("New").unwrap().id, 7);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn name_lookup_is_case_insensitive() {
        let catalog = SummaryCatalog::new();
        catalog.add(summary(1, "Orders"), false);

        assert!(catalog.get_by_name("ORDERS").is_some());
        assert!(catalog.get_by_name("orders").is_some());
        assert!(catalog.contains_name("oRdErS"));
    }

    #[test]
    fn remove_clears_both_indices() {
        let catalog = SummaryCatalog::new();
        catalog.add(summary(1, "Orders"), false);

        let removed = catalog.remove(1).unwrap();
        assert_eq!(removed.name, "Orders");
        assert!(catalog.get_by_name("Orders").is_none());
        assert!(catalog.get(1).is_none());

        // Removing again is a quiet None.
        assert!(catalog.remove(1).is_none());
        assert!(catalog.remove_by_name("Orders").is_none());
    }

    #[test]
    fn indices_stay_bidirectional_after_mixed_operations() {
        let catalog = SummaryCatalog::new();
        catalog.add(summary(0, "A"), true);
        catalog.add(summary(0, "B"), true);
        catalog.add(summary(0, "C"), true);
        catalog.remove_by_name("B");
        catalog.add(summary(0, "D"), true);
        catalog.add(summary(1, "A2"), false); // rename of id 1

        for s in catalog.snapshot() {
            let by_name = catalog.get_by_name(&s.name).unwrap();
            assert_eq!(by_name.id, s.id, "name index must point back to id");
            let by_id = catalog.get(s.id).unwrap();
            assert_eq!(by_id.name, s.name, "id index must carry current name");
        }
    }

    #[test]
    fn snapshot_is_point_in_time() {
        let catalog = SummaryCatalog::new();
        catalog.add(summary(1, "A"), false);

        let snap = catalog.snapshot();
        catalog.add(summary(2, "B"), false);

        assert_eq!(snap.len(), 1);
        assert_eq!(catalog.snapshot().len(), 2);
    }

    #[test]
    fn acl_cache_is_rebuilt_when_version_moves() {
        let catalog = SummaryCatalog::new();
        let mut doc = doc(1, "Orders");
        doc.acl.editors = vec!["alice".to_string()];
        catalog.add(ObjectSummary::from_document(&doc, None), false);

        let handle = catalog.acl_for("Orders").unwrap();
        assert!(handle.permits("alice", Access::Update));
        assert!(!handle.permits("bob", Access::Update));

        // Save bumps the version and swaps the editors list.
        doc.minor_version += 1;
        doc.acl.editors = vec!["bob".to_string()];
        catalog.add(ObjectSummary::from_document(&doc, None), false);

        let handle = catalog.acl_for("Orders").unwrap();
        assert_eq!(handle.built_for(), (1, 1));
        assert!(handle.permits("bob", Access::Update));
        assert!(!handle.permits("alice", Access::Update));
    }

    #[test]
    fn repair_leaves_distinct_valid_ids_alone() {
        let mut docs = vec![doc(3, "A"), doc(1, "B"), doc(2, "C")];
        let repairs = repair_duplicate_ids(&mut docs);
        assert!(repairs.is_empty());
        assert_eq!(docs[0].id, 3);
    }

    #[test]
    fn repair_renumbers_duplicates_and_invalid_ids() {
        // The [5, 5, -1] startup case: afterwards, three distinct positive ids.
        let mut docs = vec![doc(5, "A"), doc(5, "B"), doc(-1, "C")];
        let repairs = repair_duplicate_ids(&mut docs);

        let mut ids: Vec<i64> = docs.iter().map(|d| d.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3, "ids must be pairwise distinct");
        assert!(docs.iter().all(|d| d.id >= 1));

        // One of the 5s keeps its id; the invalid and the colliding doc are
        // repaired to the smallest free ids.
        assert_eq!(repairs.len(), 2);
        assert!(docs.iter().any(|d| d.id == 5));
        assert_eq!(docs[2].id, 1);
    }

    #[test]
    fn repair_reassignment_affects_later_searches() {
        // After renumbering the first duplicate to 1, the second duplicate
        // must not also receive 1.
        let mut docs = vec![doc(2, "A"), doc(2, "B"), doc(2, "C")];
        repair_duplicate_ids(&mut docs);

        let mut ids: Vec<i64> = docs.iter().map(|d| d.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn repair_handles_all_invalid_ids() {
        let mut docs = vec![doc(0, "A"), doc(-7, "B")];
        let repairs = repair_duplicate_ids(&mut docs);
        assert_eq!(repairs.len(), 2);

        let mut ids: Vec<i64> = docs.iter().map(|d| d.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }
}
