//! Path-keyed serialization of file access.
//!
//! The artifact-level [`crate::locks::LockManager`] expresses *edit
//! ownership*; this gate solves a narrower problem: two engine operations
//! must never interleave reads and writes on one file path, even when both
//! hold legitimate locks (e.g. a file save under an application whose
//! document is being loaded). Each operation enters the gate for the paths
//! it touches and leaves on drop; a second operation on a busy path waits
//! on a condvar until the first leaves.
//!
//! Paths are keyed by their lowercased lexical form so two spellings of
//! one path on a case-insensitive filesystem contend on the same entry.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

#[derive(Default)]
struct GateState {
    busy: HashSet<String>,
}

/// Wait/notify registry of busy file paths.
#[derive(Default)]
pub struct PathGate {
    state: Mutex<GateState>,
    released: Condvar,
}

impl PathGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> MutexGuard<'_, GateState> {
        self.state
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    fn key_for(path: &Path) -> String {
        path.to_string_lossy().to_lowercase()
    }

    /// Enter the gate for one path, waiting while it is busy.
    pub fn enter(self: &Arc<Self>, path: &Path) -> PathGuard {
        self.enter_many(std::slice::from_ref(&path))
    }

    /// Enter the gate for several paths at once.
    ///
    /// Keys are claimed in sorted order as a single atomic step (all or
    /// none), so two operations touching the same pair of paths cannot
    /// deadlock against each other.
    pub fn enter_many<P: AsRef<Path>>(self: &Arc<Self>, paths: &[P]) -> PathGuard {
        let mut keys: Vec<String> = paths.iter().map(|p| Self::key_for(p.as_ref())).collect();
        keys.sort();
        keys.dedup();

        let mut state = self.lock_state();
        loop {
            if keys.iter().all(|key| !state.busy.contains(key)) {
                for key in &keys {
                    state.busy.insert(key.clone());
                }
                return PathGuard {
                    gate: Arc::clone(self),
                    keys,
                };
            }
            state = self
                .released
                .wait(state)
                .unwrap_or_else(|poison| poison.into_inner());
        }
    }

    /// Number of currently busy paths.
    pub fn busy_count(&self) -> usize {
        self.lock_state().busy.len()
    }

    fn leave(&self, keys: &[String]) {
        let mut state = self.lock_state();
        for key in keys {
            state.busy.remove(key);
        }
        self.released.notify_all();
    }
}

impl std::fmt::Debug for PathGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathGate")
            .field("busy", &self.busy_count())
            .finish()
    }
}

/// RAII guard for gate entries; leaving happens on drop.
pub struct PathGuard {
    gate: Arc<PathGate>,
    keys: Vec<String>,
}

impl Drop for PathGuard {
    fn drop(&mut self) {
        self.gate.leave(&self.keys);
    }
}
