//! Locking subsystem for the coffer object store.
//!
//! This module implements the single-writer lock model that guards
//! design-time edits to shared artifacts:
//!
//! - One in-memory table maps a [`LockKey`] (artifact kind + name) to the
//!   identity currently allowed to mutate that artifact.
//! - Leases: every entry carries an optional expiration. Expiration is
//!   advisory: nothing sweeps the table; the next acquire attempt on a key
//!   treats an elapsed lease as free.
//! - Overrides: an identity may supersede an existing lock held by the same
//!   user in another session, or (administratively) by anyone. See
//!   [`crate::identity::LockerIdentity`].
//! - Blocking: acquisition can wait for a busy key with a bounded or
//!   unbounded budget. Waiters park on a condvar and also wake on a short
//!   poll interval so lease expirations are noticed; a waiting acquire is
//!   cancellable through a [`CancelToken`] and never leaves a partial entry.
//!
//! The table is a single `Mutex<HashMap>`; operations are O(1) and held
//! briefly, so there are no per-key locks. An optional [`journal::LockJournal`]
//! mirrors the table to disk so unexpired locks survive a restart.

use crate::artifact::ArtifactKind;
use crate::identity::LockerIdentity;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration as StdDuration, Instant};

pub mod journal;

use journal::LockJournal;

/// Identifies a lockable resource: artifact kind plus unique name.
///
/// Keys compare and hash case-insensitively on the name, matching the
/// catalog's case-insensitive name uniqueness.
#[derive(Debug, Clone)]
pub struct LockKey {
    kind: ArtifactKind,
    name: String,
    folded: String,
}

impl LockKey {
    /// Create a key for the given artifact kind and name.
    pub fn new(kind: ArtifactKind, name: impl Into<String>) -> Self {
        let name = name.into();
        let folded = name.to_lowercase();
        Self { kind, name, folded }
    }

    /// The artifact kind this key addresses.
    pub fn kind(&self) -> ArtifactKind {
        self.kind
    }

    /// The artifact name as given at creation.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn folded(&self) -> &str {
        &self.folded
    }
}

impl PartialEq for LockKey {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.folded == other.folded
    }
}

impl Eq for LockKey {}

impl std::hash::Hash for LockKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.folded.hash(state);
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

/// A held lock: holder identity plus lease window.
#[derive(Debug, Clone)]
struct LockEntry {
    holder: LockerIdentity,
    acquired_at: DateTime<Utc>,
    /// `None` means the lease never expires.
    expires_at: Option<DateTime<Utc>>,
}

impl LockEntry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// Why a lock acquisition failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictReason {
    /// The same user holds the lock from a different session and no
    /// override was requested.
    HeldBySameUserDifferentSession,
    /// A different user holds the lock.
    HeldByDifferentUser,
}

/// Diagnostic structure describing a failed acquisition.
#[derive(Debug, Clone)]
pub struct LockConflict {
    /// The key that could not be acquired.
    pub key: LockKey,
    /// User name of the current holder.
    pub holder_user: String,
    /// Session of the current holder.
    pub holder_session: String,
    /// Conflict classification.
    pub reason: ConflictReason,
}

impl std::fmt::Display for LockConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self.reason {
            ConflictReason::HeldBySameUserDifferentSession => "same user, different session",
            ConflictReason::HeldByDifferentUser => "different user",
        };
        write!(
            f,
            "{} is locked by {} ({})",
            self.key, self.holder_user, reason
        )
    }
}

/// Outcome of an acquisition attempt.
#[derive(Debug)]
pub enum Acquire {
    /// The lock is now held by the requester.
    Acquired,
    /// The lock stayed with its current holder.
    Conflict(LockConflict),
}

impl Acquire {
    /// True when the lock was acquired.
    pub fn is_acquired(&self) -> bool {
        matches!(self, Acquire::Acquired)
    }

    /// Convert a conflict into a [`crate::StoreError::LockConflict`].
    pub fn into_result(self) -> crate::Result<()> {
        match self {
            Acquire::Acquired => Ok(()),
            Acquire::Conflict(c) => Err(crate::StoreError::LockConflict(c)),
        }
    }
}

/// How long an acquisition may block waiting for a busy key.
#[derive(Debug, Clone, Copy)]
pub enum Wait {
    /// Fail immediately on conflict.
    NoWait,
    /// Block up to the given budget, then fail.
    For(StdDuration),
    /// Block until the key frees or the wait is cancelled.
    Forever,
}

/// Diagnostic properties of a currently held lock.
#[derive(Debug, Clone)]
pub struct LockInfo {
    pub key: LockKey,
    pub holder_user: String,
    pub holder_session: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Cooperative cancellation flag for a blocking acquire.
///
/// Clone the token before handing the acquire to a worker thread; calling
/// [`CancelToken::cancel`] makes the waiter return promptly with the last
/// observed conflict.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// In-memory registry of held locks.
pub struct LockManager {
    table: Mutex<HashMap<LockKey, LockEntry>>,
    freed: Condvar,
    poll: StdDuration,
    journal: Option<LockJournal>,
}

impl LockManager {
    /// Create a manager with the given wake-up poll interval.
    ///
    /// The interval bounds how long a waiter can sleep past a lease
    /// expiration; releases wake waiters immediately regardless.
    pub fn new(poll: StdDuration) -> Self {
        Self {
            table: Mutex::new(HashMap::new()),
            freed: Condvar::new(),
            poll,
            journal: None,
        }
    }

    /// Attach a journal and reload any unexpired persisted locks into the
    /// table. Journal I/O is best-effort throughout: a failing journal
    /// degrades the manager to in-memory-only operation.
    pub fn with_journal(mut self, journal: LockJournal) -> Self {
        {
            let mut table = self.lock_table();
            for (key, entry) in journal.load_unexpired() {
                table.insert(key, entry);
            }
        }
        self.journal = Some(journal);
        self
    }

    fn lock_table(&self) -> MutexGuard<'_, HashMap<LockKey, LockEntry>> {
        self.table
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Acquire or extend a lock.
    ///
    /// * `lease`: how long the lock stays valid; `None` means it never
    ///   expires. Re-acquiring an already held lock extends the lease but
    ///   never shortens it.
    /// * `wait`: blocking budget when the key is held by a conflicting
    ///   identity.
    pub fn acquire(
        &self,
        holder: &LockerIdentity,
        key: &LockKey,
        lease: Option<Duration>,
        wait: Wait,
    ) -> Acquire {
        self.acquire_with(holder, key, lease, wait, None)
    }

    /// [`LockManager::acquire`] with a cancellation token for the wait.
    pub fn acquire_with(
        &self,
        holder: &LockerIdentity,
        key: &LockKey,
        lease: Option<Duration>,
        wait: Wait,
        cancel: Option<&CancelToken>,
    ) -> Acquire {
        let deadline = match wait {
            Wait::NoWait => None,
            Wait::For(budget) => Some(Instant::now() + budget),
            Wait::Forever => None,
        };

        let mut table = self.lock_table();
        loop {
            match self.try_acquire_locked(&mut table, holder, key, lease) {
                Ok(()) => return Acquire::Acquired,
                Err(conflict) => {
                    let cancelled = cancel.is_some_and(|c| c.is_cancelled());
                    let budget_spent = match wait {
                        Wait::NoWait => true,
                        Wait::For(_) => deadline.is_some_and(|d| Instant::now() >= d),
                        Wait::Forever => false,
                    };
                    if cancelled || budget_spent {
                        return Acquire::Conflict(conflict);
                    }

                    // Sleep until a release notifies us, but never past the
                    // poll interval, the wait deadline, or the holder's own
                    // lease expiry.
                    let mut sleep = self.poll;
                    if let Some(d) = deadline {
                        sleep = sleep.min(d.saturating_duration_since(Instant::now()));
                    }
                    if let Some(entry) = table.get(key)
                        && let Some(at) = entry.expires_at
                    {
                        let remaining = (at - Utc::now()).to_std().unwrap_or(StdDuration::ZERO);
                        sleep = sleep.min(remaining);
                    }
                    let sleep = sleep.max(StdDuration::from_millis(1));

                    let (guard, _timed_out) = self
                        .freed
                        .wait_timeout(table, sleep)
                        .unwrap_or_else(|poison| poison.into_inner());
                    table = guard;
                }
            }
        }
    }

    /// One acquisition step under the table mutex.
    fn try_acquire_locked(
        &self,
        table: &mut HashMap<LockKey, LockEntry>,
        holder: &LockerIdentity,
        key: &LockKey,
        lease: Option<Duration>,
    ) -> Result<(), LockConflict> {
        let now = Utc::now();
        let expires_at = lease.and_then(|d| now.checked_add_signed(d));

        match table.get_mut(key) {
            None => {
                let entry = LockEntry {
                    holder: holder.clone(),
                    acquired_at: now,
                    expires_at,
                };
                self.journal_record(key, &entry);
                table.insert(key.clone(), entry);
                Ok(())
            }
            Some(entry) if entry.is_expired(now) => {
                *entry = LockEntry {
                    holder: holder.clone(),
                    acquired_at: now,
                    expires_at,
                };
                self.journal_record(key, entry);
                Ok(())
            }
            Some(entry) if entry.holder.same_id(holder) => {
                // Extend, never shorten. A never-expiring lease is the
                // maximum on either side.
                entry.expires_at = match (entry.expires_at, expires_at) {
                    (None, _) | (_, None) => None,
                    (Some(current), Some(new)) => Some(current.max(new)),
                };
                entry.holder = holder.clone();
                self.journal_record(key, entry);
                Ok(())
            }
            Some(entry) if holder.override_different_user => {
                *entry = LockEntry {
                    holder: holder.clone(),
                    acquired_at: now,
                    expires_at,
                };
                self.journal_record(key, entry);
                Ok(())
            }
            Some(entry) => {
                let reason = if entry.holder.user == holder.user {
                    ConflictReason::HeldBySameUserDifferentSession
                } else {
                    ConflictReason::HeldByDifferentUser
                };
                Err(LockConflict {
                    key: key.clone(),
                    holder_user: entry.holder.user.clone(),
                    holder_session: entry.holder.session.clone(),
                    reason,
                })
            }
        }
    }

    /// Release a lock held by `holder`.
    ///
    /// Releasing a lock you do not hold is a silent no-op: callers must not
    /// be able to probe ownership through release side effects, and a stray
    /// release must be harmless.
    pub fn release(&self, holder: &LockerIdentity, key: &LockKey) {
        let mut table = self.lock_table();
        let matches = table
            .get(key)
            .is_some_and(|entry| entry.holder.same_id(holder));
        if matches {
            table.remove(key);
            if let Some(journal) = &self.journal {
                journal.clear(key);
            }
            self.freed.notify_all();
        }
    }

    /// Whether `holder` currently holds the lock on `key`.
    pub fn is_locked(&self, holder: &LockerIdentity, key: &LockKey) -> bool {
        let table = self.lock_table();
        table
            .get(key)
            .is_some_and(|entry| !entry.is_expired(Utc::now()) && entry.holder.same_id(holder))
    }

    /// Diagnostic properties of the lock on `key`, if anyone holds it.
    pub fn lock_info(&self, key: &LockKey) -> Option<LockInfo> {
        let table = self.lock_table();
        let entry = table.get(key)?;
        if entry.is_expired(Utc::now()) {
            return None;
        }
        Some(LockInfo {
            key: key.clone(),
            holder_user: entry.holder.user.clone(),
            holder_session: entry.holder.session.clone(),
            acquired_at: entry.acquired_at,
            expires_at: entry.expires_at,
        })
    }

    /// Number of live (unexpired) entries in the table.
    pub fn held_count(&self) -> usize {
        let now = Utc::now();
        let table = self.lock_table();
        table.values().filter(|e| !e.is_expired(now)).count()
    }

    fn journal_record(&self, key: &LockKey, entry: &LockEntry) {
        if let Some(journal) = &self.journal {
            journal.record(key, &entry.holder, entry.acquired_at, entry.expires_at);
        }
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("held", &self.held_count())
            .field("poll", &self.poll)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> LockManager {
        LockManager::new(StdDuration::from_millis(10))
    }

    fn minutes(m: i64) -> Option<Duration> {
        Some(Duration::minutes(m))
    }

    fn app_key(name: &str) -> LockKey {
        LockKey::new(ArtifactKind::Application, name)
    }

    #[test]
    fn first_acquire_succeeds() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let key = app_key("Orders");

        assert!(mgr.acquire(&alice, &key, minutes(30), Wait::NoWait).is_acquired());
        assert!(mgr.is_locked(&alice, &key));
    }

    #[test]
    fn conflicting_acquire_reports_holder_and_reason() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let bob = LockerIdentity::new("bob", "s2");
        let key = app_key("Orders");

        assert!(mgr.acquire(&alice, &key, minutes(30), Wait::NoWait).is_acquired());

        match mgr.acquire(&bob, &key, minutes(30), Wait::NoWait) {
            Acquire::Conflict(c) => {
                assert_eq!(c.holder_user, "alice");
                assert_eq!(c.holder_session, "s1");
                assert_eq!(c.reason, ConflictReason::HeldByDifferentUser);
            }
            Acquire::Acquired => panic!("bob must not acquire alice's lock"),
        }
    }

    #[test]
    fn same_user_different_session_conflict_reason() {
        let mgr = manager();
        let s1 = LockerIdentity::new("alice", "s1");
        let s2 = LockerIdentity::new("alice", "s2");
        let key = app_key("Orders");

        assert!(mgr.acquire(&s1, &key, minutes(30), Wait::NoWait).is_acquired());

        match mgr.acquire(&s2, &key, minutes(30), Wait::NoWait) {
            Acquire::Conflict(c) => {
                assert_eq!(c.reason, ConflictReason::HeldBySameUserDifferentSession);
            }
            Acquire::Acquired => panic!("different session must conflict without override"),
        }
    }

    #[test]
    fn reacquire_extends_but_never_shortens_lease() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let key = app_key("Orders");

        assert!(mgr.acquire(&alice, &key, minutes(60), Wait::NoWait).is_acquired());
        let long = mgr.lock_info(&key).unwrap().expires_at.unwrap();

        // Shorter lease on re-acquire must not pull the expiry in.
        assert!(mgr.acquire(&alice, &key, minutes(1), Wait::NoWait).is_acquired());
        let after = mgr.lock_info(&key).unwrap().expires_at.unwrap();
        assert_eq!(after, long);

        // A longer lease extends it.
        assert!(mgr.acquire(&alice, &key, minutes(120), Wait::NoWait).is_acquired());
        let extended = mgr.lock_info(&key).unwrap().expires_at.unwrap();
        assert!(extended > long);
    }

    #[test]
    fn never_expiring_lease_wins_both_directions() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let key = app_key("Orders");

        assert!(mgr.acquire(&alice, &key, None, Wait::NoWait).is_acquired());
        assert!(mgr.acquire(&alice, &key, minutes(1), Wait::NoWait).is_acquired());
        assert!(mgr.lock_info(&key).unwrap().expires_at.is_none());
    }

    #[test]
    fn override_same_user_takes_over_other_session() {
        let mgr = manager();
        let s1 = LockerIdentity::new("alice", "s1");
        let s2 = LockerIdentity::new("alice", "s2").with_override_same_user(true);
        let key = app_key("Orders");

        assert!(mgr.acquire(&s1, &key, minutes(30), Wait::NoWait).is_acquired());
        assert!(mgr.acquire(&s2, &key, minutes(30), Wait::NoWait).is_acquired());
        assert_eq!(mgr.lock_info(&key).unwrap().holder_session, "s2");
    }

    #[test]
    fn override_different_user_always_succeeds() {
        let mgr = manager();
        let bob = LockerIdentity::new("bob", "s1");
        let admin = LockerIdentity::new("alice", "s2").with_override_different_user(true);
        let key = app_key("Orders");

        assert!(mgr.acquire(&bob, &key, minutes(30), Wait::NoWait).is_acquired());
        assert!(mgr.acquire(&admin, &key, minutes(30), Wait::NoWait).is_acquired());
        assert_eq!(mgr.lock_info(&key).unwrap().holder_user, "alice");
        assert!(!mgr.is_locked(&bob, &key));
    }

    #[test]
    fn release_by_non_holder_is_silent_noop() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let bob = LockerIdentity::new("bob", "s2");
        let key = app_key("Orders");

        assert!(mgr.acquire(&alice, &key, minutes(30), Wait::NoWait).is_acquired());
        mgr.release(&bob, &key);
        assert!(mgr.is_locked(&alice, &key));

        // Releasing a key nobody holds is equally harmless.
        mgr.release(&bob, &app_key("Nothing"));
    }

    #[test]
    fn release_by_holder_frees_the_key() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let bob = LockerIdentity::new("bob", "s2");
        let key = app_key("Orders");

        assert!(mgr.acquire(&alice, &key, minutes(30), Wait::NoWait).is_acquired());
        mgr.release(&alice, &key);
        assert!(!mgr.is_locked(&alice, &key));
        assert!(mgr.acquire(&bob, &key, minutes(30), Wait::NoWait).is_acquired());
    }

    #[test]
    fn expired_lease_is_reclaimed_by_next_acquire() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let bob = LockerIdentity::new("bob", "s2");
        let key = app_key("Orders");

        assert!(
            mgr.acquire(&alice, &key, Some(Duration::milliseconds(5)), Wait::NoWait)
                .is_acquired()
        );
        std::thread::sleep(StdDuration::from_millis(20));

        assert!(!mgr.is_locked(&alice, &key));
        assert!(mgr.lock_info(&key).is_none());
        assert!(mgr.acquire(&bob, &key, minutes(30), Wait::NoWait).is_acquired());
    }

    #[test]
    fn keys_compare_case_insensitively() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let bob = LockerIdentity::new("bob", "s2");

        assert!(
            mgr.acquire(&alice, &app_key("Orders"), minutes(30), Wait::NoWait)
                .is_acquired()
        );
        assert!(
            !mgr.acquire(&bob, &app_key("ORDERS"), minutes(30), Wait::NoWait)
                .is_acquired()
        );
    }

    #[test]
    fn concurrent_acquires_grant_exactly_one_winner() {
        let mgr = Arc::new(manager());
        let key = app_key("Orders");
        let barrier = Arc::new(Barrier::new(8));
        let wins = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let mgr = Arc::clone(&mgr);
                let key = key.clone();
                let barrier = Arc::clone(&barrier);
                let wins = Arc::clone(&wins);
                std::thread::spawn(move || {
                    let id = LockerIdentity::new(format!("user{}", i), format!("s{}", i));
                    barrier.wait();
                    if mgr.acquire(&id, &key, minutes(30), Wait::NoWait).is_acquired() {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(wins.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn bounded_wait_succeeds_once_holder_releases() {
        let mgr = Arc::new(manager());
        let alice = LockerIdentity::new("alice", "s1");
        let key = app_key("Orders");

        assert!(mgr.acquire(&alice, &key, minutes(30), Wait::NoWait).is_acquired());

        let waiter = {
            let mgr = Arc::clone(&mgr);
            let key = key.clone();
            std::thread::spawn(move || {
                let bob = LockerIdentity::new("bob", "s2");
                mgr.acquire(&bob, &key, minutes(30), Wait::For(StdDuration::from_secs(5)))
            })
        };

        std::thread::sleep(StdDuration::from_millis(50));
        mgr.release(&alice, &key);

        assert!(waiter.join().unwrap().is_acquired());
    }

    #[test]
    fn bounded_wait_times_out_against_a_held_lock() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let bob = LockerIdentity::new("bob", "s2");
        let key = app_key("Orders");

        assert!(mgr.acquire(&alice, &key, minutes(30), Wait::NoWait).is_acquired());

        let started = Instant::now();
        let outcome = mgr.acquire(&bob, &key, minutes(30), Wait::For(StdDuration::from_millis(60)));
        assert!(!outcome.is_acquired());
        assert!(started.elapsed() >= StdDuration::from_millis(60));
        assert!(mgr.is_locked(&alice, &key));
    }

    #[test]
    fn waiting_acquire_picks_up_expired_lease() {
        let mgr = manager();
        let alice = LockerIdentity::new("alice", "s1");
        let bob = LockerIdentity::new("bob", "s2");
        let key = app_key("Orders");

        assert!(
            mgr.acquire(&alice, &key, Some(Duration::milliseconds(30)), Wait::NoWait)
                .is_acquired()
        );

        // No explicit release: the waiter must notice the lease elapsing.
        let outcome = mgr.acquire(&bob, &key, minutes(30), Wait::For(StdDuration::from_secs(5)));
        assert!(outcome.is_acquired());
    }

    #[test]
    fn cancelled_wait_returns_promptly_without_partial_entry() {
        let mgr = Arc::new(manager());
        let alice = LockerIdentity::new("alice", "s1");
        let key = app_key("Orders");

        assert!(mgr.acquire(&alice, &key, minutes(30), Wait::NoWait).is_acquired());

        let token = CancelToken::new();
        let waiter = {
            let mgr = Arc::clone(&mgr);
            let key = key.clone();
            let token = token.clone();
            std::thread::spawn(move || {
                let bob = LockerIdentity::new("bob", "s2");
                mgr.acquire_with(&bob, &key, minutes(30), Wait::Forever, Some(&token))
            })
        };

        std::thread::sleep(StdDuration::from_millis(30));
        token.cancel();

        let outcome = waiter.join().unwrap();
        assert!(!outcome.is_acquired());

        // The table still has exactly alice's entry.
        assert!(mgr.is_locked(&alice, &key));
        assert_eq!(mgr.held_count(), 1);
    }

    #[test]
    fn lock_info_reports_nothing_for_free_key() {
        let mgr = manager();
        assert!(mgr.lock_info(&app_key("Orders")).is_none());
    }
}
