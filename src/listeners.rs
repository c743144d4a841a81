//! Change-listener registry for the object store.
//!
//! External collaborators register a [`StoreListener`] to hear about
//! successful create/update/remove operations. Notification runs over a
//! snapshot of the registration list, so listeners may register or
//! deregister concurrently with a notification pass without deadlocking.
//!
//! Listener failures are logged and swallowed: a listener must never be
//! able to fail or block an operation that has already succeeded on disk.

use crate::catalog::ObjectSummary;
use crate::error::Result;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Change event delivered to listeners after a successful mutation.
#[derive(Debug, Clone)]
pub enum StoreEvent<'a> {
    /// A new application was saved for the first time.
    ApplicationCreated(&'a ObjectSummary),
    /// An existing application was saved (possibly renamed).
    ApplicationUpdated(&'a ObjectSummary),
    /// An application was deleted.
    ApplicationRemoved(&'a ObjectSummary),
    /// The server configuration document was saved.
    ServerConfigSaved,
    /// The role configuration document was saved.
    RoleConfigSaved,
}

impl StoreEvent<'_> {
    /// Short action tag for logs and audit records.
    pub fn action(&self) -> &'static str {
        match self {
            StoreEvent::ApplicationCreated(_) => "application_created",
            StoreEvent::ApplicationUpdated(_) => "application_updated",
            StoreEvent::ApplicationRemoved(_) => "application_removed",
            StoreEvent::ServerConfigSaved => "server_config_saved",
            StoreEvent::RoleConfigSaved => "role_config_saved",
        }
    }
}

/// Observer of successful store mutations.
pub trait StoreListener: Send + Sync {
    /// Called after the mutation described by `event`, performed by `actor`,
    /// has fully succeeded. Errors are logged by the registry and otherwise
    /// ignored.
    fn notify(&self, actor: &str, event: &StoreEvent<'_>) -> Result<()>;
}

/// Synchronized collection of registered listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<Vec<Arc<dyn StoreListener>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<Arc<dyn StoreListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Register a listener.
    pub fn add(&self, listener: Arc<dyn StoreListener>) {
        self.lock_listeners().push(listener);
    }

    /// Deregister a listener previously passed to [`ListenerRegistry::add`].
    /// Unknown listeners are ignored.
    pub fn remove(&self, listener: &Arc<dyn StoreListener>) {
        self.lock_listeners()
            .retain(|registered| !Arc::ptr_eq(registered, listener));
    }

    pub fn len(&self) -> usize {
        self.lock_listeners().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every registered listener.
    ///
    /// Iterates a snapshot taken under the registration lock, then notifies
    /// outside it. A failing listener is logged and does not stop delivery
    /// to the rest.
    pub fn notify(&self, actor: &str, event: StoreEvent<'_>) {
        let snapshot: Vec<Arc<dyn StoreListener>> = self.lock_listeners().clone();
        for listener in snapshot {
            if let Err(e) = listener.notify(actor, &event) {
                warn!(action = event.action(), error = %e, "store listener failed");
            }
        }
    }
}

impl std::fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("registered", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactDocument;
    use crate::error::StoreError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        seen: AtomicUsize,
    }

    impl StoreListener for CountingListener {
        fn notify(&self, _actor: &str, _event: &StoreEvent<'_>) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingListener;

    impl StoreListener for FailingListener {
        fn notify(&self, _actor: &str, _event: &StoreEvent<'_>) -> Result<()> {
            Err(StoreError::InvalidConfig {
                reason: "listener exploded".to_string(),
            })
        }
    }

    fn sample_summary() -> ObjectSummary {
        let mut doc = ArtifactDocument::new("Orders");
        doc.id = 1;
        ObjectSummary::from_document(&doc, None)
    }

    #[test]
    fn every_registered_listener_is_notified() {
        let registry = ListenerRegistry::new();
        let first = Arc::new(CountingListener::default());
        let second = Arc::new(CountingListener::default());
        registry.add(first.clone());
        registry.add(second.clone());

        let summary = sample_summary();
        registry.notify("alice@s1", StoreEvent::ApplicationCreated(&summary));

        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failing_listener_does_not_stop_delivery() {
        let registry = ListenerRegistry::new();
        let counting = Arc::new(CountingListener::default());
        registry.add(Arc::new(FailingListener));
        registry.add(counting.clone());

        registry.notify("alice@s1", StoreEvent::ServerConfigSaved);

        assert_eq!(counting.seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listener_is_no_longer_notified() {
        let registry = ListenerRegistry::new();
        let counting = Arc::new(CountingListener::default());
        let as_dyn: Arc<dyn StoreListener> = counting.clone();
        registry.add(as_dyn.clone());

        registry.remove(&as_dyn);
        registry.notify("alice@s1", StoreEvent::RoleConfigSaved);

        assert_eq!(counting.seen.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn listener_may_deregister_during_notification() {
        struct SelfRemoving {
            registry: Arc<ListenerRegistry>,
            me: Mutex<Option<Arc<dyn StoreListener>>>,
        }

        impl StoreListener for SelfRemoving {
            fn notify(&self, _actor: &str, _event: &StoreEvent<'_>) -> Result<()> {
                if let Some(me) = self.me.lock().unwrap().take() {
                    self.registry.remove(&me);
                }
                Ok(())
            }
        }

        let registry = Arc::new(ListenerRegistry::new());
        let listener = Arc::new(SelfRemoving {
            registry: registry.clone(),
            me: Mutex::new(None),
        });
        let as_dyn: Arc<dyn StoreListener> = listener.clone();
        *listener.me.lock().unwrap() = Some(as_dyn.clone());
        registry.add(as_dyn);

        // Must not deadlock: notification iterates a snapshot.
        registry.notify("alice@s1", StoreEvent::ServerConfigSaved);
        assert!(registry.is_empty());
    }
}
