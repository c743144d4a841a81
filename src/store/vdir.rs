//! Virtual-directory registration.
//!
//! Each application declares a request-root directory that holds its ad hoc
//! files. The engine serves file operations through this map, application
//! name to request-root path, and keeps it synchronized with the artifact's
//! declared root on every save, rename, and delete. Lookups are
//! case-insensitive on the application name, like the catalog.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Synchronized map of application name to request-root path.
#[derive(Debug, Default)]
pub struct VirtualDirMap {
    mappings: Mutex<HashMap<String, PathBuf>>,
}

impl VirtualDirMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_mappings(&self) -> MutexGuard<'_, HashMap<String, PathBuf>> {
        self.mappings
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Register (or re-register) an application's request root.
    pub fn register(&self, name: &str, root: impl Into<PathBuf>) {
        self.lock_mappings().insert(name.to_lowercase(), root.into());
    }

    /// Remove an application's registration. Unknown names are ignored.
    pub fn unregister(&self, name: &str) {
        self.lock_mappings().remove(&name.to_lowercase());
    }

    /// Resolve an application's request root.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.lock_mappings().get(&name.to_lowercase()).cloned()
    }

    /// Whether the given path lies under any registered root.
    pub fn covers(&self, path: &Path) -> bool {
        self.lock_mappings()
            .values()
            .any(|root| path.starts_with(root))
    }

    pub fn len(&self) -> usize {
        self.lock_mappings().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_resolve_case_insensitively() {
        let vdirs = VirtualDirMap::new();
        vdirs.register("Orders", "/store/roots/orders");

        assert_eq!(
            vdirs.resolve("ORDERS"),
            Some(PathBuf::from("/store/roots/orders"))
        );
    }

    #[test]
    fn reregistration_replaces_the_root() {
        let vdirs = VirtualDirMap::new();
        vdirs.register("Orders", "/store/roots/orders");
        vdirs.register("orders", "/store/roots/orders-v2");

        assert_eq!(
            vdirs.resolve("Orders"),
            Some(PathBuf::from("/store/roots/orders-v2"))
        );
        assert_eq!(vdirs.len(), 1);
    }

    #[test]
    fn unregister_removes_the_mapping() {
        let vdirs = VirtualDirMap::new();
        vdirs.register("Orders", "/store/roots/orders");
        vdirs.unregister("orders");

        assert!(vdirs.resolve("Orders").is_none());
        assert!(vdirs.is_empty());

        // Unknown names are quietly ignored.
        vdirs.unregister("Orders");
    }

    #[test]
    fn covers_detects_paths_under_registered_roots() {
        let vdirs = VirtualDirMap::new();
        vdirs.register("Orders", "/store/roots/orders");

        assert!(vdirs.covers(Path::new("/store/roots/orders/assets/logo.png")));
        assert!(!vdirs.covers(Path::new("/store/roots/billing/readme.txt")));
    }
}
