//! Coffer: lock-guarded, versioned file store for shared configuration artifacts.
//!
//! Coffer manages design-time edits to shared configuration objects
//! (applications, server configuration, role configuration) persisted as
//! JSON documents on disk. It layers single-writer locks with session
//! identity, override rules, and lease expiration on top of a
//! non-transactional filesystem, keeps an in-memory summary catalog
//! consistent with on-disk state, and makes multi-step saves revertible
//! through move-aside backups.
//!
//! The crate is a library: the request-dispatch layer, XML/wire marshaling,
//! and the surrounding object model are external consumers. They supply a
//! serialized artifact, a [`identity::LockerIdentity`] derived from a
//! security token, and (optionally) an [`acl::AccessPolicy`]; coffer exposes
//! lock acquisition/release/check, locked load/save/delete operations, and a
//! summary catalog of known objects.

pub mod acl;
pub mod artifact;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod fs;
pub mod identity;
pub mod listeners;
pub mod locks;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{Result, StoreError};
pub use identity::LockerIdentity;
pub use store::ObjectStore;
