//! Filesystem utilities for the object store.
//!
//! This module provides the safe filesystem operations the engine builds
//! on: atomic writes for documents and records, and recoverable (move-aside
//! with undo) operations for multi-step save and rename workflows.

pub mod atomic;
pub mod recoverable;

pub use atomic::atomic_write;
pub use atomic::atomic_write_str;
pub use recoverable::RecoverableMove;
