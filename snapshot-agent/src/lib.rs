//! Snapshot Agent Library
//!
//! Snapshots and restores the private container of a sandboxed application:
//! its documents, library and scratch subtrees are packed into one tar
//! archive per category, and those are nested with a manifest into a single
//! outer archive.

pub mod api;
pub mod archive;
pub mod config;
pub mod container;
pub mod daemon;
pub mod fs;
pub mod restore;
pub mod snapshot;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use container::{ContainerManager, ContainerSettings};
pub use utils::errors::{Result, SnapshotError};
