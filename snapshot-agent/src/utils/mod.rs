//! Utility modules for the snapshot agent.

pub mod errors;
pub mod format;
pub mod logger;

pub use errors::{BackupStage, RestoreStage, Result, SnapshotError};
