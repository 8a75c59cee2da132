//! Error types for the snapshot agent.

use std::fmt;
use thiserror::Error;

/// Stage of a snapshot build, reported with [`SnapshotError::BackupFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupStage {
    /// Creating the staging subtree
    Prepare,
    /// Enumerating and classifying the root
    Classify,
    /// Writing one inner category archive
    Category(&'static str),
    /// Serializing the manifest
    Manifest,
    /// Writing the outer archive
    Outer,
    /// Moving the finished outer archive onto its final path
    Publish,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupStage::Prepare => f.write_str("prepare"),
            BackupStage::Classify => f.write_str("classify"),
            BackupStage::Category(name) => write!(f, "category archive '{}'", name),
            BackupStage::Manifest => f.write_str("manifest"),
            BackupStage::Outer => f.write_str("outer archive"),
            BackupStage::Publish => f.write_str("publish"),
        }
    }
}

/// Stage of a restore, reported with [`SnapshotError::RestoreFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreStage {
    /// Copying the supplied archive into staging
    Import,
    /// Unpacking the outer archive into staging
    Unpack,
    /// Reading and validating the manifest
    Manifest,
    /// Applying one inner category archive onto the root
    Apply,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreStage::Import => f.write_str("import"),
            RestoreStage::Unpack => f.write_str("unpack"),
            RestoreStage::Manifest => f.write_str("manifest"),
            RestoreStage::Apply => f.write_str("apply"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Unsupported manifest version {found} (newest supported: {supported})")]
    UnsupportedManifestVersion { found: u32, supported: u32 },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Backup failed during {stage}: {source}")]
    BackupFailed {
        stage: BackupStage,
        #[source]
        source: Box<SnapshotError>,
    },

    #[error("Restore failed during {stage}{}: {source}", restore_context(.archive, .entry))]
    RestoreFailed {
        stage: RestoreStage,
        archive: Option<String>,
        entry: Option<String>,
        #[source]
        source: Box<SnapshotError>,
    },
}

impl SnapshotError {
    pub fn backup(stage: BackupStage, source: impl Into<SnapshotError>) -> Self {
        SnapshotError::BackupFailed {
            stage,
            source: Box::new(source.into()),
        }
    }

    pub fn restore(stage: RestoreStage, source: impl Into<SnapshotError>) -> Self {
        SnapshotError::RestoreFailed {
            stage,
            archive: None,
            entry: None,
            source: Box::new(source.into()),
        }
    }

    /// True for I/O failures that mean "this path is gone or off limits",
    /// which packaging treats as a skip rather than an abort.
    pub fn is_skippable(&self) -> bool {
        match self {
            SnapshotError::Unsupported(_) => true,
            SnapshotError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            _ => false,
        }
    }
}

fn restore_context(archive: &Option<String>, entry: &Option<String>) -> String {
    let mut context = String::new();
    if let Some(archive) = archive {
        context.push_str(&format!(" of '{}'", archive));
    }
    if let Some(entry) = entry {
        context.push_str(&format!(" after entry '{}'", entry));
    }
    context
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_failed_message_names_archive_and_entry() {
        let err = SnapshotError::RestoreFailed {
            stage: RestoreStage::Apply,
            archive: Some("library.tar".to_string()),
            entry: Some("Library/Preferences/app.plist".to_string()),
            source: Box::new(SnapshotError::CorruptArchive("bad checksum".to_string())),
        };

        let message = err.to_string();
        assert!(message.contains("apply"));
        assert!(message.contains("library.tar"));
        assert!(message.contains("Library/Preferences/app.plist"));
        assert!(message.contains("bad checksum"));
    }

    #[test]
    fn test_backup_failed_names_stage() {
        let err = SnapshotError::backup(
            BackupStage::Category("documents"),
            std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        );
        assert!(err.to_string().contains("category archive 'documents'"));
    }

    #[test]
    fn test_skippable_errors() {
        let gone = SnapshotError::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        let full = SnapshotError::Io(std::io::Error::new(std::io::ErrorKind::Other, "full"));
        assert!(gone.is_skippable());
        assert!(SnapshotError::Unsupported("fifo".into()).is_skippable());
        assert!(!full.is_skippable());
        assert!(!SnapshotError::CorruptArchive("x".into()).is_skippable());
    }
}
