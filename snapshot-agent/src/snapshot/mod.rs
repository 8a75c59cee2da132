//! Snapshot builder - packages a container root into one outer archive.
//!
//! The build runs in stages:
//! - classify the root, leaving out staging artifacts
//! - write one inner archive per category (concurrently)
//! - join, then write the outer archive: manifest first, then the three
//!   inner archives in category order
//! - move the finished outer archive onto its final path
//!
//! The staging subtree is removed whatever the outcome, and the final path is
//! only ever replaced by a complete archive.

pub mod identity;
pub mod manifest;
pub mod staging;

use crate::archive::{entry_name, ArchiveEntry, ArchiveWriter};
use crate::fs::category::{Category, CategoryLayout};
use crate::fs::metadata::EntryAttributes;
use crate::fs::walker::{classify, WalkOptions};
use crate::utils::errors::{BackupStage, Result, SnapshotError};
use crate::utils::format::{format_bytes, format_duration};
use identity::IdentityProvider;
use manifest::{SnapshotManifest, MANIFEST_NAME};
use serde::Serialize;
use staging::{StagingDir, StagingNames};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

/// Per-category packaging result
#[derive(Debug, Clone, Serialize)]
pub struct CategoryStats {
    pub category: Category,
    pub entries: u64,
    pub bytes: u64,
    /// Entries that vanished or became unreadable after classification
    pub skipped: u64,
}

/// Snapshot execution result
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub archive_path: PathBuf,
    pub archive_bytes: u64,
    pub manifest: SnapshotManifest,
    pub categories: Vec<CategoryStats>,
    pub duration_secs: f64,
}

/// Builds snapshots of one container root
pub struct SnapshotBuilder {
    root: PathBuf,
    layout: CategoryLayout,
    staging: StagingNames,
    exclude_patterns: Vec<String>,
    output: PathBuf,
    identity: Arc<dyn IdentityProvider>,
}

impl SnapshotBuilder {
    pub fn new(
        root: PathBuf,
        layout: CategoryLayout,
        staging: StagingNames,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let output = staging.default_output(&root, &layout);
        let exclude_patterns = staging.exclude_patterns(&layout);
        Self {
            root,
            layout,
            staging,
            exclude_patterns,
            output,
            identity,
        }
    }

    /// Publish the outer archive at `output` instead of the scratch default.
    pub fn with_output(mut self, output: PathBuf) -> Self {
        if let Ok(relative) = output.strip_prefix(&self.root) {
            self.exclude_patterns.push(relative.to_string_lossy().into_owned());
        }
        self.output = output;
        self
    }

    /// Additional root-relative substrings to leave out of the snapshot
    pub fn with_excludes<I>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = String>,
    {
        self.exclude_patterns.extend(patterns);
        self
    }

    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Build a snapshot. Returns only once the outer archive is complete.
    pub async fn build(&self) -> Result<SnapshotReport> {
        let start_time = Instant::now();
        info!("Starting snapshot of {}", self.root.display());

        // Staging lives below the root, so creating it must not conjure a
        // missing root into existence.
        ensure_directory(&self.root).map_err(|e| SnapshotError::backup(BackupStage::Prepare, e))?;

        let staging_path = self.staging.snapshot_dir(&self.root, &self.layout);
        let staging = StagingDir::create(staging_path)
            .map_err(|e| SnapshotError::backup(BackupStage::Prepare, e))?;

        let result = self.build_in(&staging).await;
        staging.remove();

        match result {
            Ok((manifest, categories, archive_bytes)) => {
                let duration = start_time.elapsed();
                info!(
                    "Snapshot completed: {} entries, {} payload, archive {} ({}) in {}",
                    manifest.total_entries(),
                    format_bytes(manifest.total_size),
                    self.output.display(),
                    format_bytes(archive_bytes),
                    format_duration(duration)
                );
                Ok(SnapshotReport {
                    archive_path: self.output.clone(),
                    archive_bytes,
                    manifest,
                    categories,
                    duration_secs: duration.as_secs_f64(),
                })
            }
            Err(e) => {
                warn!("Snapshot of {} failed: {}", self.root.display(), e);
                Err(e)
            }
        }
    }

    async fn build_in(
        &self,
        staging: &StagingDir,
    ) -> Result<(SnapshotManifest, Vec<CategoryStats>, u64)> {
        // Classify in a blocking task (directory walk)
        let root = self.root.clone();
        let layout = self.layout.clone();
        let options = WalkOptions::with_excludes(self.exclude_patterns.clone());
        let classification = tokio::task::spawn_blocking(move || classify(&root, &layout, &options))
            .await
            .map_err(|e| SnapshotError::backup(BackupStage::Classify, join_error(e)))?
            .map_err(|e| SnapshotError::backup(BackupStage::Classify, e))?;

        info!(
            "Classified {} paths: {} documents, {} library, {} scratch",
            classification.total(),
            classification.documents.len(),
            classification.library.len(),
            classification.scratch.len()
        );

        // One blocking writer per category; all three are awaited before any
        // result is inspected.
        let mut handles = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let root = self.root.clone();
            let paths = classification.get(category).clone();
            let destination = staging.join(category.archive_name());
            handles.push((
                category,
                tokio::task::spawn_blocking(move || {
                    write_category_archive(category, &root, &paths, &destination)
                }),
            ));
        }

        let mut joined = Vec::with_capacity(handles.len());
        for (category, handle) in handles {
            joined.push((category, handle.await));
        }

        let mut categories = Vec::with_capacity(joined.len());
        for (category, result) in joined {
            let stage = BackupStage::Category(category.as_str());
            let stats = result
                .map_err(|e| SnapshotError::backup(stage.clone(), join_error(e)))?
                .map_err(|e| SnapshotError::backup(stage, e))?;
            categories.push(stats);
        }

        let total_size = categories.iter().map(|s| s.bytes).sum();
        let entry_counts: BTreeMap<Category, u64> =
            categories.iter().map(|s| (s.category, s.entries)).collect();
        let manifest = SnapshotManifest::new(self.identity.as_ref(), total_size, entry_counts);
        let manifest_json = manifest
            .to_json()
            .map_err(|e| SnapshotError::backup(BackupStage::Manifest, e))?;

        // Outer archive is written inside staging and only renamed into place
        // once finalized.
        let partial = staging.join(&format!("{}.partial", self.staging.archive_name));
        let staging_dir = staging.path().to_path_buf();
        let outer_path = partial.clone();
        let archive_bytes = tokio::task::spawn_blocking(move || {
            write_outer_archive(&outer_path, &staging_dir, manifest_json)
        })
        .await
        .map_err(|e| SnapshotError::backup(BackupStage::Outer, join_error(e)))?
        .map_err(|e| SnapshotError::backup(BackupStage::Outer, e))?;

        let output = self.output.clone();
        tokio::task::spawn_blocking(move || publish(&partial, &output))
            .await
            .map_err(|e| SnapshotError::backup(BackupStage::Publish, join_error(e)))?
            .map_err(|e| SnapshotError::backup(BackupStage::Publish, e))?;

        Ok((manifest, categories, archive_bytes))
    }
}

/// Write the inner archive for one category.
///
/// Paths are appended in sorted order so directories precede their contents.
/// Objects that disappeared, became unreadable or are not files, directories
/// or symlinks are skipped; any write failure aborts.
pub fn write_category_archive(
    category: Category,
    root: &Path,
    paths: &BTreeSet<PathBuf>,
    destination: &Path,
) -> Result<CategoryStats> {
    let file = File::create(destination)?;
    let mut writer = ArchiveWriter::new(BufWriter::new(file));
    let mut stats = CategoryStats {
        category,
        entries: 0,
        bytes: 0,
        skipped: 0,
    };

    for relative in paths {
        let path = root.join(relative);
        let entry = entry_name(root, &path).and_then(|name| ArchiveEntry::from_path(&path, &name));
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.is_skippable() => {
                warn!("Skipping {}: {}", path.display(), e);
                stats.skipped += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        writer.append(&entry)?;
        debug!("Packed {} ({} bytes)", entry.name, entry.size());
        stats.entries += 1;
        stats.bytes += entry.size();
    }

    writer.finalize()?;
    let file = writer.into_inner().into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    info!(
        "Wrote {} archive: {} entries, {} ({} skipped)",
        category,
        stats.entries,
        format_bytes(stats.bytes),
        stats.skipped
    );
    Ok(stats)
}

/// Write the outer archive: manifest, then each category archive from `staging`.
fn write_outer_archive(destination: &Path, staging: &Path, manifest_json: Vec<u8>) -> Result<u64> {
    let file = File::create(destination)?;
    let mut writer = ArchiveWriter::new(BufWriter::new(file));

    let manifest_entry = ArchiveEntry::file(MANIFEST_NAME, manifest_json).with_attributes(
        EntryAttributes {
            permissions: Some(0o644),
            modified_at: Some(chrono::Utc::now().timestamp()),
        },
    );
    writer.append(&manifest_entry)?;

    for category in Category::ALL {
        let name = category.archive_name();
        writer.append_path(&staging.join(name), name)?;
    }

    writer.finalize()?;
    let archive_bytes = writer.bytes_written();
    let file = writer.into_inner().into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(archive_bytes)
}

/// Move a finished archive onto `output`, copying when a rename is not
/// possible (e.g. across filesystems). `output` is never left half-written.
fn publish(finished: &Path, output: &Path) -> io::Result<()> {
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)?;
    }

    match fs::rename(finished, output) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("Rename to {} failed ({}), copying instead", output.display(), e);
            let mut sibling = output.as_os_str().to_owned();
            sibling.push(".partial");
            let sibling = PathBuf::from(sibling);

            let copied = fs::copy(finished, &sibling)
                .and_then(|_| File::open(&sibling)?.sync_all())
                .and_then(|_| fs::rename(&sibling, output));
            if copied.is_err() {
                let _ = fs::remove_file(&sibling);
            }
            copied
        }
    }
}

pub(crate) fn ensure_directory(path: &Path) -> io::Result<()> {
    if fs::metadata(path)?.is_dir() {
        Ok(())
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a directory", path.display()),
        ))
    }
}

pub(crate) fn join_error(e: JoinError) -> SnapshotError {
    io::Error::new(io::ErrorKind::Other, format!("blocking task failed: {}", e)).into()
}
