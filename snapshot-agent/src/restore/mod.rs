//! Restore engine - reconstructs a container root from an outer archive.
//!
//! The supplied archive is first copied into a private staging directory and
//! unpacked there. Nothing on the live tree is touched until the manifest has
//! been validated and every inner archive is present. Inner archives are then
//! applied in category order; a corrupt inner archive stops the restore and
//! no later category is applied.

pub mod apply;

use crate::archive::ArchiveReader;
use crate::fs::category::{Category, CategoryLayout};
use crate::snapshot::manifest::{SnapshotManifest, MANIFEST_NAME};
use crate::snapshot::staging::{StagingDir, StagingNames};
use crate::snapshot::{ensure_directory, join_error};
use crate::utils::errors::{RestoreStage, Result, SnapshotError};
use crate::utils::format::{format_bytes, format_duration};
use apply::{ApplyOptions, ApplyOutcome, DeferredAttributes};
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, Write};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Staged copy of the supplied archive
const INCOMING_NAME: &str = "incoming.tar";

/// Per-category apply result
#[derive(Debug, Clone, Serialize)]
pub struct CategoryRestore {
    pub category: Category,
    pub applied: u64,
    /// Existing objects left alone because overwrite was disabled
    pub kept: u64,
    /// Names of entries that could not be applied
    pub skipped: Vec<String>,
}

impl CategoryRestore {
    fn new(category: Category) -> Self {
        Self {
            category,
            applied: 0,
            kept: 0,
            skipped: Vec::new(),
        }
    }
}

/// Restore execution result
#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub archive_path: PathBuf,
    pub manifest: SnapshotManifest,
    pub categories: Vec<CategoryRestore>,
    pub duration_secs: f64,
}

impl RestoreReport {
    pub fn skipped_entries(&self) -> usize {
        self.categories.iter().map(|c| c.skipped.len()).sum()
    }
}

/// Restores outer archives onto one container root
pub struct RestoreEngine {
    root: PathBuf,
    layout: CategoryLayout,
    staging: StagingNames,
    options: ApplyOptions,
}

impl RestoreEngine {
    pub fn new(root: PathBuf, layout: CategoryLayout, staging: StagingNames) -> Self {
        Self {
            root,
            layout,
            staging,
            options: ApplyOptions::default(),
        }
    }

    pub fn with_options(mut self, options: ApplyOptions) -> Self {
        self.options = options;
        self
    }

    /// Restore `archive` onto the root. Staging is removed on every path out.
    pub async fn restore(&self, archive: &Path) -> Result<RestoreReport> {
        let start_time = Instant::now();
        info!("Restoring {} onto {}", archive.display(), self.root.display());

        ensure_directory(&self.root).map_err(|e| SnapshotError::restore(RestoreStage::Import, e))?;

        let staging_path = self.staging.restore_dir(&self.root, &self.layout);
        let staging = StagingDir::create(staging_path)
            .map_err(|e| SnapshotError::restore(RestoreStage::Import, e))?;

        let result = self.restore_in(&staging, archive).await;
        staging.remove();

        match result {
            Ok((manifest, categories)) => {
                let report = RestoreReport {
                    archive_path: archive.to_path_buf(),
                    manifest,
                    categories,
                    duration_secs: start_time.elapsed().as_secs_f64(),
                };
                info!(
                    "Restore completed: {} entries ({} payload) from {}, {} skipped, in {}",
                    report.manifest.total_entries(),
                    format_bytes(report.manifest.total_size),
                    archive.display(),
                    report.skipped_entries(),
                    format_duration(start_time.elapsed())
                );
                Ok(report)
            }
            Err(e) => {
                warn!("Restore of {} failed: {}", archive.display(), e);
                Err(e)
            }
        }
    }

    async fn restore_in(
        &self,
        staging: &StagingDir,
        archive: &Path,
    ) -> Result<(SnapshotManifest, Vec<CategoryRestore>)> {
        let incoming = staging.join(INCOMING_NAME);
        let source = archive.to_path_buf();
        let destination = incoming.clone();
        tokio::task::spawn_blocking(move || fs::copy(&source, &destination))
            .await
            .map_err(|e| SnapshotError::restore(RestoreStage::Import, join_error(e)))?
            .map_err(|e| SnapshotError::restore(RestoreStage::Import, e))?;

        let staging_dir = staging.path().to_path_buf();
        let manifest_bytes =
            tokio::task::spawn_blocking(move || unpack_outer(&incoming, &staging_dir))
                .await
                .map_err(|e| SnapshotError::restore(RestoreStage::Unpack, join_error(e)))??;

        let manifest_bytes = manifest_bytes.ok_or_else(|| {
            SnapshotError::restore(
                RestoreStage::Manifest,
                SnapshotError::CorruptArchive(format!("{} is missing", MANIFEST_NAME)),
            )
        })?;
        let manifest = SnapshotManifest::from_json(&manifest_bytes)
            .map_err(|e| SnapshotError::restore(RestoreStage::Manifest, e))?;
        debug!(
            "Manifest: '{}' ({}) created {}, format {}",
            manifest.name, manifest.bundle, manifest.created_at, manifest.format_version
        );

        for category in Category::ALL {
            if !staging.join(category.archive_name()).is_file() {
                return Err(SnapshotError::restore(
                    RestoreStage::Unpack,
                    SnapshotError::CorruptArchive(format!("{} is missing", category.archive_name())),
                ));
            }
        }

        let mut categories = Vec::with_capacity(Category::ALL.len());
        for category in Category::ALL {
            let inner = staging.join(category.archive_name());
            let root = self.root.clone();
            let options = self.options;
            let restored =
                tokio::task::spawn_blocking(move || apply_archive(category, &inner, &root, &options))
                    .await
                    .map_err(|e| SnapshotError::restore(RestoreStage::Apply, join_error(e)))??;
            categories.push(restored);
        }

        Ok((manifest, categories))
    }
}

/// Unpack the outer archive into `staging`. Returns the manifest bytes if present.
fn unpack_outer(outer: &Path, staging: &Path) -> Result<Option<Vec<u8>>> {
    let file = File::open(outer).map_err(|e| SnapshotError::restore(RestoreStage::Unpack, e))?;
    let mut reader = ArchiveReader::new(BufReader::new(file));
    let mut manifest = None;
    let mut last_entry: Option<String> = None;

    let result = reader.for_each_entry(|entry| {
        let name = entry.name.clone();
        if name == MANIFEST_NAME {
            manifest = entry.payload;
        } else if let Some(category) = Category::from_archive_name(&name) {
            let mut out = File::create(staging.join(category.archive_name()))?;
            out.write_all(entry.payload.as_deref().unwrap_or_default())?;
            out.sync_all()?;
            debug!("Staged {} ({} bytes)", name, out.metadata()?.len());
        } else {
            warn!("Ignoring unknown member '{}' in outer archive", name);
        }
        last_entry = Some(name);
        Ok(ControlFlow::Continue(()))
    });

    match result {
        Ok(_) => Ok(manifest),
        Err(source) => {
            warn!(
                "Unpacking {} stopped at byte {}",
                outer.display(),
                reader.position()
            );
            Err(SnapshotError::RestoreFailed {
                stage: RestoreStage::Unpack,
                archive: Some(outer.display().to_string()),
                entry: last_entry,
                source: Box::new(source),
            })
        }
    }
}

/// Apply one inner archive onto `root`.
///
/// Entries that fail to apply are logged and recorded as skipped. A read
/// error aborts the archive. Deferred directory attributes are applied
/// deepest first once no more entries will be written.
pub fn apply_archive(
    category: Category,
    archive: &Path,
    root: &Path,
    options: &ApplyOptions,
) -> Result<CategoryRestore> {
    let archive_name = category.archive_name();
    let file = File::open(archive).map_err(|e| SnapshotError::RestoreFailed {
        stage: RestoreStage::Apply,
        archive: Some(archive_name.to_string()),
        entry: None,
        source: Box::new(e.into()),
    })?;

    let mut reader = ArchiveReader::new(BufReader::new(file));
    let mut restored = CategoryRestore::new(category);
    let mut deferred: Vec<DeferredAttributes> = Vec::new();
    let mut last_entry: Option<String> = None;

    let result = reader.for_each_entry(|entry| {
        match entry.apply_to(root, options) {
            Ok(ApplyOutcome::Applied) => restored.applied += 1,
            Ok(ApplyOutcome::Deferred(attributes)) => {
                restored.applied += 1;
                deferred.push(attributes);
            }
            Ok(ApplyOutcome::Kept) => {
                debug!("Kept existing {}", entry.name);
                restored.kept += 1;
            }
            Err(e) => {
                warn!("Skipping entry '{}' of {}: {}", entry.name, archive_name, e);
                restored.skipped.push(entry.name.clone());
            }
        }
        last_entry = Some(entry.name);
        Ok(ControlFlow::Continue(()))
    });

    apply_deferred(deferred);

    match result {
        Ok(_) => {
            info!(
                "Applied {}: {} entries, {} kept, {} skipped",
                archive_name,
                restored.applied,
                restored.kept,
                restored.skipped.len()
            );
            Ok(restored)
        }
        Err(source) => {
            warn!(
                "Reading {} stopped at byte {}",
                archive_name,
                reader.position()
            );
            Err(SnapshotError::RestoreFailed {
                stage: RestoreStage::Apply,
                archive: Some(archive_name.to_string()),
                entry: last_entry,
                source: Box::new(source),
            })
        }
    }
}

fn apply_deferred(mut deferred: Vec<DeferredAttributes>) {
    deferred.sort_by_key(|d| std::cmp::Reverse(d.path.components().count()));
    for item in deferred {
        if let Err(e) = item.attributes.apply_to_path(&item.path, false) {
            warn!("Failed to set attributes on {}: {}", item.path.display(), e);
        }
    }
}
