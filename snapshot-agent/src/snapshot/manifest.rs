//! Snapshot manifest.
//!
//! Stored as `manifest.json`, the first member of every outer archive, and
//! validated before a restore touches the live tree.

use super::identity::IdentityProvider;
use crate::fs::category::Category;
use crate::utils::errors::{Result, SnapshotError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Member name of the manifest inside the outer archive
pub const MANIFEST_NAME: &str = "manifest.json";

/// Newest manifest format this build reads and the one it writes
pub const FORMAT_VERSION: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub name: String,
    pub team: String,
    pub bundle: String,
    pub created_at: DateTime<Utc>,
    /// Sum of all packaged payload sizes in bytes
    pub total_size: u64,
    pub format_version: u32,
    #[serde(default)]
    pub entry_counts: BTreeMap<Category, u64>,
}

#[derive(Deserialize)]
struct VersionProbe {
    format_version: u32,
}

impl SnapshotManifest {
    pub fn new(
        identity: &dyn IdentityProvider,
        total_size: u64,
        entry_counts: BTreeMap<Category, u64>,
    ) -> Self {
        Self {
            name: identity.display_name().unwrap_or_default(),
            team: identity.team_id().unwrap_or_default(),
            bundle: identity.bundle_id().unwrap_or_default(),
            created_at: Utc::now(),
            total_size,
            format_version: FORMAT_VERSION,
            entry_counts,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a manifest, rejecting formats newer than [`FORMAT_VERSION`]
    /// before looking at any other field.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        if probe.format_version > FORMAT_VERSION {
            return Err(SnapshotError::UnsupportedManifestVersion {
                found: probe.format_version,
                supported: FORMAT_VERSION,
            });
        }
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn total_entries(&self) -> u64 {
        self.entry_counts.values().sum()
    }
}
