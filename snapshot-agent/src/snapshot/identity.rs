//! Identity of the application whose container is snapshotted.
//!
//! The agent never queries platform entitlements itself; whoever embeds it
//! supplies an [`IdentityProvider`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub trait IdentityProvider: Send + Sync {
    /// Human-readable application name
    fn display_name(&self) -> Option<String>;

    /// Bundle identifier of the application
    fn bundle_id(&self) -> Option<String>;

    /// Signing team identifier, when known
    fn team_id(&self) -> Option<String>;

    /// Root of a shared group container, by group identifier
    fn group_container(&self, id: &str) -> Option<PathBuf>;
}

/// A shared group container root, by group identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupContainer {
    pub id: String,
    pub path: PathBuf,
}

/// Identity read from configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticIdentity {
    pub name: Option<String>,
    pub team: Option<String>,
    pub bundle: Option<String>,
    pub group_containers: Vec<GroupContainer>,
}

impl IdentityProvider for StaticIdentity {
    fn display_name(&self) -> Option<String> {
        self.name.clone().or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
        })
    }

    fn bundle_id(&self) -> Option<String> {
        self.bundle.clone()
    }

    fn team_id(&self) -> Option<String> {
        self.team.clone()
    }

    fn group_container(&self, id: &str) -> Option<PathBuf> {
        self.group_containers
            .iter()
            .find(|group| group.id == id)
            .map(|group| group.path.clone())
    }
}
