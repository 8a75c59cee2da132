//! Configuration management for the snapshot agent.
//!
//! Built-in defaults, then an optional TOML file, then environment variables
//! (`SNAPSHOT_AGENT__SECTION__KEY`), each layer overriding the one before.

use crate::container::ContainerSettings;
use crate::fs::category::CategoryLayout;
use crate::snapshot::identity::StaticIdentity;
use crate::snapshot::staging::StagingNames;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SNAPSHOT_AGENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub container: ContainerConfig,
    pub snapshot: SnapshotConfig,
    pub restore: RestoreConfig,
    pub identity: StaticIdentity,
    pub log: LogConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Writable root of the application container
    pub root: Option<PathBuf>,

    /// Names of the category subtrees
    pub categories: CategoryLayout,

    /// Names of the staging artifacts in the scratch subtree
    pub staging: StagingNames,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Publish snapshots here instead of `<root>/<scratch>/<archive_name>`
    pub output: Option<PathBuf>,

    /// Additional root-relative substrings to leave out
    pub exclude_patterns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    /// Replace objects that already exist on the live tree
    pub overwrite: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self { overwrite: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Address the HTTP API binds to
    pub bind: String,

    /// HTTP API port
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 9990,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then `path` if given, then environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder()
            .add_source(::config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            builder = builder.add_source(
                ::config::File::from(path)
                    .format(::config::FileFormat::Toml)
                    .required(true),
            );
        }

        let config: Config = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("snapshot.exclude_patterns")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.container.categories.validate()?;
        Ok(config)
    }

    /// Effective configuration as TOML
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Operation settings for the container manager
    pub fn container_settings(&self) -> ContainerSettings {
        ContainerSettings {
            layout: self.container.categories.clone(),
            staging: self.container.staging.clone(),
            exclude_patterns: self.snapshot.exclude_patterns.clone(),
            output: self.snapshot.output.clone(),
            overwrite: self.restore.overwrite,
        }
    }
}
