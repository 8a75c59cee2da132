//! Snapshot Agent - Main entry point
//!
//! One-shot commands for classify, snapshot, restore and purge, plus a
//! `serve` mode exposing the same operations over a local HTTP API.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use snapshot_agent::snapshot::identity::IdentityProvider;
use snapshot_agent::{api, config::Config, daemon, utils, ContainerManager};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Container root (overrides config)
    #[arg(short, long, value_name = "DIR")]
    root: Option<PathBuf>,

    /// Use the shared group container with this identifier as the root
    #[arg(short, long, value_name = "ID", conflicts_with = "root")]
    group: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show how the root partitions into categories
    Classify,

    /// Build a snapshot archive of the root
    Snapshot {
        /// Write the archive here instead of the scratch directory
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Restore a snapshot archive onto the root
    Restore {
        /// Snapshot archive to restore
        archive: PathBuf,
    },

    /// Remove everything inside the category directories
    Purge {
        /// Confirm the purge
        #[arg(long)]
        yes: bool,
    },

    /// Serve the HTTP API
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    if let Command::Config = args.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let root = absolute(&resolve_root(&args, &config)?)?;
    if let Command::Snapshot { output: Some(output) } = &args.command {
        config.snapshot.output = Some(absolute(output)?);
    }

    let identity = Arc::new(config.identity.clone());
    let manager = Arc::new(ContainerManager::new(
        root,
        config.container_settings(),
        identity,
    ));

    match args.command {
        Command::Classify => print_json(&manager.classify().await?),
        Command::Snapshot { .. } => print_json(&manager.snapshot().await?),
        Command::Restore { archive } => print_json(&manager.restore(&absolute(&archive)?).await?),
        Command::Purge { yes } => {
            if !yes {
                bail!(
                    "refusing to purge {} without --yes",
                    manager.root().display()
                );
            }
            print_json(&manager.purge().await?)
        }
        Command::Serve { port } => serve(manager, &config, port).await,
        Command::Config => Ok(()),
    }
}

/// Root precedence: `--root`, then `--group`, then the configured root.
fn resolve_root(args: &Args, config: &Config) -> Result<PathBuf> {
    if let Some(root) = &args.root {
        return Ok(root.clone());
    }
    if let Some(group) = &args.group {
        return config
            .identity
            .group_container(group)
            .with_context(|| format!("no group container configured for '{}'", group));
    }
    match &config.container.root {
        Some(root) => Ok(root.clone()),
        None => bail!("no container root: pass --root or --group, or set container.root"),
    }
}

/// Resolve a command-line path against the working directory.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn serve(manager: Arc<ContainerManager>, config: &Config, port: Option<u16>) -> Result<()> {
    // Initialize start time for uptime tracking
    api::health::init_start_time();

    tracing::info!(
        "Starting snapshot-agent v{} (root: {})",
        env!("CARGO_PKG_VERSION"),
        manager.root().display()
    );

    let port = port.unwrap_or(config.api.port);
    let ip = config
        .api
        .bind
        .parse::<std::net::IpAddr>()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;
    let addr = SocketAddr::new(ip, port);

    let app = api::create_router(api::AppState::new(manager));

    tracing::info!("Listening on http://{}", addr);
    tracing::info!("Health endpoint: http://{}/health", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(daemon::shutdown::wait_for_signal())
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
