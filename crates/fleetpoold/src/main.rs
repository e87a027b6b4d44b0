//! fleetpoold: shared database and cache pools for a device fleet.
//!
//! Wires the pool managers to the real collaborators:
//! - State store (redb), also backing the vault and device directory
//! - SSH command execution
//! - Docker Compose orchestration on each device
//!
//! # Usage
//!
//! ```text
//! fleetpoold --config /etc/fleetpool/fleetpool.toml ensure --device pi-1 --engine redis --app myapp
//! fleetpoold credentials --device pi-1 --engine redis --app myapp
//! fleetpoold stats
//! ```

mod backends;
mod config;
mod docker;
mod ssh;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fleetpool_pool::{Engine, PoolContext, ResourcePoolManager};
use fleetpool_state::{ResourceFamily, StateStore};

use crate::backends::{StoreDeviceDirectory, StoreVault};
use crate::config::DaemonConfig;
use crate::docker::DockerOrchestrator;
use crate::ssh::SshExecutor;

#[derive(Parser)]
#[command(name = "fleetpoold", about = "Shared database and cache pools for a device fleet")]
struct Cli {
    /// Configuration file.
    #[arg(long, default_value = "/etc/fleetpool/fleetpool.toml")]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Give an app a database or cache on a device's shared instance.
    Ensure(AppTarget),
    /// Print an app's connection details.
    Credentials(AppTarget),
    /// Drop an app's database or cache namespace.
    Release(AppTarget),
    /// List shared instances.
    Instances {
        #[arg(long, value_enum)]
        family: Option<Family>,
    },
    /// Usage per shared instance.
    Stats,
    /// Remove instances left behind by interrupted deployments.
    Reconcile,
    /// List known devices.
    Devices,
}

#[derive(clap::Args)]
struct AppTarget {
    #[arg(long)]
    device: String,
    /// postgres, mysql, mariadb, redis, valkey, or memcached.
    #[arg(long)]
    engine: String,
    #[arg(long)]
    app: String,
}

#[derive(Clone, Copy, ValueEnum)]
enum Family {
    Database,
    Cache,
}

struct Pools {
    database: ResourcePoolManager,
    cache: ResourcePoolManager,
}

impl Pools {
    fn for_engine(&self, engine: &str) -> anyhow::Result<&ResourcePoolManager> {
        let engine: Engine = engine.parse()?;
        Ok(match engine.family() {
            ResourceFamily::Database => &self.database,
            ResourceFamily::Cache => &self.cache,
        })
    }

    fn all(&self) -> [&ResourcePoolManager; 2] {
        [&self.database, &self.cache]
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = if cli.config.exists() {
        DaemonConfig::from_file(&cli.config)?
    } else {
        warn!(path = ?cli.config, "config file not found, using defaults");
        DaemonConfig::default()
    };

    if let Some(parent) = config.store.path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = StateStore::open(&config.store.path)?;
    info!(path = ?config.store.path, "state store opened");
    sync_devices(&store, &config)?;

    let pools = build_pools(&config, store.clone())?;

    match cli.command {
        Command::Ensure(t) => {
            let resource = pools
                .for_engine(&t.engine)?
                .ensure_resource_for_app(&t.device, &t.engine, &t.app)
                .await?;
            print_json(&resource)
        }
        Command::Credentials(t) => {
            let info = pools
                .for_engine(&t.engine)?
                .get_credentials(&t.device, &t.engine, &t.app)
                .await?;
            print_json(&serde_json::json!({ "connection": info, "url": info.url() }))
        }
        Command::Release(t) => {
            pools
                .for_engine(&t.engine)?
                .release_resource_for_app(&t.device, &t.engine, &t.app)
                .await?;
            info!(device = %t.device, engine = %t.engine, app = %t.app, "released");
            Ok(())
        }
        Command::Instances { family } => {
            let mut instances = Vec::new();
            for pool in pools.all() {
                let wanted = match family {
                    None => true,
                    Some(Family::Database) => pool.family() == ResourceFamily::Database,
                    Some(Family::Cache) => pool.family() == ResourceFamily::Cache,
                };
                if wanted {
                    instances.extend(pool.list_instances()?);
                }
            }
            print_json(&instances)
        }
        Command::Stats => {
            let stats = pools
                .all()
                .into_iter()
                .map(|pool| pool.stats())
                .collect::<Result<Vec<_>, _>>()?;
            print_json(&stats)
        }
        Command::Reconcile => {
            let mut reaped = Vec::new();
            for pool in pools.all() {
                reaped.extend(pool.reconcile_stale().await?);
            }
            print_json(&reaped)
        }
        Command::Devices => print_json(&store.list_devices()?),
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fleetpoold=debug,fleetpool_pool=debug"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Upsert the devices listed in the config file into the store.
fn sync_devices(store: &StateStore, config: &DaemonConfig) -> anyhow::Result<()> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    for device in &config.devices {
        store.put_device(&device.to_device(now))?;
    }
    if !config.devices.is_empty() {
        info!(count = config.devices.len(), "devices synced from config");
    }
    Ok(())
}

fn build_pools(config: &DaemonConfig, store: StateStore) -> anyhow::Result<Pools> {
    let pool_config = config.pool_config()?;
    let executor = Arc::new(SshExecutor::new(
        config.ssh.binary.clone(),
        config.ssh.options.clone(),
        config.ssh_connect_timeout()?,
    ));
    let orchestrator = Arc::new(DockerOrchestrator::new(
        executor.clone(),
        config.docker.project_dir.clone(),
        config.deploy_timeout()?,
        pool_config.command_timeout,
    ));

    let ctx = PoolContext::new(
        store.clone(),
        executor,
        orchestrator,
        Arc::new(StoreVault::new(store.clone())),
        Arc::new(StoreDeviceDirectory::new(store)),
    )
    .with_catalog(config.catalog()?)
    .with_config(pool_config);

    Ok(Pools {
        database: ResourcePoolManager::database(ctx.clone()),
        cache: ResourcePoolManager::cache(ctx),
    })
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
