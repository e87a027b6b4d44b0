//! fleetpool.toml configuration parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::Deserialize;

use fleetpool_pool::{EngineCatalog, EngineOverride, PoolConfig, parse_duration};
use fleetpool_state::Device;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub store: StoreConfig,
    pub ssh: SshConfig,
    pub docker: DockerConfig,
    pub pool: PoolSection,
    pub engines: HashMap<String, EngineOverride>,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/fleetpool/fleetpool.redb"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SshConfig {
    pub binary: String,
    pub connect_timeout: String,
    /// Extra arguments placed before the host, e.g. `["-i", "/etc/fleetpool/id_ed25519"]`.
    pub options: Vec<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout: "10s".to_string(),
            options: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerConfig {
    /// Directory on each device, relative to the SSH user's home, holding
    /// one compose project per shared instance.
    pub project_dir: String,
    /// Upper bound for `docker compose up` (includes image pulls).
    pub deploy_timeout: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            project_dir: ".fleetpool".to_string(),
            deploy_timeout: "10m".to_string(),
        }
    }
}

/// `[pool]` table. Durations are strings like `"30s"`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolSection {
    pub command_timeout: Option<String>,
    pub health_timeout: Option<String>,
    pub port_probe_attempts: Option<u32>,
    pub assume_port_free_on_check_error: Option<bool>,
    pub provisioning_stale_after: Option<String>,
    pub contention_wait: Option<String>,
    pub contention_poll: Option<String>,
    pub container_prefix: Option<String>,
    pub password_length: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    pub id: String,
    pub name: Option<String>,
    pub address: String,
    pub ssh_host: Option<String>,
}

impl DeviceConfig {
    pub fn to_device(&self, now: u64) -> Device {
        Device {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            address: self.address.clone(),
            ssh_host: self.ssh_host.clone().unwrap_or_else(|| self.address.clone()),
            updated_at: now,
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        for device in &config.devices {
            if device.id.trim().is_empty() {
                bail!("device id must not be empty");
            }
        }
        Ok(config)
    }

    /// Pool tunables with defaults filled in.
    pub fn pool_config(&self) -> anyhow::Result<PoolConfig> {
        let p = &self.pool;
        let mut config = PoolConfig::default();
        if let Some(d) = duration("pool.command_timeout", &p.command_timeout)? {
            config.command_timeout = d;
        }
        if let Some(d) = duration("pool.health_timeout", &p.health_timeout)? {
            config.health_timeout = d;
        }
        if let Some(d) = duration("pool.provisioning_stale_after", &p.provisioning_stale_after)? {
            config.provisioning_stale_after = d;
        }
        if let Some(d) = duration("pool.contention_wait", &p.contention_wait)? {
            config.contention_wait = d;
        }
        if let Some(d) = duration("pool.contention_poll", &p.contention_poll)? {
            config.contention_poll = d;
        }
        if let Some(n) = p.port_probe_attempts {
            config.port_probe_attempts = n;
        }
        if let Some(b) = p.assume_port_free_on_check_error {
            config.assume_port_free_on_check_error = b;
        }
        if let Some(prefix) = &p.container_prefix {
            config.container_prefix = prefix.clone();
        }
        if let Some(n) = p.password_length {
            fleetpool_pool::generate_secure_password(n).context("pool.password_length")?;
            config.password_length = n;
        }
        Ok(config)
    }

    pub fn catalog(&self) -> anyhow::Result<EngineCatalog> {
        Ok(EngineCatalog::with_overrides(&self.engines)?)
    }

    pub fn ssh_connect_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.ssh.connect_timeout)
            .with_context(|| format!("ssh.connect_timeout: bad duration {:?}", self.ssh.connect_timeout))
    }

    pub fn deploy_timeout(&self) -> anyhow::Result<Duration> {
        parse_duration(&self.docker.deploy_timeout)
            .with_context(|| format!("docker.deploy_timeout: bad duration {:?}", self.docker.deploy_timeout))
    }
}

fn duration(key: &str, value: &Option<String>) -> anyhow::Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(s) => parse_duration(s)
            .map(Some)
            .with_context(|| format!("{key}: bad duration {s:?}")),
    }
}
