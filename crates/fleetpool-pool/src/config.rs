//! Tunables for the resource pool manager.

use std::time::Duration;

/// Pool manager configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound for a single remote command.
    pub command_timeout: Duration,
    /// How long a freshly deployed instance may take to report healthy.
    pub health_timeout: Duration,
    /// Candidate ports probed before giving up.
    pub port_probe_attempts: u32,
    /// Accept a candidate port when the live check itself fails (SSH down,
    /// no `ss`/`netstat`). When false the allocation fails instead.
    pub assume_port_free_on_check_error: bool,
    /// Age after which a non-running instance row is treated as abandoned.
    pub provisioning_stale_after: Duration,
    /// How long to wait for another caller's in-flight instance deployment.
    pub contention_wait: Duration,
    /// Poll interval while waiting on another caller's deployment.
    pub contention_poll: Duration,
    /// Prefix for container and volume names.
    pub container_prefix: String,
    /// Length of generated master and app passwords.
    pub password_length: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(30),
            health_timeout: Duration::from_secs(180),
            port_probe_attempts: 100,
            assume_port_free_on_check_error: true,
            provisioning_stale_after: Duration::from_secs(15 * 60),
            contention_wait: Duration::from_secs(60),
            contention_poll: Duration::from_millis(500),
            container_prefix: "fleetpool".to_string(),
            password_length: 32,
        }
    }
}

/// Parse a duration string like "5s", "500ms", "3m", "1h".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim().parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.trim().parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
