//! Host port allocation for new shared instances.
//!
//! A candidate port must be free twice over: not claimed by any instance
//! row for the device, and not bound by anything actually listening on the
//! device. The store can drift from reality (manual containers, crashed
//! cleanups), so the live check is what catches the second case.

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::context::PoolContext;
use crate::error::{PoolError, PoolResult};
use crate::locks::DeviceLease;

/// Lowest port handed out; privileged ports are never used.
pub const MIN_PORT: u16 = 1024;

/// Lists local addresses of listening TCP sockets, one per line.
pub(crate) const LISTEN_CHECK: &str =
    "(ss -Htln 2>/dev/null || netstat -tln 2>/dev/null) | awk '{print $4}'";

/// Finds unused TCP ports on a device.
pub struct PortAllocator {
    ctx: PoolContext,
}

impl PortAllocator {
    pub fn new(ctx: PoolContext) -> Self {
        Self { ctx }
    }

    /// Probe upward from `start_port` for a port that is neither claimed in
    /// the store nor listening on the device.
    ///
    /// The device's listening sockets are read once, on the first unclaimed
    /// candidate, and every later candidate is tested against that listing.
    /// The caller holds the device lease, and must keep holding it until the
    /// row claiming the returned port is committed.
    pub async fn find_available_port(&self, lease: &DeviceLease, start_port: u16) -> PoolResult<u16> {
        let device = lease.device_id();
        let attempts = self.ctx.config.port_probe_attempts;
        let claimed = self.ctx.store.claimed_ports(device)?;
        let start = u32::from(start_port.max(MIN_PORT));
        let mut live: Option<HashSet<u16>> = None;

        for candidate in (start..).take(attempts as usize) {
            let Ok(port) = u16::try_from(candidate) else {
                return Err(PoolError::NoPortsAvailable {
                    device: device.to_string(),
                });
            };
            if claimed.contains(&port) {
                continue;
            }
            if live.is_none() {
                live = Some(self.listening_ports(lease).await?);
            }
            if live.as_ref().is_some_and(|ports| ports.contains(&port)) {
                debug!(%device, port, "port in use on device, skipping");
                continue;
            }
            debug!(%device, port, "port allocated");
            return Ok(port);
        }

        Err(PoolError::AllocationExhausted {
            device: device.to_string(),
            attempts,
        })
    }

    /// Live listing from the device. Uses only the lease's resolved host.
    async fn listening_ports(&self, lease: &DeviceLease) -> PoolResult<HashSet<u16>> {
        match self
            .ctx
            .executor
            .execute(lease.ssh_host(), LISTEN_CHECK, self.ctx.config.command_timeout)
            .await
        {
            Ok(output) => Ok(parse_listening(&output)),
            Err(e) if self.ctx.config.assume_port_free_on_check_error => {
                warn!(
                    device = %lease.device_id(),
                    error = %e,
                    "live port check failed, assuming ports are free"
                );
                Ok(HashSet::new())
            }
            Err(e) => Err(PoolError::RemoteCommandFailed(format!(
                "port check on {}: {e}",
                lease.device_id()
            ))),
        }
    }
}

/// Ports of the local addresses in an `ss`/`netstat` listing
/// (`0.0.0.0:22`, `[::]:6379`, `*:80`).
fn parse_listening(output: &str) -> HashSet<u16> {
    output
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .filter_map(|(_, port)| port.parse().ok())
        .collect()
}
