//! Remote command execution over the system `ssh` client.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, trace};

use fleetpool_pool::engine::shell_quote;
use fleetpool_pool::{BoxFuture, CommandExecutor, ExecError};

/// Exit status `ssh` itself uses for connection and authentication errors.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Runs commands through `ssh` in batch mode (key auth only, never a
/// password prompt). The remote side always runs them under `sh -c`.
pub struct SshExecutor {
    binary: String,
    options: Vec<String>,
    connect_timeout: Duration,
}

impl SshExecutor {
    pub fn new(binary: impl Into<String>, options: Vec<String>, connect_timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            options,
            connect_timeout,
        }
    }

    fn args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ];
        args.extend(self.options.iter().cloned());
        args.push(host.to_string());
        args.push(format!("sh -c {}", shell_quote(command)));
        args
    }
}

impl CommandExecutor for SshExecutor {
    fn execute<'a>(
        &'a self,
        host: &'a str,
        command: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<String, ExecError>> {
        Box::pin(async move {
            trace!(%host, %command, "ssh exec");
            let child = Command::new(&self.binary)
                .args(self.args(host, command))
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| ExecError::Transport(format!("spawning {}: {e}", self.binary)))?;

            let output = tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| ExecError::Timeout(timeout))?
                .map_err(|e| ExecError::Transport(e.to_string()))?;

            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));

            match output.status.code() {
                Some(0) => Ok(combined),
                Some(SSH_TRANSPORT_FAILURE) => Err(ExecError::Transport(combined.trim().to_string())),
                Some(status) => {
                    debug!(%host, status, "remote command failed");
                    Err(ExecError::Failed {
                        status,
                        output: combined.trim().to_string(),
                    })
                }
                None => Err(ExecError::Transport("ssh terminated by signal".to_string())),
            }
        })
    }
}
