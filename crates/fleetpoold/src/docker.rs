//! Docker Compose orchestration over the command executor.
//!
//! Each shared instance is its own compose project in
//! `{project_dir}/{name}/compose.json` on the device. Health is read from
//! `docker inspect`, polled with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use fleetpool_pool::engine::shell_quote;
use fleetpool_pool::{BoxFuture, CommandExecutor, DeploymentSpec, Orchestrator, OrchestratorError};

/// Go template printing the health status, or the plain state for
/// containers without a health check.
const HEALTH_FORMAT: &str =
    "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}";

pub struct DockerOrchestrator {
    executor: Arc<dyn CommandExecutor>,
    project_dir: String,
    deploy_timeout: Duration,
    command_timeout: Duration,
    poll_interval: Duration,
    max_poll_interval: Duration,
}

impl DockerOrchestrator {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        project_dir: impl Into<String>,
        deploy_timeout: Duration,
        command_timeout: Duration,
    ) -> Self {
        Self {
            executor,
            project_dir: project_dir.into(),
            deploy_timeout,
            command_timeout,
            poll_interval: Duration::from_secs(1),
            max_poll_interval: Duration::from_secs(10),
        }
    }

    /// Override the health polling backoff bounds.
    pub fn with_poll_intervals(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_interval = initial;
        self.max_poll_interval = max;
        self
    }

    fn project(&self, name: &str) -> String {
        format!("{}/{}", self.project_dir.trim_end_matches('/'), name)
    }

    fn compose_file(&self, name: &str) -> String {
        format!("{}/compose.json", self.project(name))
    }

    fn up_command(&self, spec: &DeploymentSpec) -> Result<String, OrchestratorError> {
        let document = serde_json::to_string_pretty(&spec.to_compose())
            .map_err(|e| OrchestratorError::Deploy(format!("rendering compose file: {e}")))?;
        let dir = shell_quote(&self.project(&spec.name));
        let file = shell_quote(&self.compose_file(&spec.name));
        Ok(format!(
            "mkdir -p {dir} && printf '%s\\n' {doc} > {file} && docker compose -f {file} up -d --remove-orphans",
            doc = shell_quote(&document),
        ))
    }

    fn down_command(&self, spec: &DeploymentSpec) -> String {
        let file = shell_quote(&self.compose_file(&spec.name));
        let mut cmd = format!(
            "if [ -f {file} ]; then docker compose -f {file} down -v --remove-orphans; \
             else docker rm -f -v {name}",
            name = shell_quote(&spec.name),
        );
        for volume in &spec.volumes {
            cmd.push_str(&format!("; docker volume rm -f {}", shell_quote(&volume.name)));
        }
        cmd.push_str(&format!("; fi; rm -rf {}", shell_quote(&self.project(&spec.name))));
        cmd
    }
}

impl Orchestrator for DockerOrchestrator {
    fn deploy<'a>(&'a self, spec: &'a DeploymentSpec) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            let command = self.up_command(spec)?;
            self.executor
                .execute(&spec.host, &command, self.deploy_timeout)
                .await
                .map_err(|e| OrchestratorError::Deploy(e.to_string()))?;
            info!(name = %spec.name, host = %spec.host, image = %spec.image, "compose project up");
            Ok(())
        })
    }

    fn wait_for_healthy<'a>(
        &'a self,
        name: &'a str,
        host: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            let command = format!(
                "docker inspect -f {} {}",
                shell_quote(HEALTH_FORMAT),
                shell_quote(name)
            );
            let deadline = Instant::now() + timeout;
            let mut backoff = self.poll_interval;

            loop {
                match self.executor.execute(host, &command, self.command_timeout).await {
                    Ok(output) => match output.trim() {
                        "healthy" => {
                            debug!(%name, %host, "container healthy");
                            return Ok(());
                        }
                        status @ ("unhealthy" | "exited" | "dead") => {
                            return Err(OrchestratorError::Unhealthy(format!("{name} is {status}")));
                        }
                        status => debug!(%name, %status, "waiting for container health"),
                    },
                    // The container may not exist yet right after `up`.
                    Err(e) => debug!(%name, error = %e, "health probe failed"),
                }

                let now = Instant::now();
                if now >= deadline {
                    return Err(OrchestratorError::HealthTimeout(timeout));
                }
                sleep(backoff.min(deadline - now)).await;
                backoff = (backoff * 2).min(self.max_poll_interval);
            }
        })
    }

    fn remove_with_cleanup<'a>(
        &'a self,
        spec: &'a DeploymentSpec,
    ) -> BoxFuture<'a, Result<(), OrchestratorError>> {
        Box::pin(async move {
            let command = self.down_command(spec);
            match self.executor.execute(&spec.host, &command, self.deploy_timeout).await {
                Ok(_) => {
                    info!(name = %spec.name, host = %spec.host, "compose project removed");
                    Ok(())
                }
                Err(e) => {
                    warn!(name = %spec.name, host = %spec.host, error = %e, "compose cleanup failed");
                    Err(OrchestratorError::Cleanup(e.to_string()))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use fleetpool_pool::ExecError;
    use fleetpool_pool::deployment::{HealthCheck, PortMapping, VolumeMount};

    /// Replies from a queue, then repeats the last reply.
    #[derive(Default)]
    struct Scripted {
        replies: Mutex<VecDeque<Result<String, String>>>,
        commands: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn with(replies: Vec<Result<&str, &str>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(
                    replies
                        .into_iter()
                        .map(|r| r.map(str::to_string).map_err(str::to_string))
                        .collect(),
                ),
                commands: Mutex::new(Vec::new()),
            })
        }
    }

    impl CommandExecutor for Scripted {
        fn execute<'a>(
            &'a self,
            _host: &'a str,
            command: &'a str,
            _timeout: Duration,
        ) -> BoxFuture<'a, Result<String, ExecError>> {
            Box::pin(async move {
                self.commands.lock().unwrap().push(command.to_string());
                let mut replies = self.replies.lock().unwrap();
                let reply = if replies.len() > 1 {
                    replies.pop_front()
                } else {
                    replies.front().cloned()
                };
                match reply.unwrap_or(Ok(String::new())) {
                    Ok(out) => Ok(out),
                    Err(out) => Err(ExecError::Failed { status: 1, output: out }),
                }
            })
        }
    }

    fn spec() -> DeploymentSpec {
        DeploymentSpec {
            name: "fleetpool-postgres".to_string(),
            host: "pi@10.0.0.5".to_string(),
            image: "postgres:16".to_string(),
            ports: vec![PortMapping { host: 5432, container: 5432 }],
            environment: Default::default(),
            command: vec![],
            healthcheck: HealthCheck::new(vec!["CMD-SHELL".into(), "pg_isready".into()]),
            volumes: vec![VolumeMount {
                name: "fleetpool-postgres-data".into(),
                target: "/var/lib/postgresql/data".into(),
            }],
            memory_limit_mb: None,
        }
    }

    fn orchestrator(exec: Arc<Scripted>) -> DockerOrchestrator {
        DockerOrchestrator::new(exec, ".fleetpool", Duration::from_secs(60), Duration::from_secs(5))
            .with_poll_intervals(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[tokio::test]
    async fn deploy_writes_compose_and_runs_up() {
        let exec = Scripted::with(vec![Ok("")]);
        orchestrator(exec.clone()).deploy(&spec()).await.unwrap();

        let commands = exec.commands.lock().unwrap();
        assert!(commands[0].starts_with("mkdir -p '.fleetpool/fleetpool-postgres'"));
        assert!(commands[0].contains("\"image\": \"postgres:16\""));
        assert!(commands[0].ends_with(
            "docker compose -f '.fleetpool/fleetpool-postgres/compose.json' up -d --remove-orphans"
        ));
    }

    #[tokio::test]
    async fn deploy_failure_maps_to_deploy_error() {
        let exec = Scripted::with(vec![Err("pull access denied")]);
        let err = orchestrator(exec).deploy(&spec()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Deploy(msg) if msg.contains("pull access denied")));
    }

    #[tokio::test]
    async fn waits_through_starting_until_healthy() {
        let exec = Scripted::with(vec![Err("No such object"), Ok("starting\n"), Ok("healthy\n")]);
        orchestrator(exec.clone())
            .wait_for_healthy("fleetpool-postgres", "pi@10.0.0.5", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(exec.commands.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unhealthy_fails_fast() {
        let exec = Scripted::with(vec![Ok("unhealthy")]);
        let err = orchestrator(exec)
            .wait_for_healthy("c", "h", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Unhealthy(_)));
    }

    #[tokio::test]
    async fn gives_up_at_deadline() {
        let exec = Scripted::with(vec![Ok("starting")]);
        let err = orchestrator(exec)
            .wait_for_healthy("c", "h", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::HealthTimeout(_)));
    }

    #[tokio::test]
    async fn cleanup_downs_project_and_removes_directory() {
        let exec = Scripted::with(vec![Ok("")]);
        orchestrator(exec.clone()).remove_with_cleanup(&spec()).await.unwrap();

        let commands = exec.commands.lock().unwrap();
        assert!(commands[0].contains("down -v --remove-orphans"));
        assert!(commands[0].contains("docker volume rm -f 'fleetpool-postgres-data'"));
        assert!(commands[0].ends_with("rm -rf '.fleetpool/fleetpool-postgres'"));
    }
}
