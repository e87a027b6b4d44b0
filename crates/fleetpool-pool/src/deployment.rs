//! Container deployment spec handed to the orchestrator.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Everything the orchestrator needs to run one shared service container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentSpec {
    /// Container (and compose project) name.
    pub name: String,
    /// SSH host of the target device.
    pub host: String,
    /// Full image reference, e.g. `redis:7`.
    pub image: String,
    pub ports: Vec<PortMapping>,
    pub environment: BTreeMap<String, String>,
    /// Overrides the image's default command when non-empty.
    pub command: Vec<String>,
    pub healthcheck: HealthCheck,
    pub volumes: Vec<VolumeMount>,
    /// Container memory limit in MiB.
    pub memory_limit_mb: Option<u32>,
}

/// Host port → container port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Container health check, in compose terms.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheck {
    /// Compose `test` array, e.g. `["CMD-SHELL", "pg_isready"]`.
    pub test: Vec<String>,
    pub interval: String,
    pub timeout: String,
    pub retries: u32,
    pub start_period: String,
}

/// Named volume mounted into the container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeMount {
    pub name: String,
    pub target: String,
}

impl HealthCheck {
    /// A check with the defaults used for every shared service.
    pub fn new(test: Vec<String>) -> Self {
        Self {
            test,
            interval: "5s".to_string(),
            timeout: "3s".to_string(),
            retries: 10,
            start_period: "10s".to_string(),
        }
    }
}

impl DeploymentSpec {
    /// Render a compose document for this spec.
    ///
    /// Compose reads JSON as YAML, so the document is written as JSON.
    /// Every `$` in the environment is already escaped by the engine
    /// renderers where compose interpolation would otherwise apply.
    pub fn to_compose(&self) -> Value {
        let mut service = json!({
            "image": self.image,
            "container_name": self.name,
            "restart": "unless-stopped",
            "ports": self
                .ports
                .iter()
                .map(|p| format!("{}:{}", p.host, p.container))
                .collect::<Vec<_>>(),
            "environment": self.environment,
            "healthcheck": {
                "test": self.healthcheck.test,
                "interval": self.healthcheck.interval,
                "timeout": self.healthcheck.timeout,
                "retries": self.healthcheck.retries,
                "start_period": self.healthcheck.start_period,
            },
            "volumes": self
                .volumes
                .iter()
                .map(|v| format!("{}:{}", v.name, v.target))
                .collect::<Vec<_>>(),
        });
        if !self.command.is_empty() {
            service["command"] = json!(self.command);
        }
        if let Some(mb) = self.memory_limit_mb {
            service["mem_limit"] = json!(format!("{mb}m"));
        }

        let volumes: serde_json::Map<String, Value> = self
            .volumes
            .iter()
            .map(|v| (v.name.clone(), json!({})))
            .collect();

        let mut services = serde_json::Map::new();
        services.insert(self.name.clone(), service);

        json!({
            "name": self.name,
            "services": services,
            "volumes": volumes,
        })
    }
}
