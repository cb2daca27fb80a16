use std::path::Path;

use config::{Config as ConfigBuilder, ConfigBuilder as Builder, Environment, File, FileFormat};
use config::builder::DefaultState;
use serde::{Deserialize, Serialize};

use taskmesh_errors::{TaskMeshError, TaskMeshResult};

use super::components::{BrokerConfig, ClusterConfig, QueueConfig, StoreConfig, WorkerConfig};
use crate::validation::ConfigValidator;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Node identity. When unset, one is derived from the hostname at
    /// startup.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

impl AppConfig {
    /// Load configuration from defaults, an optional TOML file and
    /// `TASKMESH`-prefixed environment variables, in that order of
    /// precedence (later sources win). An explicitly given path must
    /// exist; the well-known paths are only tried when none is given.
    pub fn load(config_path: Option<&str>) -> TaskMeshResult<Self> {
        let mut builder = Self::set_defaults(ConfigBuilder::builder())?;

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(TaskMeshError::configuration(format!(
                    "configuration file does not exist: {path}"
                )));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = [
                "config/taskmesh.toml",
                "taskmesh.toml",
                "/etc/taskmesh/config.toml",
            ];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKMESH")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| TaskMeshError::configuration(format!("failed to build configuration: {e}")))?
            .try_deserialize()
            .map_err(|e| {
                TaskMeshError::configuration(format!("failed to deserialize configuration: {e}"))
            })?;

        config.validate()?;

        Ok(config)
    }

    fn set_defaults(builder: Builder<DefaultState>) -> TaskMeshResult<Builder<DefaultState>> {
        builder
            .set_default("store.backend", "memory")
            .and_then(|b| b.set_default("queue.name", "default"))
            .and_then(|b| b.set_default("queue.max_attempts", 3))
            .and_then(|b| b.set_default("queue.retention_hours", 24))
            .and_then(|b| b.set_default("queue.lease_seconds", 15))
            .and_then(|b| b.set_default("worker.max_concurrent", 4))
            .and_then(|b| b.set_default("worker.poll_interval_ms", 500))
            .and_then(|b| b.set_default("worker.builtin_agents", vec!["echo"]))
            .and_then(|b| b.set_default("cluster.heartbeat_interval_seconds", 5))
            .and_then(|b| b.set_default("cluster.liveness_threshold_seconds", 15))
            .and_then(|b| b.set_default("cluster.rebalance_threshold", 1.2))
            .and_then(|b| b.set_default("cluster.reclaim_interval_seconds", 30))
            .and_then(|b| b.set_default("broker.default_ttl_seconds", 3600))
            .and_then(|b| b.set_default("broker.persist_messages", true))
            .map_err(|e| TaskMeshError::configuration(format!("failed to set defaults: {e}")))
    }

    pub fn from_toml(toml_str: &str) -> TaskMeshResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| TaskMeshError::configuration(format!("failed to parse TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> TaskMeshResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TaskMeshError::configuration(format!("failed to serialize TOML: {e}")))
    }
}

impl ConfigValidator for AppConfig {
    fn validate(&self) -> TaskMeshResult<()> {
        if let Some(node_id) = &self.node_id {
            if node_id.is_empty() {
                return Err(TaskMeshError::configuration("node_id must not be empty"));
            }
        }
        self.store.validate()?;
        self.queue.validate()?;
        self.worker.validate()?;
        self.cluster.validate()?;
        self.broker.validate()?;
        Ok(())
    }
}
