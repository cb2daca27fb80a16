use serde::{Deserialize, Serialize};

use taskmesh_errors::{TaskMeshError, TaskMeshResult};

use crate::validation::ConfigValidator;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            redis: None,
        }
    }
}

impl ConfigValidator for StoreConfig {
    fn validate(&self) -> TaskMeshResult<()> {
        if self.backend == StoreBackend::Redis {
            let redis = self.redis.as_ref().ok_or_else(|| {
                TaskMeshError::configuration(
                    "store.backend is \"redis\" but the [store.redis] section is missing",
                )
            })?;
            redis.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    pub connection_timeout_seconds: u64,
    pub max_retry_attempts: u32,
    pub retry_delay_seconds: u64,
}

impl RedisConfig {
    pub fn build_connection_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            connection_timeout_seconds: 5,
            max_retry_attempts: 3,
            retry_delay_seconds: 1,
        }
    }
}

impl ConfigValidator for RedisConfig {
    fn validate(&self) -> TaskMeshResult<()> {
        if self.host.is_empty() {
            return Err(TaskMeshError::configuration(
                "store.redis.host must not be empty",
            ));
        }
        if self.max_retry_attempts == 0 {
            return Err(TaskMeshError::configuration(
                "store.redis.max_retry_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Queue name, namespacing every key the queue writes.
    pub name: String,
    /// Attempt budget before a task is recorded as terminally failed.
    pub max_attempts: u32,
    /// Retention window for completed/failed records, purged by `cleanup`.
    pub retention_hours: u64,
    /// Processing lease duration. Expired leases are eligible for
    /// reclamation.
    pub lease_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_attempts: 3,
            retention_hours: 24,
            lease_seconds: 15,
        }
    }
}

impl ConfigValidator for QueueConfig {
    fn validate(&self) -> TaskMeshResult<()> {
        if self.name.is_empty() {
            return Err(TaskMeshError::configuration("queue.name must not be empty"));
        }
        if self.lease_seconds == 0 {
            return Err(TaskMeshError::configuration(
                "queue.lease_seconds must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Concurrency ceiling for in-flight tasks on this node.
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
    /// Built-in agents registered at startup ("echo", "shell").
    pub builtin_agents: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            poll_interval_ms: 500,
            builtin_agents: vec!["echo".to_string()],
        }
    }
}

impl ConfigValidator for WorkerConfig {
    fn validate(&self) -> TaskMeshResult<()> {
        if self.max_concurrent == 0 {
            return Err(TaskMeshError::configuration(
                "worker.max_concurrent must be at least 1",
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(TaskMeshError::configuration(
                "worker.poll_interval_ms must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    pub heartbeat_interval_seconds: u64,
    /// Records with heartbeats older than this are filtered out of the
    /// active worker view.
    pub liveness_threshold_seconds: u64,
    /// A node rebalances once its load exceeds this multiple of the mean.
    pub rebalance_threshold: f64,
    pub reclaim_interval_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_seconds: 5,
            liveness_threshold_seconds: 15,
            rebalance_threshold: 1.2,
            reclaim_interval_seconds: 30,
        }
    }
}

impl ConfigValidator for ClusterConfig {
    fn validate(&self) -> TaskMeshResult<()> {
        if self.heartbeat_interval_seconds == 0 {
            return Err(TaskMeshError::configuration(
                "cluster.heartbeat_interval_seconds must be at least 1",
            ));
        }
        if self.liveness_threshold_seconds <= self.heartbeat_interval_seconds {
            return Err(TaskMeshError::configuration(
                "cluster.liveness_threshold_seconds must exceed the heartbeat interval",
            ));
        }
        if self.rebalance_threshold < 1.0 {
            return Err(TaskMeshError::configuration(
                "cluster.rebalance_threshold must be at least 1.0",
            ));
        }
        if self.reclaim_interval_seconds == 0 {
            return Err(TaskMeshError::configuration(
                "cluster.reclaim_interval_seconds must be at least 1",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerConfig {
    /// Applied when a message carries no TTL of its own. Zero disables
    /// expiry.
    pub default_ttl_seconds: u64,
    /// Whether published messages are persisted to the store at all.
    pub persist_messages: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_ttl_seconds: 3600,
            persist_messages: true,
        }
    }
}

impl ConfigValidator for BrokerConfig {
    fn validate(&self) -> TaskMeshResult<()> {
        Ok(())
    }
}
