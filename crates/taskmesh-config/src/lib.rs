//! Typed configuration for a TaskMesh node.
//!
//! Settings are layered: built-in defaults, then an optional TOML file,
//! then environment variables prefixed `TASKMESH`. Every section validates
//! itself before the application starts.

pub mod models;
pub mod validation;

pub use models::{
    AppConfig, BrokerConfig, ClusterConfig, QueueConfig, RedisConfig, StoreBackend, StoreConfig,
    WorkerConfig,
};
pub use validation::ConfigValidator;
