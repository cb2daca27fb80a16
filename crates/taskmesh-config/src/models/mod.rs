pub mod app_config;
pub mod components;

pub use app_config::AppConfig;
pub use components::{
    BrokerConfig, ClusterConfig, QueueConfig, RedisConfig, StoreBackend, StoreConfig, WorkerConfig,
};
