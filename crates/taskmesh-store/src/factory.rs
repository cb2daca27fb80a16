use std::sync::Arc;

use tracing::info;

use taskmesh_config::{StoreBackend, StoreConfig};
use taskmesh_domain::ports::TaskStore;
use taskmesh_errors::{TaskMeshError, TaskMeshResult};

use crate::memory::MemoryTaskStore;
use crate::redis_store::RedisTaskStore;

/// Builds the store backend selected in configuration.
pub struct TaskStoreFactory;

impl TaskStoreFactory {
    pub async fn create(config: &StoreConfig) -> TaskMeshResult<Arc<dyn TaskStore>> {
        match config.backend {
            StoreBackend::Memory => {
                info!("using in-memory store backend");
                Ok(Arc::new(MemoryTaskStore::new()))
            }
            StoreBackend::Redis => {
                let redis_config = config.redis.as_ref().ok_or_else(|| {
                    TaskMeshError::configuration(
                        "store backend is 'redis' but [store.redis] is missing",
                    )
                })?;
                info!(
                    host = %redis_config.host,
                    port = redis_config.port,
                    "using Redis store backend"
                );
                let store = RedisTaskStore::connect(redis_config).await?;
                Ok(Arc::new(store))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_is_created() {
        let config = StoreConfig::default();
        let store = TaskStoreFactory::create(&config).await.unwrap();
        store.health_check().await.unwrap();
    }

    #[tokio::test]
    async fn redis_backend_without_section_fails() {
        let config = StoreConfig {
            backend: StoreBackend::Redis,
            redis: None,
        };
        assert!(TaskStoreFactory::create(&config).await.is_err());
    }
}
