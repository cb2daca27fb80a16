//! Store backends for the `TaskStore` port.
//!
//! Two implementations ship today: an in-process [`MemoryTaskStore`] used
//! for embedded deployments and tests, and a [`RedisTaskStore`] that gives
//! a cluster of nodes a shared data plane. [`TaskStoreFactory`] picks one
//! from configuration.

pub mod factory;
pub mod memory;
pub mod redis_store;

pub use factory::TaskStoreFactory;
pub use memory::MemoryTaskStore;
pub use redis_store::{RedisConnection, RedisTaskStore};
