//! The shared store port. The queue, cluster and broker components only
//! talk to the data plane through this trait; backends live in
//! `taskmesh-store`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use taskmesh_errors::TaskMeshResult;

/// One message received from a store pub/sub subscription.
#[derive(Debug, Clone)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: String,
}

/// Primitive operations every backing store must provide.
///
/// `zpopmax` is the only cross-node mutual-exclusion primitive in the
/// system: it must remove and return the highest-scored member atomically
/// even under concurrent callers from multiple nodes. `hdel` must report
/// whether the key was present so callers can use it as a claim fence.
#[async_trait]
pub trait TaskStore: Send + Sync {
    // Priority collection

    /// Insert `member` with `score`, replacing the score if it exists.
    async fn zadd(&self, set: &str, score: f64, member: &str) -> TaskMeshResult<()>;

    /// Atomically remove and return the highest-scored member.
    async fn zpopmax(&self, set: &str) -> TaskMeshResult<Option<(String, f64)>>;

    async fn zcard(&self, set: &str) -> TaskMeshResult<u64>;

    // Keyed hash collections

    async fn hset(&self, collection: &str, key: &str, value: &str) -> TaskMeshResult<()>;

    async fn hget(&self, collection: &str, key: &str) -> TaskMeshResult<Option<String>>;

    async fn hgetall(&self, collection: &str) -> TaskMeshResult<HashMap<String, String>>;

    /// Remove a key. Returns whether the key existed, so exactly one of
    /// several racing callers observes `true`.
    async fn hdel(&self, collection: &str, key: &str) -> TaskMeshResult<bool>;

    // Key/value with optional expiry

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaskMeshResult<()>;

    async fn get(&self, key: &str) -> TaskMeshResult<Option<String>>;

    async fn delete(&self, key: &str) -> TaskMeshResult<()>;

    // Pub/sub

    async fn publish(&self, topic: &str, payload: &str) -> TaskMeshResult<()>;

    /// Subscribe to a topic. The receiver yields every payload published
    /// after the subscription was established; dropping it ends the
    /// subscription.
    async fn subscribe(&self, topic: &str)
        -> TaskMeshResult<mpsc::UnboundedReceiver<TopicMessage>>;

    async fn health_check(&self) -> TaskMeshResult<()>;
}
