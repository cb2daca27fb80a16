use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use taskmesh_config::RedisConfig;
use taskmesh_domain::ports::{TaskStore, TopicMessage};
use taskmesh_errors::TaskMeshResult;

use super::connection::RedisConnection;

type SubscriberMap = Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<TopicMessage>>>>>;

/// Redis-backed store.
///
/// Sorted sets, hashes and keys map directly onto the Redis data types, so
/// ZPOPMAX supplies the cross-node pop atomicity and HDEL the claim fence.
/// Each subscribed topic gets one dedicated pub/sub connection whose
/// messages are fanned out to local subscribers; the connection is dropped
/// when the last of them goes away.
pub struct RedisTaskStore {
    conn: RedisConnection,
    subscribers: SubscriberMap,
}

impl RedisTaskStore {
    pub async fn connect(config: &RedisConfig) -> TaskMeshResult<Self> {
        let conn = RedisConnection::connect(config).await?;
        Ok(Self {
            conn,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    async fn spawn_topic_listener(&self, topic: String) -> TaskMeshResult<()> {
        let mut pubsub = self.conn.pubsub().await?;
        pubsub.subscribe(&topic).await.map_err(|e| {
            taskmesh_errors::TaskMeshError::transport(format!(
                "failed to subscribe to '{topic}': {e}"
            ))
        })?;

        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(topic = %topic, "dropping non-UTF8 pub/sub payload: {}", e);
                        continue;
                    }
                };
                let message = TopicMessage {
                    topic: topic.clone(),
                    payload,
                };

                let mut subs = subscribers.write().await;
                let Some(senders) = subs.get_mut(&topic) else {
                    break;
                };
                senders.retain(|tx| tx.send(message.clone()).is_ok());
                if senders.is_empty() {
                    subs.remove(&topic);
                    break;
                }
            }
            debug!(topic = %topic, "topic listener stopped");
        });

        Ok(())
    }
}

#[async_trait]
impl TaskStore for RedisTaskStore {
    async fn zadd(&self, set: &str, score: f64, member: &str) -> TaskMeshResult<()> {
        let _: i64 = self
            .conn
            .execute(redis::cmd("ZADD").arg(set).arg(score).arg(member))
            .await?;
        Ok(())
    }

    async fn zpopmax(&self, set: &str) -> TaskMeshResult<Option<(String, f64)>> {
        let popped: Vec<(String, f64)> =
            self.conn.execute(redis::cmd("ZPOPMAX").arg(set)).await?;
        Ok(popped.into_iter().next())
    }

    async fn zcard(&self, set: &str) -> TaskMeshResult<u64> {
        self.conn.execute(redis::cmd("ZCARD").arg(set)).await
    }

    async fn hset(&self, collection: &str, key: &str, value: &str) -> TaskMeshResult<()> {
        let _: i64 = self
            .conn
            .execute(redis::cmd("HSET").arg(collection).arg(key).arg(value))
            .await?;
        Ok(())
    }

    async fn hget(&self, collection: &str, key: &str) -> TaskMeshResult<Option<String>> {
        self.conn
            .execute(redis::cmd("HGET").arg(collection).arg(key))
            .await
    }

    async fn hgetall(&self, collection: &str) -> TaskMeshResult<HashMap<String, String>> {
        self.conn
            .execute(redis::cmd("HGETALL").arg(collection))
            .await
    }

    async fn hdel(&self, collection: &str, key: &str) -> TaskMeshResult<bool> {
        let removed: i64 = self
            .conn
            .execute(redis::cmd("HDEL").arg(collection).arg(key))
            .await?;
        Ok(removed > 0)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaskMeshResult<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = self.conn.execute(&cmd).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> TaskMeshResult<Option<String>> {
        self.conn.execute(redis::cmd("GET").arg(key)).await
    }

    async fn delete(&self, key: &str) -> TaskMeshResult<()> {
        let _: i64 = self.conn.execute(redis::cmd("DEL").arg(key)).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> TaskMeshResult<()> {
        let _: i64 = self
            .conn
            .execute(redis::cmd("PUBLISH").arg(topic).arg(payload))
            .await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> TaskMeshResult<mpsc::UnboundedReceiver<TopicMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let needs_listener = {
            let mut subscribers = self.subscribers.write().await;
            match subscribers.get_mut(topic) {
                Some(senders) => {
                    senders.push(tx);
                    false
                }
                None => {
                    subscribers.insert(topic.to_string(), vec![tx]);
                    true
                }
            }
        };

        if needs_listener {
            if let Err(e) = self.spawn_topic_listener(topic.to_string()).await {
                self.subscribers.write().await.remove(topic);
                return Err(e);
            }
        }

        Ok(rx)
    }

    async fn health_check(&self) -> TaskMeshResult<()> {
        self.conn.ping().await
    }
}
