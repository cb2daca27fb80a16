use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use taskmesh_domain::ports::{TaskStore, TopicMessage};
use taskmesh_errors::TaskMeshResult;

/// Sorted-set state for one collection.
///
/// Members are kept twice: once by name for score lookups and once in a
/// `BTreeMap` ordered by `(encoded score, member)` so the pop-max victim is
/// always `last_key_value`. Ties on score therefore pop the
/// lexicographically greatest member, the same order Redis ZPOPMAX uses.
#[derive(Debug, Default)]
struct ZSet {
    by_score: BTreeMap<(u64, String), ()>,
    scores: HashMap<String, f64>,
}

/// Map an f64 score onto a u64 whose unsigned ordering matches the float
/// ordering, including negative scores.
fn score_key(score: f64) -> u64 {
    let bits = score.to_bits();
    if bits & (1 << 63) != 0 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

/// In-process store backend.
///
/// All state lives behind `RwLock`s in this process, so it is only suitable
/// for single-node deployments and tests. Pop-max atomicity holds because
/// every mutation takes the collection write lock. Expiring keys are pruned
/// lazily when read rather than by a background task, which keeps test
/// timing deterministic.
#[derive(Debug)]
pub struct MemoryTaskStore {
    zsets: Arc<RwLock<HashMap<String, ZSet>>>,
    hashes: Arc<RwLock<HashMap<String, HashMap<String, String>>>>,
    kv: Arc<RwLock<HashMap<String, (String, Option<Instant>)>>>,
    subscribers: Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<TopicMessage>>>>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            zsets: Arc::new(RwLock::new(HashMap::new())),
            hashes: Arc::new(RwLock::new(HashMap::new())),
            kv: Arc::new(RwLock::new(HashMap::new())),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for MemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn zadd(&self, set: &str, score: f64, member: &str) -> TaskMeshResult<()> {
        let mut zsets = self.zsets.write().await;
        let zset = zsets.entry(set.to_string()).or_default();

        if let Some(old_score) = zset.scores.insert(member.to_string(), score) {
            zset.by_score
                .remove(&(score_key(old_score), member.to_string()));
        }
        zset.by_score.insert((score_key(score), member.to_string()), ());
        Ok(())
    }

    async fn zpopmax(&self, set: &str) -> TaskMeshResult<Option<(String, f64)>> {
        let mut zsets = self.zsets.write().await;
        let Some(zset) = zsets.get_mut(set) else {
            return Ok(None);
        };

        let Some((key, _)) = zset.by_score.last_key_value() else {
            return Ok(None);
        };
        let key = key.clone();
        zset.by_score.remove(&key);

        let member = key.1;
        let score = zset.scores.remove(&member).unwrap_or_default();
        Ok(Some((member, score)))
    }

    async fn zcard(&self, set: &str) -> TaskMeshResult<u64> {
        let zsets = self.zsets.read().await;
        Ok(zsets.get(set).map_or(0, |z| z.scores.len() as u64))
    }

    async fn hset(&self, collection: &str, key: &str, value: &str) -> TaskMeshResult<()> {
        let mut hashes = self.hashes.write().await;
        hashes
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, collection: &str, key: &str) -> TaskMeshResult<Option<String>> {
        let hashes = self.hashes.read().await;
        Ok(hashes
            .get(collection)
            .and_then(|fields| fields.get(key))
            .cloned())
    }

    async fn hgetall(&self, collection: &str) -> TaskMeshResult<HashMap<String, String>> {
        let hashes = self.hashes.read().await;
        Ok(hashes.get(collection).cloned().unwrap_or_default())
    }

    async fn hdel(&self, collection: &str, key: &str) -> TaskMeshResult<bool> {
        let mut hashes = self.hashes.write().await;
        let Some(fields) = hashes.get_mut(collection) else {
            return Ok(false);
        };
        let existed = fields.remove(key).is_some();
        if fields.is_empty() {
            hashes.remove(collection);
        }
        Ok(existed)
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> TaskMeshResult<()> {
        let deadline = ttl.map(|ttl| Instant::now() + ttl);
        let mut kv = self.kv.write().await;
        kv.insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn get(&self, key: &str) -> TaskMeshResult<Option<String>> {
        {
            let kv = self.kv.read().await;
            match kv.get(key) {
                None => return Ok(None),
                Some((value, deadline)) => {
                    let expired = deadline.is_some_and(|d| Instant::now() >= d);
                    if !expired {
                        return Ok(Some(value.clone()));
                    }
                }
            }
        }

        // Expired entry, prune it under the write lock.
        let mut kv = self.kv.write().await;
        if let Some((_, deadline)) = kv.get(key) {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                kv.remove(key);
                debug!(key, "expired key pruned on read");
            }
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> TaskMeshResult<()> {
        let mut kv = self.kv.write().await;
        kv.remove(key);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> TaskMeshResult<()> {
        let message = TopicMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        };

        let mut subscribers = self.subscribers.write().await;
        if let Some(senders) = subscribers.get_mut(topic) {
            senders.retain(|tx| tx.send(message.clone()).is_ok());
            if senders.is_empty() {
                subscribers.remove(topic);
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> TaskMeshResult<mpsc::UnboundedReceiver<TopicMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.write().await;
        subscribers.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }

    async fn health_check(&self) -> TaskMeshResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zpopmax_returns_highest_score_first() {
        let store = MemoryTaskStore::new();
        store.zadd("q", 1.0, "low").await.unwrap();
        store.zadd("q", 5.0, "high").await.unwrap();
        store.zadd("q", 3.0, "mid").await.unwrap();

        assert_eq!(store.zpopmax("q").await.unwrap(), Some(("high".into(), 5.0)));
        assert_eq!(store.zpopmax("q").await.unwrap(), Some(("mid".into(), 3.0)));
        assert_eq!(store.zpopmax("q").await.unwrap(), Some(("low".into(), 1.0)));
        assert_eq!(store.zpopmax("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn zpopmax_orders_negative_scores() {
        let store = MemoryTaskStore::new();
        store.zadd("q", -10.0, "older").await.unwrap();
        store.zadd("q", -1.0, "newer").await.unwrap();

        assert_eq!(
            store.zpopmax("q").await.unwrap(),
            Some(("newer".into(), -1.0))
        );
    }

    #[tokio::test]
    async fn zpopmax_tie_pops_greatest_member() {
        let store = MemoryTaskStore::new();
        store.zadd("q", 2.0, "aaa").await.unwrap();
        store.zadd("q", 2.0, "zzz").await.unwrap();

        assert_eq!(store.zpopmax("q").await.unwrap(), Some(("zzz".into(), 2.0)));
    }

    #[tokio::test]
    async fn zadd_replaces_existing_score() {
        let store = MemoryTaskStore::new();
        store.zadd("q", 1.0, "member").await.unwrap();
        store.zadd("q", 9.0, "member").await.unwrap();

        assert_eq!(store.zcard("q").await.unwrap(), 1);
        assert_eq!(
            store.zpopmax("q").await.unwrap(),
            Some(("member".into(), 9.0))
        );
    }

    #[tokio::test]
    async fn concurrent_zpopmax_yields_each_member_once() {
        let store = Arc::new(MemoryTaskStore::new());
        for i in 0..100 {
            store.zadd("q", i as f64, &format!("task-{i}")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut popped = Vec::new();
                while let Some((member, _)) = store.zpopmax("q").await.unwrap() {
                    popped.push(member);
                }
                popped
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100);
        assert_eq!(store.zcard("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn hdel_reports_presence_exactly_once() {
        let store = MemoryTaskStore::new();
        store.hset("coll", "key", "value").await.unwrap();

        assert!(store.hdel("coll", "key").await.unwrap());
        assert!(!store.hdel("coll", "key").await.unwrap());
        assert!(!store.hdel("missing", "key").await.unwrap());
    }

    #[tokio::test]
    async fn hgetall_returns_all_fields() {
        let store = MemoryTaskStore::new();
        store.hset("coll", "a", "1").await.unwrap();
        store.hset("coll", "b", "2").await.unwrap();

        let fields = store.hgetall("coll").await.unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields.get("a").map(String::as_str), Some("1"));
        assert_eq!(fields.get("b").map(String::as_str), Some("2"));
        assert!(store.hgetall("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_with_ttl_expires() {
        let store = MemoryTaskStore::new();
        store
            .put("key", "value", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(store.get("key").await.unwrap(), Some("value".into()));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_without_ttl_persists() {
        let store = MemoryTaskStore::new();
        store.put("key", "value", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("key").await.unwrap(), Some("value".into()));

        store.delete("key").await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let store = MemoryTaskStore::new();
        let mut rx1 = store.subscribe("topic").await.unwrap();
        let mut rx2 = store.subscribe("topic").await.unwrap();

        store.publish("topic", "hello").await.unwrap();

        let msg1 = rx1.recv().await.unwrap();
        let msg2 = rx2.recv().await.unwrap();
        assert_eq!(msg1.payload, "hello");
        assert_eq!(msg1.topic, "topic");
        assert_eq!(msg2.payload, "hello");
    }

    #[tokio::test]
    async fn publish_skips_other_topics() {
        let store = MemoryTaskStore::new();
        let mut rx = store.subscribe("topic-a").await.unwrap();

        store.publish("topic-b", "ignored").await.unwrap();
        store.publish("topic-a", "wanted").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().payload, "wanted");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let store = MemoryTaskStore::new();
        let rx = store.subscribe("topic").await.unwrap();
        drop(rx);

        store.publish("topic", "nobody home").await.unwrap();
        assert!(store.subscribers.read().await.get("topic").is_none());
    }
}
