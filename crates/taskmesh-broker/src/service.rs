use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskmesh_config::BrokerConfig;
use taskmesh_domain::entities::{BrokerMessage, MessageFilter};
use taskmesh_domain::events::topics;
use taskmesh_domain::ports::TaskStore;
use taskmesh_errors::{TaskMeshError, TaskMeshResult};

pub type SubscriptionId = String;

/// Rolling counters over everything this broker has published.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BrokerStats {
    pub total_messages: u64,
    pub messages_by_type: HashMap<String, u64>,
    pub average_latency_ms: f64,
}

impl BrokerStats {
    /// Incremental running average, no latency history kept.
    fn record(&mut self, message_type: &str, elapsed_ms: f64) {
        self.total_messages += 1;
        *self
            .messages_by_type
            .entry(message_type.to_string())
            .or_insert(0) += 1;
        self.average_latency_ms +=
            (elapsed_ms - self.average_latency_ms) / self.total_messages as f64;
    }
}

struct LocalSubscription {
    filter: MessageFilter,
    recipient_id: Option<String>,
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

/// Validated pub/sub router on top of the shared store.
///
/// Local subscriptions are served in-process on publish; the store topics
/// carry the same messages to the other nodes, whose listeners re-dispatch
/// them into their own subscriptions.
pub struct MessageBroker {
    node_id: String,
    store: Arc<dyn TaskStore>,
    config: BrokerConfig,
    subscriptions: Arc<RwLock<HashMap<SubscriptionId, LocalSubscription>>>,
    stats: Arc<RwLock<BrokerStats>>,
    listener_shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
}

impl MessageBroker {
    pub fn new(store: Arc<dyn TaskStore>, config: BrokerConfig, node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            config,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            stats: Arc::new(RwLock::new(BrokerStats::default())),
            listener_shutdown_tx: Arc::new(RwLock::new(None)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Validate, persist, hand to the store transport and deliver to local
    /// subscriptions. The origin node is stamped here so listeners on other
    /// nodes can tell remote messages from their own.
    pub async fn publish(&self, mut message: BrokerMessage) -> TaskMeshResult<()> {
        let started = Instant::now();

        // Exactly one of broadcast or a recipient id selects the mode.
        if message.recipient.broadcast == message.recipient.id.is_some() {
            return Err(TaskMeshError::validation(
                "message must either broadcast or name exactly one recipient id",
            ));
        }
        if message.sender.id.trim().is_empty() {
            return Err(TaskMeshError::validation(
                "message sender id must not be empty",
            ));
        }

        message.metadata.origin_node = Some(self.node_id.clone());
        let serialized = serde_json::to_string(&message)?;

        if self.config.persist_messages {
            self.persist(&message, &serialized).await?;
        }

        let topic = match &message.recipient.id {
            Some(recipient_id) => topics::broker_direct(recipient_id),
            None => topics::BROKER_BROADCAST.to_string(),
        };
        self.store.publish(&topic, &serialized).await?;

        self.dispatch_local(&message).await;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let mut stats = self.stats.write().await;
        stats.record(message.message_type.as_str(), elapsed_ms);
        debug!(
            message_id = %message.id,
            message_type = message.message_type.as_str(),
            "message published"
        );
        Ok(())
    }

    /// Register a local subscription. Dropping the receiver is enough to
    /// end it; `unsubscribe` merely makes the removal eager.
    pub async fn subscribe(
        &self,
        filter: MessageFilter,
        recipient_id: Option<String>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<BrokerMessage>) {
        let id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut subscriptions = self.subscriptions.write().await;
        subscriptions.insert(
            id.clone(),
            LocalSubscription {
                filter,
                recipient_id,
                sender,
            },
        );
        debug!(subscription_id = %id, "subscription registered");
        (id, receiver)
    }

    /// Idempotent removal.
    pub async fn unsubscribe(&self, id: &str) {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.remove(id).is_some() {
            debug!(subscription_id = %id, "subscription removed");
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn get_stats(&self) -> BrokerStats {
        self.stats.read().await.clone()
    }

    /// Start the remote listener: broadcast topic plus this node's direct
    /// topic, re-dispatching messages from other nodes into local
    /// subscriptions. Idempotent.
    pub async fn start(&self) -> TaskMeshResult<()> {
        let mut tx_guard = self.listener_shutdown_tx.write().await;
        if tx_guard.is_some() {
            debug!(node_id = %self.node_id, "broker listener already running");
            return Ok(());
        }

        let mut broadcast_rx = self.store.subscribe(topics::BROKER_BROADCAST).await?;
        let direct_topic = topics::broker_direct(&self.node_id);
        let mut direct_rx = self.store.subscribe(&direct_topic).await?;

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *tx_guard = Some(shutdown_tx);
        drop(tx_guard);

        let broker = self.clone();
        tokio::spawn(async move {
            info!(node_id = %broker.node_id, "broker listener started");
            loop {
                tokio::select! {
                    maybe_message = broadcast_rx.recv() => match maybe_message {
                        Some(message) => broker.dispatch_remote(&message.payload).await,
                        None => {
                            warn!("broadcast subscription closed");
                            break;
                        }
                    },
                    maybe_message = direct_rx.recv() => match maybe_message {
                        Some(message) => broker.dispatch_remote(&message.payload).await,
                        None => {
                            warn!("direct subscription closed");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("broker listener stopping");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn stop(&self) {
        let mut tx_guard = self.listener_shutdown_tx.write().await;
        if let Some(shutdown_tx) = tx_guard.take() {
            let _ = shutdown_tx.send(());
        }
    }

    async fn persist(&self, message: &BrokerMessage, serialized: &str) -> TaskMeshResult<()> {
        let key = if message.is_broadcast() {
            format!("taskmesh:broker:broadcast:{}", message.id)
        } else {
            format!("taskmesh:broker:message:{}", message.id)
        };
        let ttl_seconds = message
            .metadata
            .ttl_seconds
            .unwrap_or(self.config.default_ttl_seconds);
        let ttl = (ttl_seconds > 0).then(|| Duration::from_secs(ttl_seconds));
        self.store.put(&key, serialized, ttl).await
    }

    /// Deliver to every local subscription the message addresses. Broadcast
    /// ignores recipient scoping; direct delivery requires the subscription
    /// to be registered for that recipient id. Subscriptions whose receiver
    /// is gone are pruned.
    async fn dispatch_local(&self, message: &BrokerMessage) {
        let mut stale = Vec::new();
        {
            let subscriptions = self.subscriptions.read().await;
            for (id, subscription) in subscriptions.iter() {
                if !message.recipient.broadcast
                    && subscription.recipient_id.as_deref() != message.recipient.id.as_deref()
                {
                    continue;
                }
                if !subscription.filter.matches(message) {
                    continue;
                }
                if subscription.sender.send(message.clone()).is_err() {
                    stale.push(id.clone());
                }
            }
        }
        if !stale.is_empty() {
            let mut subscriptions = self.subscriptions.write().await;
            for id in stale {
                subscriptions.remove(&id);
            }
        }
    }

    /// Re-dispatch a message arriving over the store transport. Messages
    /// this broker published are skipped (delivered locally already), and
    /// remote deliveries never count into the publish stats.
    async fn dispatch_remote(&self, payload: &str) {
        let message = match serde_json::from_str::<BrokerMessage>(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!("ignoring unreadable broker message: {}", e);
                return;
            }
        };
        if message.metadata.origin_node.as_deref() == Some(self.node_id.as_str()) {
            return;
        }
        self.dispatch_local(&message).await;
    }
}

impl Clone for MessageBroker {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            stats: Arc::clone(&self.stats),
            listener_shutdown_tx: Arc::clone(&self.listener_shutdown_tx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskmesh_domain::entities::{MessageRecipient, MessageType};
    use taskmesh_store::MemoryTaskStore;
    use taskmesh_testing_utils::{broadcast_message, direct_message, BrokerMessageBuilder};

    fn broker_on(store: Arc<MemoryTaskStore>, node_id: &str) -> MessageBroker {
        MessageBroker::new(store, BrokerConfig::default(), node_id)
    }

    #[tokio::test]
    async fn broadcast_reaches_every_matching_subscription() {
        let store = Arc::new(MemoryTaskStore::new());
        let broker = broker_on(store, "node-a");

        let (_any, mut any_rx) = broker.subscribe(MessageFilter::any(), None).await;
        let (_typed, mut typed_rx) = broker
            .subscribe(
                MessageFilter::for_types(vec![MessageType::StatusUpdate]),
                Some("someone-else".to_string()),
            )
            .await;
        let (_other, mut other_rx) = broker
            .subscribe(MessageFilter::for_types(vec![MessageType::TaskFailed]), None)
            .await;

        broker
            .publish(broadcast_message(MessageType::StatusUpdate, "node-a"))
            .await
            .unwrap();

        let delivered = any_rx.try_recv().unwrap();
        assert_eq!(delivered.message_type, MessageType::StatusUpdate);
        // Broadcast ignores recipient scoping.
        assert!(typed_rx.try_recv().is_ok());
        // A filter matching neither type never fires.
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn direct_delivery_requires_recipient_and_filter() {
        let store = Arc::new(MemoryTaskStore::new());
        let broker = broker_on(store, "node-a");

        let (_b, mut b_rx) = broker
            .subscribe(MessageFilter::any(), Some("svc-b".to_string()))
            .await;
        let (_c, mut c_rx) = broker
            .subscribe(MessageFilter::any(), Some("svc-c".to_string()))
            .await;
        let (_open, mut open_rx) = broker.subscribe(MessageFilter::any(), None).await;
        let (_picky, mut picky_rx) = broker
            .subscribe(
                MessageFilter::for_types(vec![MessageType::TaskFailed]),
                Some("svc-b".to_string()),
            )
            .await;

        broker
            .publish(direct_message(MessageType::Notification, "node-a", "svc-b"))
            .await
            .unwrap();

        assert!(b_rx.try_recv().is_ok());
        assert!(c_rx.try_recv().is_err());
        assert!(open_rx.try_recv().is_err());
        assert!(picky_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_rejects_invalid_envelopes() {
        let store = Arc::new(MemoryTaskStore::new());
        let broker = broker_on(store, "node-a");

        let mut both = BrokerMessageBuilder::new(MessageType::Notification)
            .from("node-a", "worker")
            .broadcast()
            .build();
        both.recipient.id = Some("svc-b".to_string());
        assert!(matches!(
            broker.publish(both).await.unwrap_err(),
            TaskMeshError::Validation(_)
        ));

        let mut neither = BrokerMessageBuilder::new(MessageType::Notification)
            .from("node-a", "worker")
            .build();
        neither.recipient = MessageRecipient::default();
        assert!(matches!(
            broker.publish(neither).await.unwrap_err(),
            TaskMeshError::Validation(_)
        ));

        let unsigned = broadcast_message(MessageType::Notification, "  ");
        assert!(matches!(
            broker.publish(unsigned).await.unwrap_err(),
            TaskMeshError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn stats_track_counts_and_running_average() {
        let store = Arc::new(MemoryTaskStore::new());
        let broker = broker_on(store, "node-a");

        broker
            .publish(broadcast_message(MessageType::TaskCompleted, "node-a"))
            .await
            .unwrap();
        broker
            .publish(broadcast_message(MessageType::TaskCompleted, "node-a"))
            .await
            .unwrap();
        broker
            .publish(broadcast_message(MessageType::Notification, "node-a"))
            .await
            .unwrap();

        let stats = broker.get_stats().await;
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.messages_by_type.get("TASK_COMPLETED"), Some(&2));
        assert_eq!(stats.messages_by_type.get("NOTIFICATION"), Some(&1));
        assert!(stats.average_latency_ms >= 0.0);

        // Rejected messages never count.
        let unsigned = broadcast_message(MessageType::Notification, "");
        assert!(broker.publish(unsigned).await.is_err());
        assert_eq!(broker.get_stats().await.total_messages, 3);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let store = Arc::new(MemoryTaskStore::new());
        let broker = broker_on(store, "node-a");

        let (id, mut rx) = broker.subscribe(MessageFilter::any(), None).await;
        broker
            .publish(broadcast_message(MessageType::StatusUpdate, "node-a"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_ok());

        broker.unsubscribe(&id).await;
        broker.unsubscribe(&id).await;
        broker
            .publish(broadcast_message(MessageType::StatusUpdate, "node-a"))
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn dropped_receivers_are_pruned_on_publish() {
        let store = Arc::new(MemoryTaskStore::new());
        let broker = broker_on(store, "node-a");

        let (_id, rx) = broker.subscribe(MessageFilter::any(), None).await;
        assert_eq!(broker.subscription_count().await, 1);
        drop(rx);

        broker
            .publish(broadcast_message(MessageType::StatusUpdate, "node-a"))
            .await
            .unwrap();
        assert_eq!(broker.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn persistence_honors_the_config_switch() {
        let store = Arc::new(MemoryTaskStore::new());

        let broker = broker_on(store.clone(), "node-a");
        let message = broadcast_message(MessageType::StatusUpdate, "node-a");
        let persisted_id = message.id.clone();
        broker.publish(message).await.unwrap();
        assert!(store
            .get(&format!("taskmesh:broker:broadcast:{persisted_id}"))
            .await
            .unwrap()
            .is_some());

        let silent = MessageBroker::new(
            store.clone(),
            BrokerConfig {
                persist_messages: false,
                ..BrokerConfig::default()
            },
            "node-a",
        );
        let message = broadcast_message(MessageType::StatusUpdate, "node-a");
        let skipped_id = message.id.clone();
        silent.publish(message).await.unwrap();
        assert!(store
            .get(&format!("taskmesh:broker:broadcast:{skipped_id}"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn listener_delivers_remote_messages_and_skips_its_own() {
        let store = Arc::new(MemoryTaskStore::new());
        let broker_a = broker_on(store.clone(), "node-a");
        let broker_b = broker_on(store.clone(), "node-b");
        broker_a.start().await.unwrap();
        broker_a.start().await.unwrap();

        let (_any, mut any_rx) = broker_a.subscribe(MessageFilter::any(), None).await;

        // a's own broadcast arrives exactly once, through local dispatch.
        broker_a
            .publish(broadcast_message(MessageType::StatusUpdate, "node-a"))
            .await
            .unwrap();
        assert!(any_rx.try_recv().is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(any_rx.try_recv().is_err());

        // b's broadcast travels through the store into a's subscriptions.
        broker_b
            .publish(broadcast_message(MessageType::StatusUpdate, "node-b"))
            .await
            .unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(1), any_rx.recv())
            .await
            .expect("remote broadcast should arrive")
            .unwrap();
        assert_eq!(delivered.sender.id, "node-b");

        // Direct traffic lands only in subscriptions scoped to this node.
        let (_scoped, mut scoped_rx) = broker_a
            .subscribe(MessageFilter::any(), Some("node-a".to_string()))
            .await;
        broker_b
            .publish(direct_message(MessageType::Notification, "node-b", "node-a"))
            .await
            .unwrap();
        let delivered = tokio::time::timeout(Duration::from_secs(1), scoped_rx.recv())
            .await
            .expect("remote direct message should arrive")
            .unwrap();
        assert_eq!(delivered.recipient.id.as_deref(), Some("node-a"));

        broker_a.stop().await;
    }
}
