use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskmesh_config::ClusterConfig;
use taskmesh_domain::entities::WorkerNode;
use taskmesh_domain::events::{topics, ClusterEvent, RedistributionEvent};
use taskmesh_domain::ports::{TaskStore, TopicMessage};
use taskmesh_errors::TaskMeshResult;
use taskmesh_queue::TaskQueue;
use taskmesh_worker::WorkerPool;

/// Registry hash shared by every node: field = node id, value = the
/// serialized [`WorkerNode`] record.
const REGISTRY_KEY: &str = "taskmesh:cluster:workers";

/// Node id of the form `{hostname}-{uuid8}`, used when none is configured.
pub fn generate_node_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "node".to_string());
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}

/// Bucket assignment for redistribution claims. Uses a hash with a fixed
/// algorithm so every node computes the same bucket for the same input.
fn claim_bucket(value: &str, buckets: u64) -> u64 {
    fxhash::hash64(value) % buckets
}

/// Per-node cluster membership driver.
///
/// Owns the background loops of one node: heartbeat writes into the shared
/// registry, the membership listener reacting to join/leave/redistribution
/// events, and the lease-reclamation sweep. Also carries the node's worker
/// pool through start and stop.
pub struct Coordinator {
    node_id: String,
    store: Arc<dyn TaskStore>,
    queue: TaskQueue,
    pool: WorkerPool,
    config: ClusterConfig,
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_running: Arc<RwLock<bool>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: TaskQueue,
        pool: WorkerPool,
        config: ClusterConfig,
        node_id: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            queue,
            pool,
            config,
            shutdown_tx: Arc::new(RwLock::new(None)),
            is_running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Register this node, spawn the background loops, start the pool and
    /// announce the join. Idempotent.
    pub async fn start(&self) -> TaskMeshResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            debug!(node_id = %self.node_id, "coordinator already running");
            return Ok(());
        }

        info!(node_id = %self.node_id, "starting coordinator");

        // Registered before announcing so peers that react to the join
        // event already see this node in the registry.
        self.write_registry_record().await?;

        // Subscriptions are set up before the announcement for the same
        // reason: no membership event may be missed.
        let joined_rx = self.store.subscribe(topics::WORKER_JOINED).await?;
        let left_rx = self.store.subscribe(topics::WORKER_LEFT).await?;
        let redistributed_rx = self.store.subscribe(topics::TASK_REDISTRIBUTED).await?;

        let (shutdown_tx, _) = broadcast::channel(1);
        {
            let mut tx_guard = self.shutdown_tx.write().await;
            *tx_guard = Some(shutdown_tx.clone());
        }

        let coordinator = self.clone();
        let heartbeat_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            coordinator.heartbeat_loop(heartbeat_shutdown).await;
        });

        let coordinator = self.clone();
        let membership_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            coordinator
                .membership_loop(joined_rx, left_rx, redistributed_rx, membership_shutdown)
                .await;
        });

        let coordinator = self.clone();
        let reclaim_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            coordinator.reclaim_loop(reclaim_shutdown).await;
        });

        self.pool.start().await?;
        self.publish_cluster_event(topics::WORKER_JOINED).await;

        *is_running = true;
        info!(node_id = %self.node_id, "coordinator started");
        Ok(())
    }

    /// Stop the loops and the pool, remove this node's registry record and
    /// announce the departure. Idempotent.
    pub async fn stop(&self) -> TaskMeshResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }

        info!(node_id = %self.node_id, "stopping coordinator");
        {
            let mut tx_guard = self.shutdown_tx.write().await;
            if let Some(shutdown_tx) = tx_guard.take() {
                let _ = shutdown_tx.send(());
            }
        }

        self.pool.stop().await?;
        self.pool.stop_control_listener().await;

        if let Err(e) = self.store.hdel(REGISTRY_KEY, &self.node_id).await {
            warn!("could not remove registry record: {}", e);
        }
        self.publish_cluster_event(topics::WORKER_LEFT).await;

        *is_running = false;
        info!(node_id = %self.node_id, "coordinator stopped");
        Ok(())
    }

    /// All registry records with a heartbeat younger than the liveness
    /// threshold. Stale records are filtered, never deleted.
    pub async fn get_active_workers(&self) -> TaskMeshResult<Vec<WorkerNode>> {
        let records = self.store.hgetall(REGISTRY_KEY).await?;
        let now = Utc::now();
        let threshold = chrono::Duration::seconds(self.config.liveness_threshold_seconds as i64);

        let mut workers = Vec::new();
        for (node_id, raw) in records {
            match serde_json::from_str::<WorkerNode>(&raw) {
                Ok(node) if node.is_live(now, threshold) => workers.push(node),
                Ok(_) => {}
                Err(e) => {
                    warn!(node_id = %node_id, "skipping unreadable registry record: {}", e);
                }
            }
        }
        Ok(workers)
    }

    /// Shed load when this node runs hot: with `mean` the average active
    /// task count over live workers, a node carrying more than
    /// `rebalance_threshold * mean` moves `floor(load - mean)` of its
    /// processing entries into the redistributed collection, announcing
    /// each move.
    pub async fn rebalance_tasks(&self) -> TaskMeshResult<u64> {
        let workers = self.get_active_workers().await?;
        if workers.is_empty() {
            return Ok(0);
        }

        let mean = workers
            .iter()
            .map(|worker| worker.stats.active_task_count as f64)
            .sum::<f64>()
            / workers.len() as f64;
        let Some(own) = workers.iter().find(|worker| worker.id == self.node_id) else {
            return Ok(0);
        };
        let self_load = own.stats.active_task_count as f64;

        if self_load <= mean * self.config.rebalance_threshold {
            debug!(self_load, mean, "load within threshold, no rebalancing");
            return Ok(0);
        }
        let to_move = (self_load - mean).floor() as u64;
        if to_move == 0 {
            return Ok(0);
        }

        info!(self_load, mean, to_move, "node overloaded, shedding tasks");
        let entries = self.queue.processing_entries().await?;
        let mut moved = 0;
        for entry in entries
            .into_iter()
            .filter(|entry| entry.owner_node == self.node_id)
        {
            if moved >= to_move {
                break;
            }
            let task_id = entry.task.id;
            match self.queue.redistribute(&task_id).await {
                Ok(Some(_)) => {
                    moved += 1;
                    self.publish_redistribution(&task_id, &self.node_id).await;
                }
                Ok(None) => {}
                Err(e) => warn!(task_id = %task_id, "could not redistribute: {}", e),
            }
        }
        Ok(moved)
    }

    async fn heartbeat_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval_seconds));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.write_registry_record().await {
                        warn!("heartbeat write failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("heartbeat loop stopping");
                    break;
                }
            }
        }
    }

    async fn membership_loop(
        &self,
        mut joined_rx: mpsc::UnboundedReceiver<TopicMessage>,
        mut left_rx: mpsc::UnboundedReceiver<TopicMessage>,
        mut redistributed_rx: mpsc::UnboundedReceiver<TopicMessage>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                maybe_message = joined_rx.recv() => match maybe_message {
                    Some(message) => self.on_worker_joined(&message.payload).await,
                    None => {
                        warn!("worker-joined subscription closed");
                        break;
                    }
                },
                maybe_message = left_rx.recv() => match maybe_message {
                    Some(message) => self.on_worker_left(&message.payload).await,
                    None => {
                        warn!("worker-left subscription closed");
                        break;
                    }
                },
                maybe_message = redistributed_rx.recv() => match maybe_message {
                    Some(message) => self.on_task_redistributed(&message.payload).await,
                    None => {
                        warn!("redistribution subscription closed");
                        break;
                    }
                },
                _ = shutdown_rx.recv() => {
                    info!("membership listener stopping");
                    break;
                }
            }
        }
    }

    async fn reclaim_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.reclaim_interval_seconds));
        loop {
            tokio::select! {
                _ = ticker.tick() => match self.queue.reclaim_expired().await {
                    Ok(0) => {}
                    Ok(reclaimed) => info!(reclaimed, "reclaimed expired task leases"),
                    Err(e) => warn!("lease reclamation sweep failed: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    info!("reclamation sweep stopping");
                    break;
                }
            }
        }
    }

    async fn on_worker_joined(&self, payload: &str) {
        let event = match serde_json::from_str::<ClusterEvent>(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("ignoring malformed worker-joined event: {}", e);
                return;
            }
        };
        if event.node_id == self.node_id {
            return;
        }

        info!(joined = %event.node_id, "worker joined, checking load balance");
        if let Err(e) = self.rebalance_tasks().await {
            warn!("rebalancing after join failed: {}", e);
        }
    }

    async fn on_worker_left(&self, payload: &str) {
        let event = match serde_json::from_str::<ClusterEvent>(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("ignoring malformed worker-left event: {}", e);
                return;
            }
        };
        if event.node_id == self.node_id {
            return;
        }

        info!(departed = %event.node_id, "worker left, rescuing its tasks");
        match self.redistribute_from(&event.node_id).await {
            Ok(0) => {}
            Ok(moved) => info!(moved, departed = %event.node_id, "orphaned tasks redistributed"),
            Err(e) => warn!(departed = %event.node_id, "could not rescue tasks: {}", e),
        }
    }

    async fn on_task_redistributed(&self, payload: &str) {
        let event = match serde_json::from_str::<RedistributionEvent>(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!("ignoring malformed redistribution event: {}", e);
                return;
            }
        };

        match self.try_claim(&event.task_id).await {
            Ok(true) => info!(task_id = %event.task_id, "claimed redistributed task"),
            Ok(false) => {}
            Err(e) => warn!(task_id = %event.task_id, "claim attempt failed: {}", e),
        }
    }

    /// Move every processing entry owned by `departed` into the
    /// redistributed collection, announcing each move.
    async fn redistribute_from(&self, departed: &str) -> TaskMeshResult<u64> {
        let entries = self.queue.processing_entries().await?;
        let mut moved = 0;
        for entry in entries
            .into_iter()
            .filter(|entry| entry.owner_node == departed)
        {
            let task_id = entry.task.id;
            match self.queue.redistribute(&task_id).await {
                Ok(Some(_)) => {
                    moved += 1;
                    self.publish_redistribution(&task_id, departed).await;
                }
                // Another survivor moved it first.
                Ok(None) => {}
                Err(e) => warn!(task_id = %task_id, "could not redistribute: {}", e),
            }
        }
        Ok(moved)
    }

    /// Claim a redistributed task if its bucket matches this node's. The
    /// removal inside `claim_redistributed` is the fence: among nodes that
    /// agree on the worker count exactly one observes the entry. Nodes
    /// disagreeing on the count may all skip; the reclamation sweep
    /// requeues such tasks once their lease expires.
    async fn try_claim(&self, task_id: &str) -> TaskMeshResult<bool> {
        let workers = self.get_active_workers().await?;
        let buckets = workers.len() as u64;
        if buckets == 0 {
            return Ok(false);
        }
        if claim_bucket(&self.node_id, buckets) != claim_bucket(task_id, buckets) {
            return Ok(false);
        }

        match self.queue.claim_redistributed(task_id).await? {
            Some(task) => {
                self.queue.requeue_existing(task).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn write_registry_record(&self) -> TaskMeshResult<()> {
        let mut node = WorkerNode::new(&self.node_id);
        node.stats = self.pool.get_stats().await;
        let serialized = serde_json::to_string(&node)?;
        self.store
            .hset(REGISTRY_KEY, &self.node_id, &serialized)
            .await?;
        debug!(
            node_id = %self.node_id,
            active = node.stats.active_task_count,
            "heartbeat recorded"
        );
        Ok(())
    }

    /// Best-effort announcement; a publish failure never undoes the state
    /// change it announces.
    async fn publish_cluster_event(&self, topic: &str) {
        let event = ClusterEvent::new(&self.node_id);
        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(topic, &payload).await {
                    warn!(topic = %topic, "could not publish cluster event: {}", e);
                }
            }
            Err(e) => warn!(topic = %topic, "could not serialize cluster event: {}", e),
        }
    }

    async fn publish_redistribution(&self, task_id: &str, from_node: &str) {
        let event = RedistributionEvent::new(task_id, from_node);
        match serde_json::to_string(&event) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(topics::TASK_REDISTRIBUTED, &payload).await {
                    warn!(task_id = %task_id, "could not publish redistribution event: {}", e);
                }
            }
            Err(e) => warn!(task_id = %task_id, "could not serialize redistribution event: {}", e),
        }
    }
}

impl Clone for Coordinator {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            store: Arc::clone(&self.store),
            queue: self.queue.clone(),
            pool: self.pool.clone(),
            config: self.config.clone(),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            is_running: Arc::clone(&self.is_running),
        }
    }
}
