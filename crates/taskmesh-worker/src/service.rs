use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use taskmesh_config::WorkerConfig;
use taskmesh_domain::agent::{Agent, AgentOutcome, AgentStatus};
use taskmesh_domain::entities::{ControlCommand, Task, WorkerStats};
use taskmesh_domain::events::topics;
use taskmesh_domain::ports::TaskStore;
use taskmesh_errors::{TaskMeshError, TaskMeshResult};
use taskmesh_queue::TaskQueue;

/// Typed notifications emitted on the pool's local event channel.
/// Subscribers that fall behind simply miss events; nothing in the pool
/// depends on them being observed.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Started,
    Stopped,
    AgentRegistered { agent_id: String },
    AgentUnregistered { agent_id: String },
    TaskDispatched { task_id: String },
    TaskSettled { task_id: String, success: bool },
}

/// Runtime-adjustable pool settings, changed by `UPDATE_CONFIG` control
/// commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_concurrent: usize,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Default)]
struct ExecutionCounters {
    completed: u64,
    failed: u64,
    average_processing_ms: f64,
}

impl ExecutionCounters {
    /// Incremental running average over every settled agent execution.
    fn record(&mut self, success: bool, elapsed_ms: f64) {
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        let settled = (self.completed + self.failed) as f64;
        self.average_processing_ms += (elapsed_ms - self.average_processing_ms) / settled;
    }
}

pub struct WorkerPoolBuilder {
    node_id: String,
    queue: TaskQueue,
    store: Arc<dyn TaskStore>,
    config: WorkerConfig,
    agents: Vec<Arc<dyn Agent>>,
}

impl WorkerPoolBuilder {
    pub fn new(node_id: impl Into<String>, queue: TaskQueue, store: Arc<dyn TaskStore>) -> Self {
        Self {
            node_id: node_id.into(),
            queue,
            store,
            config: WorkerConfig::default(),
            agents: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.config.max_concurrent = max_concurrent;
        self
    }

    pub fn poll_interval_ms(mut self, poll_interval_ms: u64) -> Self {
        self.config.poll_interval_ms = poll_interval_ms;
        self
    }

    pub fn register_agent(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    pub fn build(self) -> WorkerPool {
        let (events_tx, _) = broadcast::channel(64);
        WorkerPool {
            node_id: self.node_id,
            queue: self.queue,
            store: self.store,
            agents: Arc::new(RwLock::new(self.agents)),
            active: Arc::new(RwLock::new(HashSet::new())),
            counters: Arc::new(RwLock::new(ExecutionCounters::default())),
            settings: Arc::new(RwLock::new(PoolSettings {
                max_concurrent: self.config.max_concurrent,
                poll_interval_ms: self.config.poll_interval_ms,
            })),
            events_tx,
            shutdown_tx: Arc::new(RwLock::new(None)),
            control_shutdown_tx: Arc::new(RwLock::new(None)),
            is_running: Arc::new(RwLock::new(false)),
        }
    }
}

/// Bounded pool of concurrent task executions on one node.
///
/// The poll loop and the control listener have independent lifecycles: the
/// control listener stays subscribed while the pool itself is stopped, so a
/// remote `START_WORKER` can revive a stopped pool.
pub struct WorkerPool {
    node_id: String,
    queue: TaskQueue,
    store: Arc<dyn TaskStore>,
    /// Registration order is dispatch order: the first idle agent whose
    /// type matches wins.
    agents: Arc<RwLock<Vec<Arc<dyn Agent>>>>,
    /// Ids of tasks currently dispatched on this node.
    active: Arc<RwLock<HashSet<String>>>,
    counters: Arc<RwLock<ExecutionCounters>>,
    settings: Arc<RwLock<PoolSettings>>,
    events_tx: broadcast::Sender<PoolEvent>,
    shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    control_shutdown_tx: Arc<RwLock<Option<broadcast::Sender<()>>>>,
    is_running: Arc<RwLock<bool>>,
}

impl WorkerPool {
    pub fn builder(
        node_id: impl Into<String>,
        queue: TaskQueue,
        store: Arc<dyn TaskStore>,
    ) -> WorkerPoolBuilder {
        WorkerPoolBuilder::new(node_id, queue, store)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Subscribe to pool lifecycle events.
    pub fn events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    pub async fn register_agent(&self, agent: Arc<dyn Agent>) {
        let agent_id = agent.id().to_string();
        let mut agents = self.agents.write().await;
        agents.retain(|existing| existing.id() != agent_id);
        agents.push(agent);
        info!(agent_id = %agent_id, "agent registered");
        let _ = self.events_tx.send(PoolEvent::AgentRegistered { agent_id });
    }

    /// Remove an agent by id. Idempotent; returns whether one was removed.
    pub async fn unregister_agent(&self, agent_id: &str) -> bool {
        let mut agents = self.agents.write().await;
        let before = agents.len();
        agents.retain(|agent| agent.id() != agent_id);
        let removed = agents.len() < before;
        if removed {
            info!(agent_id = %agent_id, "agent unregistered");
            let _ = self.events_tx.send(PoolEvent::AgentUnregistered {
                agent_id: agent_id.to_string(),
            });
        }
        removed
    }

    pub async fn registered_agent_ids(&self) -> Vec<String> {
        let agents = self.agents.read().await;
        agents.iter().map(|agent| agent.id().to_string()).collect()
    }

    /// Start the poll loop. Idempotent: a running pool stays running.
    pub async fn start(&self) -> TaskMeshResult<()> {
        let mut is_running = self.is_running.write().await;
        if *is_running {
            debug!(node_id = %self.node_id, "worker pool already running");
            return Ok(());
        }

        info!(node_id = %self.node_id, "starting worker pool");
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        {
            let mut tx_guard = self.shutdown_tx.write().await;
            *tx_guard = Some(shutdown_tx);
        }

        let pool = self.clone();
        tokio::spawn(async move {
            pool.poll_loop(shutdown_rx).await;
        });

        // The listener outlives stop() so a remote START_WORKER can still
        // reach a stopped pool; on restart this is a no-op.
        self.start_control_listener().await?;

        *is_running = true;
        let _ = self.events_tx.send(PoolEvent::Started);
        Ok(())
    }

    /// Stop the poll loop and wait (bounded) for in-flight tasks to settle.
    /// Running agent calls are never cancelled by a stop.
    pub async fn stop(&self) -> TaskMeshResult<()> {
        let mut is_running = self.is_running.write().await;
        if !*is_running {
            return Ok(());
        }

        info!(node_id = %self.node_id, "stopping worker pool");
        {
            let mut tx_guard = self.shutdown_tx.write().await;
            if let Some(shutdown_tx) = tx_guard.take() {
                let _ = shutdown_tx.send(());
            }
        }

        // Up to 30s for in-flight dispatches to drain.
        const MAX_DRAIN_ATTEMPTS: u32 = 300;
        let mut attempts = 0;
        while attempts < MAX_DRAIN_ATTEMPTS {
            let active = self.active.read().await.len();
            if active == 0 {
                break;
            }
            if attempts % 10 == 0 {
                info!(active, "waiting for in-flight tasks to settle");
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            attempts += 1;
        }

        *is_running = false;
        let _ = self.events_tx.send(PoolEvent::Stopped);
        info!(node_id = %self.node_id, "worker pool stopped");
        Ok(())
    }

    /// Subscribe to this node's control topic and apply commands until the
    /// listener is stopped. Outlives pool start/stop cycles so a stopped
    /// pool can be restarted remotely.
    pub async fn start_control_listener(&self) -> TaskMeshResult<()> {
        let mut tx_guard = self.control_shutdown_tx.write().await;
        if tx_guard.is_some() {
            debug!(node_id = %self.node_id, "control listener already running");
            return Ok(());
        }

        let topic = topics::worker_control(&self.node_id);
        let mut messages = self.store.subscribe(&topic).await?;
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *tx_guard = Some(shutdown_tx);
        drop(tx_guard);

        let pool = self.clone();
        tokio::spawn(async move {
            info!(topic = %topic, "control listener started");
            loop {
                tokio::select! {
                    maybe_message = messages.recv() => match maybe_message {
                        Some(message) => pool.apply_control(&message.payload).await,
                        None => {
                            warn!(topic = %topic, "control topic subscription closed");
                            break;
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!(topic = %topic, "control listener stopping");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    pub async fn stop_control_listener(&self) {
        let mut tx_guard = self.control_shutdown_tx.write().await;
        if let Some(shutdown_tx) = tx_guard.take() {
            let _ = shutdown_tx.send(());
        }
    }

    pub async fn get_stats(&self) -> WorkerStats {
        let active_task_count = self.active.read().await.len() as u32;
        let counters = self.counters.read().await;
        WorkerStats {
            active_task_count,
            completed_task_count: counters.completed,
            failed_task_count: counters.failed,
            average_processing_ms: counters.average_processing_ms,
        }
    }

    pub async fn current_settings(&self) -> PoolSettings {
        *self.settings.read().await
    }

    async fn poll_loop(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        loop {
            // Read each round so UPDATE_CONFIG takes effect mid-run.
            let poll_interval = {
                let settings = self.settings.read().await;
                settings.poll_interval_ms
            };
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(poll_interval)) => {
                    if let Err(e) = self.poll_once().await {
                        error!("task poll failed: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("poll loop received stop signal");
                    break;
                }
            }
        }
    }

    /// One poll round: dequeue up to the number of free slots, stopping
    /// early when the queue runs dry.
    async fn poll_once(&self) -> TaskMeshResult<()> {
        let max_concurrent = {
            let settings = self.settings.read().await;
            settings.max_concurrent
        };
        let active_count = self.active.read().await.len();
        if active_count >= max_concurrent {
            return Ok(());
        }

        for _ in 0..(max_concurrent - active_count) {
            match self.queue.dequeue().await? {
                Some(task) => self.dispatch(task).await,
                None => break,
            }
        }
        Ok(())
    }

    async fn dispatch(&self, task: Task) {
        self.active.write().await.insert(task.id.clone());
        debug!(task_id = %task.id, task_type = %task.task_type, "dispatching task");
        let _ = self.events_tx.send(PoolEvent::TaskDispatched {
            task_id: task.id.clone(),
        });

        let pool = self.clone();
        tokio::spawn(async move {
            pool.execute_task(task).await;
        });
    }

    async fn execute_task(&self, task: Task) {
        let task_id = task.id.clone();
        let success = self.run_task(task).await;

        self.active.write().await.remove(&task_id);
        let _ = self
            .events_tx
            .send(PoolEvent::TaskSettled { task_id, success });
    }

    async fn run_task(&self, task: Task) -> bool {
        let Some(agent) = self.find_idle_agent(&task.task_type).await else {
            // Not an execution failure: the task goes back through the
            // queue's retry path and the counters stay untouched.
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                "no idle agent available, failing task back to the queue"
            );
            self.settle_failure(
                &task.id,
                &format!("no idle agent for task type '{}'", task.task_type),
            )
            .await;
            return false;
        };

        let started = Instant::now();
        let result = self.invoke_agent(agent, &task).await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(outcome) if outcome.is_success() => {
                self.counters.write().await.record(true, elapsed_ms);
                if let Err(e) = self.queue.complete(&task.id, outcome.data).await {
                    warn!(task_id = %task.id, "could not record completion: {}", e);
                }
                true
            }
            Ok(outcome) => {
                self.counters.write().await.record(false, elapsed_ms);
                let error = outcome
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string());
                self.settle_failure(&task.id, &error).await;
                false
            }
            Err(e) => {
                self.counters.write().await.record(false, elapsed_ms);
                self.settle_failure(&task.id, &e.to_string()).await;
                false
            }
        }
    }

    /// Run the agent in its own task so a panicking agent cannot take the
    /// pool down, enforcing the task deadline as an execution timeout.
    async fn invoke_agent(
        &self,
        agent: Arc<dyn Agent>,
        task: &Task,
    ) -> TaskMeshResult<AgentOutcome> {
        let budget = if let Some(deadline) = task.deadline {
            let Some(remaining) = task.remaining_before_deadline(Utc::now()) else {
                return Err(TaskMeshError::deadline_exceeded(format!(
                    "deadline {deadline} passed before dispatch"
                )));
            };
            Some(remaining.to_std().unwrap_or(Duration::ZERO))
        } else {
            None
        };

        let run = {
            let agent = Arc::clone(&agent);
            let task = task.clone();
            tokio::spawn(async move { agent.process(&task).await })
        };
        let abort_handle = run.abort_handle();

        let joined = match budget {
            Some(budget) => match tokio::time::timeout(budget, run).await {
                Ok(joined) => joined,
                Err(_) => {
                    abort_handle.abort();
                    return Err(TaskMeshError::deadline_exceeded(
                        "deadline elapsed during execution",
                    ));
                }
            },
            None => run.await,
        };

        match joined {
            Ok(result) => result,
            Err(e) => Err(TaskMeshError::internal(format!(
                "agent execution aborted: {e}"
            ))),
        }
    }

    async fn find_idle_agent(&self, task_type: &str) -> Option<Arc<dyn Agent>> {
        let agents = self.agents.read().await;
        agents
            .iter()
            .find(|agent| agent.task_type() == task_type && agent.status() == AgentStatus::Idle)
            .cloned()
    }

    async fn settle_failure(&self, task_id: &str, error: &str) {
        if let Err(e) = self.queue.fail(task_id, error).await {
            warn!(task_id = %task_id, "could not record failure: {}", e);
        }
    }

    /// Returns a boxed future because the `START_WORKER` path re-enters
    /// `start`, whose future awaits the control listener's — boxing here
    /// breaks that cycle so the spawned listener stays `Send`.
    fn apply_control<'a>(&'a self, payload: &'a str) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            let command = match serde_json::from_str::<ControlCommand>(payload) {
                Ok(command) => command,
                Err(e) => {
                    warn!("ignoring malformed control command: {}", e);
                    return;
                }
            };

            match command {
                ControlCommand::StopWorker => {
                    info!(node_id = %self.node_id, "control: stopping worker pool");
                    if let Err(e) = self.stop().await {
                        error!("control stop failed: {}", e);
                    }
                }
                ControlCommand::StartWorker => {
                    info!(node_id = %self.node_id, "control: starting worker pool");
                    if let Err(e) = self.start().await {
                        error!("control start failed: {}", e);
                    }
                }
                ControlCommand::UpdateConfig {
                    max_concurrent,
                    poll_interval_ms,
                } => {
                    let mut settings = self.settings.write().await;
                    if let Some(value) = max_concurrent {
                        if value == 0 {
                            warn!("ignoring max_concurrent update of 0");
                        } else {
                            settings.max_concurrent = value;
                        }
                    }
                    if let Some(value) = poll_interval_ms {
                        if value == 0 {
                            warn!("ignoring poll_interval_ms update of 0");
                        } else {
                            settings.poll_interval_ms = value;
                        }
                    }
                    info!(
                        max_concurrent = settings.max_concurrent,
                        poll_interval_ms = settings.poll_interval_ms,
                        "pool settings updated"
                    );
                }
            }
        })
    }
}

impl Clone for WorkerPool {
    fn clone(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            queue: self.queue.clone(),
            store: Arc::clone(&self.store),
            agents: Arc::clone(&self.agents),
            active: Arc::clone(&self.active),
            counters: Arc::clone(&self.counters),
            settings: Arc::clone(&self.settings),
            events_tx: self.events_tx.clone(),
            shutdown_tx: Arc::clone(&self.shutdown_tx),
            control_shutdown_tx: Arc::clone(&self.control_shutdown_tx),
            is_running: Arc::clone(&self.is_running),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskmesh_config::QueueConfig;
    use taskmesh_domain::entities::{TaskDraft, TaskSnapshot};
    use taskmesh_store::MemoryTaskStore;
    use taskmesh_testing_utils::{eventually, task_draft, FailingAgent, SleepAgent, SucceedingAgent};

    fn harness() -> (Arc<MemoryTaskStore>, TaskQueue) {
        let store = Arc::new(MemoryTaskStore::new());
        let queue = TaskQueue::new(store.clone(), QueueConfig::default(), "node-test");
        (store, queue)
    }

    fn fast_builder(queue: TaskQueue, store: Arc<MemoryTaskStore>) -> WorkerPoolBuilder {
        WorkerPool::builder("node-test", queue, store).poll_interval_ms(10)
    }

    async fn completed(queue: &TaskQueue, id: &str) -> bool {
        matches!(
            queue.get_status(id).await.unwrap(),
            Some(TaskSnapshot::Completed { .. })
        )
    }

    async fn failed(queue: &TaskQueue, id: &str) -> bool {
        matches!(
            queue.get_status(id).await.unwrap(),
            Some(TaskSnapshot::Failed { .. })
        )
    }

    #[tokio::test]
    async fn polled_task_reaches_matching_agent() {
        let (store, queue) = harness();
        let agent = Arc::new(
            SucceedingAgent::new("echo-1", "echo").with_result(json!({"echoed": true})),
        );
        let pool = fast_builder(queue.clone(), store)
            .register_agent(agent.clone())
            .build();

        let id = queue.enqueue(task_draft("echo", 5)).await.unwrap();
        pool.start().await.unwrap();

        assert!(
            eventually(Duration::from_secs(2), || completed(&queue, &id)).await,
            "task should complete"
        );
        assert_eq!(agent.processed_ids(), vec![id.clone()]);

        match queue.get_status(&id).await.unwrap().unwrap() {
            TaskSnapshot::Completed { result, .. } => assert_eq!(result, json!({"echoed": true})),
            other => panic!("expected completed, got {other:?}"),
        }

        let stats = pool.get_stats().await;
        assert_eq!(stats.completed_task_count, 1);
        assert!(
            eventually(Duration::from_secs(1), || async {
                pool.get_stats().await.active_task_count == 0
            })
            .await,
            "active set should drain"
        );

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn task_without_agent_exhausts_retries_and_fails() {
        let (store, queue) = harness();
        let pool = fast_builder(queue.clone(), store)
            .register_agent(Arc::new(SucceedingAgent::new("other", "other-type")))
            .build();

        let id = queue.enqueue(task_draft("unhandled", 5)).await.unwrap();
        pool.start().await.unwrap();

        assert!(
            eventually(Duration::from_secs(2), || failed(&queue, &id)).await,
            "task should fail terminally"
        );
        match queue.get_status(&id).await.unwrap().unwrap() {
            TaskSnapshot::Failed { task, error } => {
                assert!(error.contains("no idle agent"));
                assert_eq!(task.retry_count, 3);
            }
            other => panic!("expected failed, got {other:?}"),
        }

        // Capacity failures are queue-side retries, not executions.
        let stats = pool.get_stats().await;
        assert_eq!(stats.completed_task_count, 0);
        assert_eq!(stats.failed_task_count, 0);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn failing_agent_outcome_retries_then_lands_terminal() {
        let (store, queue) = harness();
        let agent = Arc::new(FailingAgent::new("boom", "flaky").with_error("boom"));
        let pool = fast_builder(queue.clone(), store)
            .register_agent(agent.clone())
            .build();

        let id = queue.enqueue(task_draft("flaky", 5)).await.unwrap();
        pool.start().await.unwrap();

        assert!(
            eventually(Duration::from_secs(2), || failed(&queue, &id)).await,
            "task should fail terminally"
        );
        // Initial attempt plus three retries.
        assert_eq!(agent.processed_ids().len(), 4);
        let stats = pool.get_stats().await;
        assert_eq!(stats.failed_task_count, 4);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn busy_agent_sends_overflow_back_through_retry() {
        let (store, queue) = harness();
        // Poll slowly enough that the agent frees up before the overflow
        // task burns through its whole retry budget.
        let pool = WorkerPool::builder("node-test", queue.clone(), store)
            .poll_interval_ms(50)
            .max_concurrent(2)
            .register_agent(Arc::new(SleepAgent::new(
                "slow-1",
                "slow",
                Duration::from_millis(120),
            )))
            .build();

        let first = queue.enqueue(task_draft("slow", 5)).await.unwrap();
        pool.start().await.unwrap();
        assert!(
            eventually(Duration::from_secs(1), || async {
                pool.get_stats().await.active_task_count == 1
            })
            .await,
            "first task should be running"
        );

        // The only agent is mid-sleep, so this one loses the idle check
        // and goes back through the queue's retry path.
        let second = queue.enqueue(task_draft("slow", 5)).await.unwrap();

        assert!(
            eventually(Duration::from_secs(3), || async {
                completed(&queue, &first).await && completed(&queue, &second).await
            })
            .await,
            "both tasks should complete"
        );

        match queue.get_status(&second).await.unwrap().unwrap() {
            TaskSnapshot::Completed { task, .. } => assert!(task.retry_count >= 1),
            other => panic!("expected completed, got {other:?}"),
        }

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn expired_deadline_fails_without_invoking_agent() {
        let (store, queue) = harness();
        let agent = Arc::new(SucceedingAgent::new("echo-1", "echo"));
        let pool = fast_builder(queue.clone(), store)
            .register_agent(agent.clone())
            .build();

        let draft = TaskDraft::new("echo", 5, json!({}))
            .with_deadline(Utc::now() - chrono::Duration::seconds(5));
        let id = queue.enqueue(draft).await.unwrap();
        pool.start().await.unwrap();

        assert!(
            eventually(Duration::from_secs(2), || failed(&queue, &id)).await,
            "task should fail terminally"
        );
        match queue.get_status(&id).await.unwrap().unwrap() {
            TaskSnapshot::Failed { error, .. } => assert!(error.contains("deadline")),
            other => panic!("expected failed, got {other:?}"),
        }
        assert!(agent.processed_ids().is_empty());

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_limit_holds_under_load() {
        let (store, queue) = harness();
        let pool = fast_builder(queue.clone(), store)
            .max_concurrent(1)
            .register_agent(Arc::new(SleepAgent::new(
                "slow-1",
                "slow",
                Duration::from_millis(50),
            )))
            .build();

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(queue.enqueue(task_draft("slow", 5)).await.unwrap());
        }
        pool.start().await.unwrap();

        assert!(
            eventually(Duration::from_secs(3), || {
                let queue = queue.clone();
                let ids = ids.clone();
                async move {
                    for id in &ids {
                        if !completed(&queue, id).await {
                            return false;
                        }
                    }
                    true
                }
            })
            .await,
            "all tasks should complete"
        );

        let stats = pool.get_stats().await;
        assert_eq!(stats.completed_task_count, 3);
        assert!(stats.average_processing_ms >= 50.0);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn control_topic_stops_starts_and_reconfigures() {
        let (store, queue) = harness();
        let pool = fast_builder(queue.clone(), store.clone()).build();
        let mut events = pool.events();

        pool.start_control_listener().await.unwrap();
        pool.start().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), PoolEvent::Started));

        let topic = topics::worker_control("node-test");

        // Garbage is ignored, the listener keeps going.
        store.publish(&topic, "not json").await.unwrap();

        store
            .publish(&topic, r#"{"command":"STOP_WORKER"}"#)
            .await
            .unwrap();
        assert!(matches!(events.recv().await.unwrap(), PoolEvent::Stopped));

        store
            .publish(&topic, r#"{"command":"START_WORKER"}"#)
            .await
            .unwrap();
        assert!(matches!(events.recv().await.unwrap(), PoolEvent::Started));

        store
            .publish(
                &topic,
                r#"{"command":"UPDATE_CONFIG","max_concurrent":9,"poll_interval_ms":25}"#,
            )
            .await
            .unwrap();
        assert!(
            eventually(Duration::from_secs(1), || async {
                pool.current_settings().await
                    == PoolSettings {
                        max_concurrent: 9,
                        poll_interval_ms: 25,
                    }
            })
            .await,
            "settings should be updated"
        );

        pool.stop().await.unwrap();
        pool.stop_control_listener().await;
    }

    #[tokio::test]
    async fn agent_registry_replaces_and_removes_by_id() {
        let (store, queue) = harness();
        let pool = fast_builder(queue, store).build();

        pool.register_agent(Arc::new(SucceedingAgent::new("a", "echo")))
            .await;
        pool.register_agent(Arc::new(SucceedingAgent::new("b", "echo")))
            .await;
        pool.register_agent(Arc::new(SucceedingAgent::new("a", "shell")))
            .await;
        assert_eq!(pool.registered_agent_ids().await, vec!["b", "a"]);

        assert!(pool.unregister_agent("a").await);
        assert!(!pool.unregister_agent("a").await);
        assert_eq!(pool.registered_agent_ids().await, vec!["b"]);
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let (store, queue) = harness();
        let pool = fast_builder(queue, store).build();

        pool.start().await.unwrap();
        pool.start().await.unwrap();
        pool.stop().await.unwrap();
        pool.stop().await.unwrap();
    }
}
