use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, info, warn};

use taskmesh_broker::MessageBroker;
use taskmesh_cluster::{generate_node_id, Coordinator};
use taskmesh_config::AppConfig;
use taskmesh_domain::ports::TaskStore;
use taskmesh_errors::TaskMeshResult;
use taskmesh_queue::TaskQueue;
use taskmesh_store::TaskStoreFactory;
use taskmesh_worker::{create_builtin_agent, WorkerPool};

/// How often settled tasks past the retention window are purged.
const JANITOR_INTERVAL: Duration = Duration::from_secs(3600);

/// A fully wired node: store, queue, broker, worker pool and coordinator.
///
/// Every component receives its dependencies through its constructor;
/// nothing in here reads globals. The same wiring is reused by the
/// integration tests against the in-memory store backend.
pub struct Application {
    node_id: String,
    store: Arc<dyn TaskStore>,
    queue: TaskQueue,
    broker: MessageBroker,
    pool: WorkerPool,
    coordinator: Coordinator,
}

impl Application {
    pub async fn build(config: AppConfig) -> TaskMeshResult<Self> {
        let node_id = config.node_id.clone().unwrap_or_else(generate_node_id);
        info!(node_id = %node_id, "assembling node");

        let store = TaskStoreFactory::create(&config.store).await?;
        let queue = TaskQueue::new(Arc::clone(&store), config.queue.clone(), &node_id);
        let broker = MessageBroker::new(Arc::clone(&store), config.broker.clone(), &node_id);

        let mut pool_builder = WorkerPool::builder(&node_id, queue.clone(), Arc::clone(&store))
            .with_config(config.worker.clone());
        for kind in &config.worker.builtin_agents {
            match create_builtin_agent(kind, &node_id) {
                Some(agent) => {
                    info!(agent_id = agent.id(), "registering builtin agent");
                    pool_builder = pool_builder.register_agent(agent);
                }
                None => warn!(kind = kind.as_str(), "unknown builtin agent kind, skipping"),
            }
        }
        let pool = pool_builder.build();

        let coordinator = Coordinator::new(
            Arc::clone(&store),
            queue.clone(),
            pool.clone(),
            config.cluster.clone(),
            &node_id,
        );

        Ok(Self {
            node_id,
            store,
            queue,
            broker,
            pool,
            coordinator,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> Arc<dyn TaskStore> {
        Arc::clone(&self.store)
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn broker(&self) -> &MessageBroker {
        &self.broker
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Start every component, then park until the shutdown signal fires.
    ///
    /// The coordinator starts the worker pool itself; the broker listener
    /// is started alongside. While parked, a janitor interval purges
    /// settled tasks past the retention window. Components stop in reverse
    /// order of their start.
    pub async fn run_until_shutdown(
        &self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> TaskMeshResult<()> {
        self.coordinator.start().await?;
        self.broker.start().await?;
        info!(node_id = %self.node_id, "node is up");

        let mut janitor = tokio::time::interval(JANITOR_INTERVAL);
        loop {
            tokio::select! {
                _ = janitor.tick() => {
                    match self.queue.cleanup().await {
                        Ok(0) => {}
                        Ok(purged) => info!(purged, "retention sweep purged settled tasks"),
                        Err(e) => warn!("retention sweep failed: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }

        info!(node_id = %self.node_id, "stopping node");
        self.broker.stop().await;
        if let Err(e) = self.coordinator.stop().await {
            error!("coordinator stop failed: {}", e);
        }
        info!(node_id = %self.node_id, "node stopped");
        Ok(())
    }
}
