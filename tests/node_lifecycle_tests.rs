//! End-to-end checks of a fully assembled node on the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use serde_json::json;

use taskmesh::{Application, ShutdownManager};
use taskmesh_config::AppConfig;
use taskmesh_domain::entities::{MessageFilter, MessageType, TaskDraft, TaskSnapshot};
use taskmesh_domain::ports::TaskStore;
use taskmesh_queue::TaskQueue;
use taskmesh_testing_utils::{broadcast_message, eventually};

const REGISTRY_KEY: &str = "taskmesh:cluster:workers";

/// A self-contained node configuration with intervals tightened for tests.
fn test_config(node_id: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.node_id = Some(node_id.to_string());
    config.worker.poll_interval_ms = 20;
    config.cluster.heartbeat_interval_seconds = 1;
    config.cluster.liveness_threshold_seconds = 3;
    config.cluster.reclaim_interval_seconds = 1;
    config
}

async fn registry_has(store: &Arc<dyn TaskStore>, node_id: &str) -> bool {
    store
        .hgetall(REGISTRY_KEY)
        .await
        .map(|records| records.contains_key(node_id))
        .unwrap_or(false)
}

async fn completed(queue: &TaskQueue, task_id: &str) -> bool {
    matches!(
        queue.get_status(task_id).await,
        Ok(Some(TaskSnapshot::Completed { .. }))
    )
}

async fn failed(queue: &TaskQueue, task_id: &str) -> bool {
    matches!(
        queue.get_status(task_id).await,
        Ok(Some(TaskSnapshot::Failed { .. }))
    )
}

#[tokio::test]
async fn node_processes_tasks_end_to_end() -> Result<()> {
    let app = Application::build(test_config("node-e2e")).await?;
    let store = app.store();
    let queue = app.queue().clone();

    let shutdown_manager = ShutdownManager::new();
    let handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run_until_shutdown(shutdown_rx).await })
    };

    // The coordinator writes its registry record during startup.
    assert!(eventually(Duration::from_secs(2), || registry_has(&store, "node-e2e")).await);

    // The default configuration registers the echo agent, which hands the
    // payload back as the result.
    let task_id = queue
        .enqueue(TaskDraft::new("echo", 5, json!({"value": 42})))
        .await?;
    assert!(eventually(Duration::from_secs(3), || completed(&queue, &task_id)).await);

    match queue.get_status(&task_id).await? {
        Some(TaskSnapshot::Completed { result, .. }) => {
            assert_eq!(result, json!({"value": 42}));
        }
        other => panic!("expected completed snapshot, got {other:?}"),
    }

    shutdown_manager.shutdown().await;
    let run_result = tokio::time::timeout(Duration::from_secs(5), handle).await??;
    assert!(run_result.is_ok());

    // The registry record is removed on the way out.
    assert!(!registry_has(&store, "node-e2e").await);
    Ok(())
}

#[tokio::test]
async fn expired_deadlines_surface_as_failures() -> Result<()> {
    let app = Application::build(test_config("node-deadline")).await?;
    let queue = app.queue().clone();

    let shutdown_manager = ShutdownManager::new();
    let handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run_until_shutdown(shutdown_rx).await })
    };

    let draft = TaskDraft::new("echo", 5, json!({}))
        .with_deadline(Utc::now() - chrono::Duration::seconds(5));
    let task_id = queue.enqueue(draft).await?;

    assert!(eventually(Duration::from_secs(3), || failed(&queue, &task_id)).await);
    match queue.get_status(&task_id).await? {
        Some(TaskSnapshot::Failed { error, .. }) => assert!(error.contains("deadline")),
        other => panic!("expected failed snapshot, got {other:?}"),
    }

    shutdown_manager.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), handle).await??.ok();
    Ok(())
}

#[tokio::test]
async fn builtin_agent_roster_follows_configuration() -> Result<()> {
    let mut config = test_config("node-roster");
    config.worker.builtin_agents = vec![
        "echo".to_string(),
        "shell".to_string(),
        "teleport".to_string(),
    ];

    let app = Application::build(config).await?;
    // Known kinds are registered in order, unknown ones are skipped.
    let ids = app.pool().registered_agent_ids().await;
    assert_eq!(ids, vec!["node-roster-echo", "node-roster-shell"]);
    Ok(())
}

#[tokio::test]
async fn missing_node_id_gets_generated() -> Result<()> {
    let mut config = test_config("ignored");
    config.node_id = None;

    let app = Application::build(config).await?;
    assert!(!app.node_id().is_empty());
    assert!(app.node_id().contains('-'));
    Ok(())
}

#[tokio::test]
async fn broker_round_trip_through_the_assembled_node() -> Result<()> {
    let app = Application::build(test_config("node-msg")).await?;
    let broker = app.broker().clone();

    let (_id, mut rx) = broker.subscribe(MessageFilter::any(), None).await;
    broker
        .publish(broadcast_message(MessageType::Notification, "node-msg"))
        .await?;

    let delivered = rx.try_recv()?;
    assert_eq!(delivered.sender.id, "node-msg");
    assert_eq!(delivered.metadata.origin_node.as_deref(), Some("node-msg"));
    Ok(())
}

#[tokio::test]
async fn idle_node_starts_and_stops_cleanly() -> Result<()> {
    let app = Application::build(test_config("node-idle")).await?;
    let pool = app.pool().clone();

    let shutdown_manager = ShutdownManager::new();
    let handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        tokio::spawn(async move { app.run_until_shutdown(shutdown_rx).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;
    let stats = pool.get_stats().await;
    assert_eq!(stats.active_task_count, 0);
    assert_eq!(stats.completed_task_count, 0);

    shutdown_manager.shutdown().await;
    let run_result = tokio::time::timeout(Duration::from_secs(5), handle).await??;
    assert!(run_result.is_ok());
    Ok(())
}
