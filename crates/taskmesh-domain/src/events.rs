//! Event topics carried over the shared store's pub/sub channel, and the
//! payloads published on them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{Task, TaskStatus};

pub mod topics {
    /// Task lifecycle events published by the queue.
    pub const TASK_ADDED: &str = "taskmesh:queue:task_added";
    pub const TASK_STARTED: &str = "taskmesh:queue:task_started";
    pub const TASK_COMPLETED: &str = "taskmesh:queue:task_completed";
    pub const TASK_FAILED: &str = "taskmesh:queue:task_failed";

    /// Cluster membership events published by coordinators.
    pub const WORKER_JOINED: &str = "taskmesh:cluster:worker_joined";
    pub const WORKER_LEFT: &str = "taskmesh:cluster:worker_left";
    pub const TASK_REDISTRIBUTED: &str = "taskmesh:cluster:task_redistributed";

    /// Broker transport channel for broadcast messages.
    pub const BROKER_BROADCAST: &str = "taskmesh:broker:broadcast";

    /// Broker transport channel for messages addressed to one recipient.
    pub fn broker_direct(recipient_id: &str) -> String {
        format!("taskmesh:broker:direct:{recipient_id}")
    }

    /// Node-scoped control channel for remote worker administration.
    pub fn worker_control(node_id: &str) -> String {
        format!("taskmesh:worker:{node_id}:control")
    }
}

/// Payload for the task lifecycle topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub task_type: String,
    pub priority: u8,
    pub retry_count: u32,
    pub status: TaskStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskEvent {
    pub fn from_task(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            task_type: task.task_type.clone(),
            priority: task.priority,
            retry_count: task.retry_count,
            status: task.status,
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Payload for `WORKER_JOINED` and `WORKER_LEFT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ClusterEvent {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Payload for `TASK_REDISTRIBUTED`. The task itself travels through the
/// redistributed collection; the event only announces the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedistributionEvent {
    pub task_id: String,
    pub from_node: String,
    pub timestamp: DateTime<Utc>,
}

impl RedistributionEvent {
    pub fn new(task_id: impl Into<String>, from_node: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            from_node: from_node.into(),
            timestamp: Utc::now(),
        }
    }
}
