//! The agent capability contract. Agents are the pluggable executors a
//! worker pool dispatches tasks to; each declares the task type it handles
//! and reports whether it is free to take another task.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use taskmesh_errors::TaskMeshResult;

use crate::entities::Task;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AgentStatus {
    #[serde(rename = "IDLE")]
    Idle,
    #[serde(rename = "BUSY")]
    Busy,
    #[serde(rename = "ERROR")]
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutcomeStatus {
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILURE")]
    Failure,
}

/// What an agent hands back after processing a task. A `Failure` outcome is
/// an ordinary task-level failure and goes through the retry policy; an
/// `Err` from [`Agent::process`] is treated the same way.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub status: OutcomeStatus,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentOutcome {
    pub fn success(data: serde_json::Value) -> Self {
        Self {
            status: OutcomeStatus::Success,
            data,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            data: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success)
    }
}

#[async_trait]
pub trait Agent: Send + Sync {
    /// Stable identifier, unique within one pool's registry.
    fn id(&self) -> &str;

    /// The task type this agent accepts.
    fn task_type(&self) -> &str;

    /// Current availability. The pool only dispatches to idle agents.
    fn status(&self) -> AgentStatus;

    async fn process(&self, task: &Task) -> TaskMeshResult<AgentOutcome>;
}
