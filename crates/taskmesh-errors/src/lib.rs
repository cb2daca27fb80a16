//! Error taxonomy shared by every TaskMesh crate.
//!
//! Operations on shared state return [`TaskMeshResult`]; callers decide per
//! call site whether a failure is surfaced, converted into a task state
//! transition, or logged and tolerated.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TaskMeshError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("task not found: {id}")]
    TaskNotFound { id: String },
    #[error("worker not found: {id}")]
    WorkerNotFound { id: String },
    #[error("no idle agent available: {0}")]
    AgentCapacity(String),
    #[error("store transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("internal error: {0}")]
    Internal(String),
}

pub type TaskMeshResult<T> = Result<T, TaskMeshError>;

impl TaskMeshError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn task_not_found<S: Into<String>>(id: S) -> Self {
        Self::TaskNotFound { id: id.into() }
    }
    pub fn worker_not_found<S: Into<String>>(id: S) -> Self {
        Self::WorkerNotFound { id: id.into() }
    }
    pub fn agent_capacity<S: Into<String>>(msg: S) -> Self {
        Self::AgentCapacity(msg.into())
    }
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }
    pub fn deadline_exceeded<S: Into<String>>(msg: S) -> Self {
        Self::DeadlineExceeded(msg.into())
    }
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether retrying the same operation later can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TaskMeshError::Transport(_) | TaskMeshError::AgentCapacity(_)
        )
    }

    /// Whether the error was caused by the caller's input rather than the
    /// system state.
    pub fn is_validation(&self) -> bool {
        matches!(self, TaskMeshError::Validation(_))
    }
}

impl From<serde_json::Error> for TaskMeshError {
    fn from(err: serde_json::Error) -> Self {
        TaskMeshError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for TaskMeshError {
    fn from(err: anyhow::Error) -> Self {
        TaskMeshError::Internal(err.to_string())
    }
}
