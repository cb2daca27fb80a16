//! Scripted agent doubles with observable behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use taskmesh_domain::agent::{Agent, AgentOutcome, AgentStatus};
use taskmesh_domain::entities::Task;
use taskmesh_errors::{TaskMeshError, TaskMeshResult};

/// Agent that always succeeds, optionally after a delay, recording every
/// task id it processed.
pub struct SucceedingAgent {
    id: String,
    task_type: String,
    result: serde_json::Value,
    delay: Option<Duration>,
    busy: AtomicBool,
    processed: Mutex<Vec<String>>,
}

impl SucceedingAgent {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            result: serde_json::json!({"ok": true}),
            delay: None,
            busy: AtomicBool::new(false),
            processed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = result;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Ids of every task this agent has processed, in order.
    pub fn processed_ids(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for SucceedingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn status(&self) -> AgentStatus {
        if self.busy.load(Ordering::SeqCst) {
            AgentStatus::Busy
        } else {
            AgentStatus::Idle
        }
    }

    async fn process(&self, task: &Task) -> TaskMeshResult<AgentOutcome> {
        self.busy.store(true, Ordering::SeqCst);
        self.processed.lock().unwrap().push(task.id.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.busy.store(false, Ordering::SeqCst);
        Ok(AgentOutcome::success(self.result.clone()))
    }
}

enum FailureMode {
    /// `Ok` with a failure outcome.
    Outcome,
    /// `Err` from `process` itself.
    Error,
}

/// Agent that always fails, either through a failure outcome or by
/// returning an error from `process`.
pub struct FailingAgent {
    id: String,
    task_type: String,
    error: String,
    mode: FailureMode,
    busy: AtomicBool,
    processed: Mutex<Vec<String>>,
}

impl FailingAgent {
    pub fn new(id: impl Into<String>, task_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            error: "scripted failure".to_string(),
            mode: FailureMode::Outcome,
            busy: AtomicBool::new(false),
            processed: Mutex::new(Vec::new()),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    /// Fail by returning `Err` instead of a failure outcome.
    pub fn erroring(mut self) -> Self {
        self.mode = FailureMode::Error;
        self
    }

    pub fn processed_ids(&self) -> Vec<String> {
        self.processed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Agent for FailingAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn status(&self) -> AgentStatus {
        if self.busy.load(Ordering::SeqCst) {
            AgentStatus::Busy
        } else {
            AgentStatus::Idle
        }
    }

    async fn process(&self, task: &Task) -> TaskMeshResult<AgentOutcome> {
        self.processed.lock().unwrap().push(task.id.clone());
        match self.mode {
            FailureMode::Outcome => Ok(AgentOutcome::failure(self.error.clone())),
            FailureMode::Error => Err(TaskMeshError::internal(self.error.clone())),
        }
    }
}

/// Agent that sleeps for a fixed duration and then succeeds. Reports Busy
/// while sleeping, which makes it useful for concurrency-limit and
/// deadline tests.
pub struct SleepAgent {
    id: String,
    task_type: String,
    duration: Duration,
    busy: AtomicBool,
}

impl SleepAgent {
    pub fn new(
        id: impl Into<String>,
        task_type: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            task_type: task_type.into(),
            duration,
            busy: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Agent for SleepAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_type(&self) -> &str {
        &self.task_type
    }

    fn status(&self) -> AgentStatus {
        if self.busy.load(Ordering::SeqCst) {
            AgentStatus::Busy
        } else {
            AgentStatus::Idle
        }
    }

    async fn process(&self, _task: &Task) -> TaskMeshResult<AgentOutcome> {
        self.busy.store(true, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.busy.store(false, Ordering::SeqCst);
        Ok(AgentOutcome::success(serde_json::json!({"slept_ms": self.duration.as_millis() as u64})))
    }
}
