//! Built-in agents shipped with the worker. Which of these a node
//! registers at startup is driven by `worker.builtin_agents` in the
//! configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::process::Command;
use tracing::info;

use taskmesh_domain::agent::{Agent, AgentOutcome, AgentStatus};
use taskmesh_domain::entities::Task;
use taskmesh_errors::{TaskMeshError, TaskMeshResult};

/// Instantiate a built-in agent by kind, or `None` for an unknown kind.
pub fn create_builtin_agent(kind: &str, node_id: &str) -> Option<Arc<dyn Agent>> {
    match kind {
        "echo" => Some(Arc::new(EchoAgent::new(format!("{node_id}-echo")))),
        "shell" => Some(Arc::new(ShellAgent::new(format!("{node_id}-shell")))),
        _ => None,
    }
}

/// Agent for `echo` tasks: hands the payload back as the result.
pub struct EchoAgent {
    id: String,
    busy: AtomicBool,
}

impl EchoAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            busy: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_type(&self) -> &str {
        "echo"
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
        let outcome = AgentOutcome::success(task.payload.clone());
        self.busy.store(false, Ordering::SeqCst);
        Ok(outcome)
    }
}

/// Parameters for `shell` tasks, carried in the task payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellParams {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<HashMap<String, String>>,
}

/// Agent for `shell` tasks: runs a command and captures its output.
///
/// A non-zero exit is a failure outcome and goes through the queue's
/// retry policy; only spawn errors and malformed payloads surface as
/// errors.
pub struct ShellAgent {
    id: String,
    busy: AtomicBool,
}

impl ShellAgent {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            busy: AtomicBool::new(false),
        }
    }

    async fn run(&self, task: &Task) -> TaskMeshResult<AgentOutcome> {
        let params: ShellParams = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskMeshError::validation(format!("invalid shell params: {e}")))?;

        let args = params.args.unwrap_or_default();
        info!(
            task_id = %task.id,
            command = %params.command,
            ?args,
            "running shell command"
        );

        let mut cmd = Command::new(&params.command);
        cmd.args(&args);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(env_vars) = &params.env_vars {
            for (key, value) in env_vars {
                cmd.env(key, value);
            }
        }

        let output = cmd.output().await.map_err(|e| {
            TaskMeshError::internal(format!("failed to run '{}': {e}", params.command))
        })?;

        let exit_code = output.status.code();
        let stdout = String::from_utf8_lossy(&output.stdout)
            .trim_end()
            .to_string();
        let stderr = String::from_utf8_lossy(&output.stderr)
            .trim_end()
            .to_string();

        if output.status.success() {
            Ok(AgentOutcome::success(json!({
                "stdout": stdout,
                "exit_code": exit_code,
            })))
        } else {
            let error = if stderr.is_empty() {
                format!("command exited with code {exit_code:?}")
            } else {
                stderr
            };
            Ok(AgentOutcome::failure(error))
        }
    }
}

#[async_trait]
impl Agent for ShellAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn task_type(&self) -> &str {
        "shell"
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
        let result = self.run(task).await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use taskmesh_domain::entities::TaskDraft;

    fn task_with_payload(task_type: &str, payload: serde_json::Value) -> Task {
        Task::from_draft(TaskDraft::new(task_type, 5, payload))
    }

    #[tokio::test]
    async fn echo_agent_returns_payload_as_result() {
        let agent = EchoAgent::new("n1-echo");
        let task = task_with_payload("echo", json!({"greeting": "hello"}));

        let outcome = agent.process(&task).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.data, json!({"greeting": "hello"}));
    }

    #[tokio::test]
    async fn shell_agent_captures_stdout_and_exit_code() {
        let agent = ShellAgent::new("n1-shell");
        let task = task_with_payload(
            "shell",
            json!({"command": "echo", "args": ["hello", "world"]}),
        );

        let outcome = agent.process(&task).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.data["stdout"], "hello world");
        assert_eq!(outcome.data["exit_code"], 0);
    }

    #[tokio::test]
    async fn shell_agent_passes_env_vars() {
        let agent = ShellAgent::new("n1-shell");
        let task = task_with_payload(
            "shell",
            json!({
                "command": "sh",
                "args": ["-c", "printf '%s' \"$TASKMESH_TEST_VALUE\""],
                "env_vars": {"TASKMESH_TEST_VALUE": "injected"},
            }),
        );

        let outcome = agent.process(&task).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.data["stdout"], "injected");
    }

    #[tokio::test]
    async fn shell_agent_turns_nonzero_exit_into_failure_outcome() {
        let agent = ShellAgent::new("n1-shell");
        let task = task_with_payload("shell", json!({"command": "sh", "args": ["-c", "exit 3"]}));

        let outcome = agent.process(&task).await.unwrap();
        assert!(!outcome.is_success());
        assert!(outcome.error.unwrap().contains('3'));
    }

    #[tokio::test]
    async fn shell_agent_prefers_stderr_as_failure_reason() {
        let agent = ShellAgent::new("n1-shell");
        let task = task_with_payload(
            "shell",
            json!({"command": "sh", "args": ["-c", "echo broken >&2; exit 1"]}),
        );

        let outcome = agent.process(&task).await.unwrap();
        assert!(!outcome.is_success());
        assert_eq!(outcome.error.unwrap(), "broken");
    }

    #[tokio::test]
    async fn shell_agent_rejects_payload_without_command() {
        let agent = ShellAgent::new("n1-shell");
        let task = task_with_payload("shell", json!({"args": ["oops"]}));

        let err = agent.process(&task).await.unwrap_err();
        assert!(matches!(err, TaskMeshError::Validation(_)));
    }

    #[test]
    fn builtin_agents_cover_known_kinds() {
        let echo = create_builtin_agent("echo", "node-1").unwrap();
        assert_eq!(echo.task_type(), "echo");
        assert_eq!(echo.id(), "node-1-echo");

        let shell = create_builtin_agent("shell", "node-1").unwrap();
        assert_eq!(shell.task_type(), "shell");

        assert!(create_builtin_agent("mystery", "node-1").is_none());
    }
}
