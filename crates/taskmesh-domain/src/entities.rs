use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Highest priority a task may carry. Priorities above this are rejected at
/// enqueue time.
pub const MAX_PRIORITY: u8 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Enqueue input. The queue assigns id, status and timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDraft {
    pub task_type: String,
    pub priority: u8,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
}

impl TaskDraft {
    pub fn new(task_type: impl Into<String>, priority: u8, payload: serde_json::Value) -> Self {
        Self {
            task_type: task_type.into(),
            priority,
            payload,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub task_type: String,
    pub priority: u8,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn from_draft(draft: TaskDraft) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            task_type: draft.task_type,
            priority: draft.priority,
            payload: draft.payload,
            deadline: draft.deadline,
            retry_count: 0,
            status: TaskStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn update_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Time left before the deadline, if one is set and not yet past.
    pub fn remaining_before_deadline(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.deadline
            .filter(|deadline| *deadline > now)
            .map(|deadline| deadline - now)
    }
}

/// A task parked in the processing collection while one node works on it.
/// The lease bounds how long the entry may sit there before a reclamation
/// sweep is allowed to requeue it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingEntry {
    pub task: Task,
    pub owner_node: String,
    pub lease_expires_at: DateTime<Utc>,
}

impl ProcessingEntry {
    pub fn new(task: Task, owner_node: impl Into<String>, lease: Duration) -> Self {
        Self {
            task,
            owner_node: owner_node.into(),
            lease_expires_at: Utc::now() + lease,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedEntry {
    pub task: Task,
    pub result: serde_json::Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEntry {
    pub task: Task,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Answer to a status query, carrying the collection the task was found in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum TaskSnapshot {
    #[serde(rename = "PROCESSING")]
    Processing { task: Task, owner_node: String },
    #[serde(rename = "COMPLETED")]
    Completed {
        task: Task,
        result: serde_json::Value,
    },
    #[serde(rename = "FAILED")]
    Failed { task: Task, error: String },
}

impl TaskSnapshot {
    pub fn task(&self) -> &Task {
        match self {
            TaskSnapshot::Processing { task, .. } => task,
            TaskSnapshot::Completed { task, .. } => task,
            TaskSnapshot::Failed { task, .. } => task,
        }
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            TaskSnapshot::Processing { .. } => TaskStatus::Processing,
            TaskSnapshot::Completed { .. } => TaskStatus::Completed,
            TaskSnapshot::Failed { .. } => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "INACTIVE")]
    Inactive,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerStats {
    pub active_task_count: u32,
    pub completed_task_count: u64,
    pub failed_task_count: u64,
    pub average_processing_ms: f64,
}

/// One node's record in the shared worker registry. Each node writes only
/// its own record; every node may read all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub stats: WorkerStats,
}

impl WorkerNode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: WorkerStatus::Active,
            last_heartbeat: Utc::now(),
            stats: WorkerStats::default(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, WorkerStatus::Active)
    }

    /// Read-time liveness check. Stale records stay in the registry; callers
    /// filter with this instead of deleting them.
    pub fn is_live(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.is_active() && now.signed_duration_since(self.last_heartbeat) < threshold
    }

    pub fn update_heartbeat(&mut self, stats: WorkerStats) {
        self.stats = stats;
        self.last_heartbeat = Utc::now();
        self.status = WorkerStatus::Active;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MessageType {
    #[serde(rename = "TASK_ADDED")]
    TaskAdded,
    #[serde(rename = "TASK_STARTED")]
    TaskStarted,
    #[serde(rename = "TASK_COMPLETED")]
    TaskCompleted,
    #[serde(rename = "TASK_FAILED")]
    TaskFailed,
    #[serde(rename = "WORKER_JOINED")]
    WorkerJoined,
    #[serde(rename = "WORKER_LEFT")]
    WorkerLeft,
    #[serde(rename = "TASK_REDISTRIBUTED")]
    TaskRedistributed,
    #[serde(rename = "STATUS_UPDATE")]
    StatusUpdate,
    #[serde(rename = "NOTIFICATION")]
    Notification,
    #[serde(rename = "CONTROL")]
    Control,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskAdded => "TASK_ADDED",
            MessageType::TaskStarted => "TASK_STARTED",
            MessageType::TaskCompleted => "TASK_COMPLETED",
            MessageType::TaskFailed => "TASK_FAILED",
            MessageType::WorkerJoined => "WORKER_JOINED",
            MessageType::WorkerLeft => "WORKER_LEFT",
            MessageType::TaskRedistributed => "TASK_REDISTRIBUTED",
            MessageType::StatusUpdate => "STATUS_UPDATE",
            MessageType::Notification => "NOTIFICATION",
            MessageType::Control => "CONTROL",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSender {
    pub id: String,
    pub kind: String,
}

impl MessageSender {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
        }
    }
}

/// Delivery target. Exactly one of `broadcast` or `id` selects the mode;
/// the broker rejects messages that set both or neither.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageRecipient {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default)]
    pub broadcast: bool,
}

impl MessageRecipient {
    pub fn to_all() -> Self {
        Self {
            id: None,
            kind: None,
            broadcast: true,
        }
    }

    pub fn to(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind: None,
            broadcast: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub timestamp: DateTime<Utc>,
    pub priority: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_node: Option<String>,
}

impl Default for MessageMetadata {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            priority: 5,
            correlation_id: None,
            ttl_seconds: None,
            origin_node: None,
        }
    }
}

/// Envelope routed through the message broker. Immutable after publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub id: String,
    pub message_type: MessageType,
    pub sender: MessageSender,
    pub recipient: MessageRecipient,
    pub payload: serde_json::Value,
    pub metadata: MessageMetadata,
}

impl BrokerMessage {
    pub fn new(
        message_type: MessageType,
        sender: MessageSender,
        recipient: MessageRecipient,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            sender,
            recipient,
            payload,
            metadata: MessageMetadata::default(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.metadata.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_ttl_seconds(mut self, ttl_seconds: u64) -> Self {
        self.metadata.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.broadcast
    }
}

/// Subscription predicate. A field left as `None` matches anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_types: Option<Vec<MessageType>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_kinds: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_priority: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl MessageFilter {
    pub fn any() -> Self {
        Self::default()
    }

    pub fn for_types(message_types: Vec<MessageType>) -> Self {
        Self {
            message_types: Some(message_types),
            ..Self::default()
        }
    }

    pub fn matches(&self, message: &BrokerMessage) -> bool {
        if let Some(types) = &self.message_types {
            if !types.contains(&message.message_type) {
                return false;
            }
        }
        if let Some(kinds) = &self.sender_kinds {
            if !kinds.iter().any(|kind| kind == &message.sender.kind) {
                return false;
            }
        }
        if let Some(min_priority) = self.min_priority {
            if message.metadata.priority < min_priority {
                return false;
            }
        }
        if let Some(correlation_id) = &self.correlation_id {
            if message.metadata.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                return false;
            }
        }
        true
    }
}

/// Remote administration commands accepted on a node's control topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "command")]
pub enum ControlCommand {
    #[serde(rename = "STOP_WORKER")]
    StopWorker,
    #[serde(rename = "START_WORKER")]
    StartWorker,
    #[serde(rename = "UPDATE_CONFIG")]
    UpdateConfig {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_concurrent: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        poll_interval_ms: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn task_from_draft_assigns_identity_and_pending_status() {
        let draft = TaskDraft::new("extract", 7, json!({"doc": "a.pdf"}));
        let task = Task::from_draft(draft);

        assert!(!task.id.is_empty());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert_eq!(task.priority, 7);
        assert_eq!(task.created_at, task.updated_at);
    }

    #[test]
    fn remaining_before_deadline_ignores_absent_and_past_deadlines() {
        let now = Utc::now();
        let no_deadline = Task::from_draft(TaskDraft::new("extract", 5, json!({})));
        assert!(no_deadline.remaining_before_deadline(now).is_none());

        let ahead = Task::from_draft(
            TaskDraft::new("extract", 5, json!({})).with_deadline(now + Duration::minutes(5)),
        );
        let remaining = ahead.remaining_before_deadline(now).unwrap();
        assert!(remaining > Duration::zero());
        assert!(remaining <= Duration::minutes(5));

        let behind = Task::from_draft(
            TaskDraft::new("extract", 5, json!({})).with_deadline(now - Duration::seconds(1)),
        );
        assert!(behind.remaining_before_deadline(now).is_none());
    }

    #[test]
    fn task_status_serializes_uppercase() {
        let serialized = serde_json::to_string(&TaskStatus::Processing).unwrap();
        assert_eq!(serialized, "\"PROCESSING\"");
    }

    #[test]
    fn worker_liveness_respects_threshold() {
        let mut node = WorkerNode::new("node-1");
        let now = Utc::now();
        assert!(node.is_live(now, Duration::seconds(15)));

        node.last_heartbeat = now - Duration::seconds(20);
        assert!(!node.is_live(now, Duration::seconds(15)));

        node.last_heartbeat = now - Duration::seconds(10);
        node.status = WorkerStatus::Inactive;
        assert!(!node.is_live(now, Duration::seconds(15)));
    }

    #[test]
    fn filter_matches_any_when_empty() {
        let message = BrokerMessage::new(
            MessageType::StatusUpdate,
            MessageSender::new("node-1", "worker"),
            MessageRecipient::to_all(),
            json!({}),
        );
        assert!(MessageFilter::any().matches(&message));
    }

    #[test]
    fn filter_rejects_on_type_sender_priority_and_correlation() {
        let message = BrokerMessage::new(
            MessageType::TaskCompleted,
            MessageSender::new("node-1", "worker"),
            MessageRecipient::to_all(),
            json!({}),
        )
        .with_priority(3)
        .with_correlation_id("corr-1");

        assert!(!MessageFilter::for_types(vec![MessageType::TaskFailed]).matches(&message));

        let wrong_sender = MessageFilter {
            sender_kinds: Some(vec!["coordinator".to_string()]),
            ..MessageFilter::default()
        };
        assert!(!wrong_sender.matches(&message));

        let too_low = MessageFilter {
            min_priority: Some(5),
            ..MessageFilter::default()
        };
        assert!(!too_low.matches(&message));

        let wrong_correlation = MessageFilter {
            correlation_id: Some("corr-2".to_string()),
            ..MessageFilter::default()
        };
        assert!(!wrong_correlation.matches(&message));

        let exact = MessageFilter {
            message_types: Some(vec![MessageType::TaskCompleted]),
            sender_kinds: Some(vec!["worker".to_string()]),
            min_priority: Some(3),
            correlation_id: Some("corr-1".to_string()),
        };
        assert!(exact.matches(&message));
    }

    #[test]
    fn control_command_wire_format() {
        let raw = r#"{"command":"UPDATE_CONFIG","max_concurrent":8}"#;
        let command: ControlCommand = serde_json::from_str(raw).unwrap();
        assert_eq!(
            command,
            ControlCommand::UpdateConfig {
                max_concurrent: Some(8),
                poll_interval_ms: None,
            }
        );

        let stop: ControlCommand = serde_json::from_str(r#"{"command":"STOP_WORKER"}"#).unwrap();
        assert_eq!(stop, ControlCommand::StopWorker);
    }
}
