use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use taskmesh_config::QueueConfig;
use taskmesh_domain::entities::{
    CompletedEntry, FailedEntry, ProcessingEntry, Task, TaskDraft, TaskSnapshot, TaskStatus,
    MAX_PRIORITY,
};
use taskmesh_domain::events::{topics, TaskEvent};
use taskmesh_domain::ports::TaskStore;
use taskmesh_errors::{TaskMeshError, TaskMeshResult};

/// Store keys used by one named queue.
#[derive(Debug, Clone)]
struct QueueKeys {
    pending: String,
    processing: String,
    results: String,
    failures: String,
    redistributed: String,
}

impl QueueKeys {
    fn new(queue_name: &str) -> Self {
        Self {
            pending: format!("taskmesh:{queue_name}:pending"),
            processing: format!("taskmesh:{queue_name}:processing"),
            results: format!("taskmesh:{queue_name}:results"),
            failures: format!("taskmesh:{queue_name}:failures"),
            redistributed: format!("taskmesh:{queue_name}:redistributed"),
        }
    }
}

/// Pending-set score. Priority strictly dominates; within a priority an
/// earlier enqueue scores higher and therefore pops first. Every value is
/// exactly representable: priorities contribute at most 1e15 and epoch
/// milliseconds stay below 2^53. Same-millisecond ties fall back to the
/// store's member ordering, which pops the lexicographically greatest
/// member.
fn score_for(priority: u8, enqueued_at: DateTime<Utc>) -> f64 {
    priority as f64 * 1e14 - enqueued_at.timestamp_millis() as f64
}

/// Distributed priority queue over the shared store.
///
/// A `TaskQueue` is cheap to clone and safe to use from many tasks at once;
/// coordination happens entirely in the store. `node_id` names the node this
/// handle runs on and is recorded as the owner of every task it dequeues.
#[derive(Clone)]
pub struct TaskQueue {
    store: Arc<dyn TaskStore>,
    config: QueueConfig,
    keys: QueueKeys,
    node_id: String,
}

impl TaskQueue {
    pub fn new(store: Arc<dyn TaskStore>, config: QueueConfig, node_id: impl Into<String>) -> Self {
        let keys = QueueKeys::new(&config.name);
        Self {
            store,
            config,
            keys,
            node_id: node_id.into(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Validate the draft, assign identity and park the task in the pending
    /// set. Returns the assigned task id.
    pub async fn enqueue(&self, draft: TaskDraft) -> TaskMeshResult<String> {
        if draft.task_type.trim().is_empty() {
            return Err(TaskMeshError::validation("task_type must not be empty"));
        }
        if draft.priority > MAX_PRIORITY {
            return Err(TaskMeshError::validation(format!(
                "priority {} exceeds maximum {MAX_PRIORITY}",
                draft.priority
            )));
        }

        let task = Task::from_draft(draft);
        let member = serde_json::to_string(&task)?;
        let score = score_for(task.priority, task.created_at);
        self.store.zadd(&self.keys.pending, score, &member).await?;

        debug!(
            task_id = %task.id,
            task_type = %task.task_type,
            priority = task.priority,
            "task enqueued"
        );
        self.publish_event(topics::TASK_ADDED, TaskEvent::from_task(&task))
            .await;

        Ok(task.id)
    }

    /// Pop the highest-priority pending task and move it into processing
    /// under this node's lease. Returns `None` when the queue is empty.
    pub async fn dequeue(&self) -> TaskMeshResult<Option<Task>> {
        let Some((member, _score)) = self.store.zpopmax(&self.keys.pending).await? else {
            return Ok(None);
        };

        let mut task: Task = serde_json::from_str(&member)?;
        task.update_status(TaskStatus::Processing);

        let entry = ProcessingEntry::new(
            task.clone(),
            &self.node_id,
            Duration::seconds(self.config.lease_seconds as i64),
        );
        self.store
            .hset(&self.keys.processing, &task.id, &serde_json::to_string(&entry)?)
            .await?;

        debug!(task_id = %task.id, "task dequeued for processing");
        self.publish_event(topics::TASK_STARTED, TaskEvent::from_task(&task))
            .await;

        Ok(Some(task))
    }

    /// Settle a processing task as completed, recording its result.
    pub async fn complete(&self, task_id: &str, result: serde_json::Value) -> TaskMeshResult<()> {
        let entry = self.take_processing_entry(task_id).await?;

        let mut task = entry.task;
        task.update_status(TaskStatus::Completed);
        let record = CompletedEntry {
            task: task.clone(),
            result,
            completed_at: Utc::now(),
        };
        self.store
            .hset(&self.keys.results, task_id, &serde_json::to_string(&record)?)
            .await?;

        info!(task_id = %task.id, task_type = %task.task_type, "task completed");
        self.publish_event(topics::TASK_COMPLETED, TaskEvent::from_task(&task))
            .await;

        Ok(())
    }

    /// Settle a processing task as failed. While the attempt budget lasts
    /// the task goes straight back to pending with a bumped priority;
    /// afterwards it lands in the terminal failures collection.
    pub async fn fail(&self, task_id: &str, error: &str) -> TaskMeshResult<()> {
        let entry = self.take_processing_entry(task_id).await?;
        self.retry_or_fail(entry.task, error).await
    }

    /// Where a task currently lives: processing, completed or failed.
    /// Pending tasks are not indexed by id and report `None`.
    pub async fn get_status(&self, task_id: &str) -> TaskMeshResult<Option<TaskSnapshot>> {
        if let Some(raw) = self.store.hget(&self.keys.processing, task_id).await? {
            let entry: ProcessingEntry = serde_json::from_str(&raw)?;
            return Ok(Some(TaskSnapshot::Processing {
                task: entry.task,
                owner_node: entry.owner_node,
            }));
        }
        if let Some(raw) = self.store.hget(&self.keys.results, task_id).await? {
            let entry: CompletedEntry = serde_json::from_str(&raw)?;
            return Ok(Some(TaskSnapshot::Completed {
                task: entry.task,
                result: entry.result,
            }));
        }
        if let Some(raw) = self.store.hget(&self.keys.failures, task_id).await? {
            let entry: FailedEntry = serde_json::from_str(&raw)?;
            return Ok(Some(TaskSnapshot::Failed {
                task: entry.task,
                error: entry.error,
            }));
        }
        Ok(None)
    }

    /// Purge settled records older than the retention window. Returns the
    /// number of purged entries.
    pub async fn cleanup(&self) -> TaskMeshResult<u64> {
        let cutoff = Utc::now() - Duration::hours(self.config.retention_hours as i64);
        let mut purged = 0;

        for (task_id, raw) in self.store.hgetall(&self.keys.results).await? {
            let Ok(entry) = serde_json::from_str::<CompletedEntry>(&raw) else {
                warn!(task_id = %task_id, "unreadable result entry skipped by cleanup");
                continue;
            };
            if entry.completed_at < cutoff && self.store.hdel(&self.keys.results, &task_id).await? {
                purged += 1;
            }
        }

        for (task_id, raw) in self.store.hgetall(&self.keys.failures).await? {
            let Ok(entry) = serde_json::from_str::<FailedEntry>(&raw) else {
                warn!(task_id = %task_id, "unreadable failure entry skipped by cleanup");
                continue;
            };
            if entry.failed_at < cutoff && self.store.hdel(&self.keys.failures, &task_id).await? {
                purged += 1;
            }
        }

        if purged > 0 {
            info!(purged, "cleanup removed settled task records");
        }
        Ok(purged)
    }

    /// Requeue every processing entry whose lease has expired, through the
    /// normal retry path so a task that keeps taking its node down with it
    /// still exhausts its attempt budget. The redistributed collection is
    /// swept the same way: a parked task nobody claimed returns to pending
    /// once its lease runs out instead of staying parked forever. Returns
    /// the reclaimed count.
    pub async fn reclaim_expired(&self) -> TaskMeshResult<u64> {
        let now = Utc::now();
        let mut reclaimed = 0;

        for (task_id, raw) in self.store.hgetall(&self.keys.processing).await? {
            let Ok(entry) = serde_json::from_str::<ProcessingEntry>(&raw) else {
                warn!(task_id = %task_id, "unreadable processing entry skipped by reclaim");
                continue;
            };
            if !entry.lease_expired(now) {
                continue;
            }
            // The delete doubles as the claim: only one sweep gets `true`.
            if !self.store.hdel(&self.keys.processing, &task_id).await? {
                continue;
            }
            warn!(
                task_id = %task_id,
                owner_node = %entry.owner_node,
                "processing lease expired, requeueing"
            );
            let owner = entry.owner_node.clone();
            self.retry_or_fail(
                entry.task,
                &format!("processing lease expired on node {owner}"),
            )
            .await?;
            reclaimed += 1;
        }

        for (task_id, raw) in self.store.hgetall(&self.keys.redistributed).await? {
            let Ok(entry) = serde_json::from_str::<ProcessingEntry>(&raw) else {
                warn!(task_id = %task_id, "unreadable redistributed entry skipped by reclaim");
                continue;
            };
            if !entry.lease_expired(now) {
                continue;
            }
            if !self.store.hdel(&self.keys.redistributed, &task_id).await? {
                continue;
            }
            warn!(
                task_id = %task_id,
                owner_node = %entry.owner_node,
                "redistributed task found no claimant, requeueing"
            );
            let owner = entry.owner_node.clone();
            self.retry_or_fail(
                entry.task,
                &format!("no claimant for task redistributed from node {owner}"),
            )
            .await?;
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Put an already-identified task back into pending, keeping its id and
    /// retry count. Used when a task is reclaimed from a departed node.
    pub async fn requeue_existing(&self, mut task: Task) -> TaskMeshResult<()> {
        task.update_status(TaskStatus::Pending);
        let member = serde_json::to_string(&task)?;
        let score = score_for(task.priority, Utc::now());
        self.store.zadd(&self.keys.pending, score, &member).await?;
        debug!(task_id = %task.id, "task requeued");
        Ok(())
    }

    /// Move one processing entry into the redistributed collection. Returns
    /// the moved entry, or `None` if some other node moved or settled it
    /// first.
    pub async fn redistribute(&self, task_id: &str) -> TaskMeshResult<Option<ProcessingEntry>> {
        let Some(raw) = self.store.hget(&self.keys.processing, task_id).await? else {
            return Ok(None);
        };
        let entry: ProcessingEntry = serde_json::from_str(&raw)?;
        if !self.store.hdel(&self.keys.processing, task_id).await? {
            return Ok(None);
        }
        self.store
            .hset(&self.keys.redistributed, task_id, &raw)
            .await?;
        Ok(Some(entry))
    }

    /// Claim a redistributed task. The delete on the redistributed
    /// collection is the fence: among racing claimants exactly one receives
    /// the task, the rest get `None`.
    pub async fn claim_redistributed(&self, task_id: &str) -> TaskMeshResult<Option<Task>> {
        let Some(raw) = self.store.hget(&self.keys.redistributed, task_id).await? else {
            return Ok(None);
        };
        let entry: ProcessingEntry = serde_json::from_str(&raw)?;
        if !self.store.hdel(&self.keys.redistributed, task_id).await? {
            return Ok(None);
        }
        Ok(Some(entry.task))
    }

    /// Snapshot of every live processing entry, malformed records skipped.
    pub async fn processing_entries(&self) -> TaskMeshResult<Vec<ProcessingEntry>> {
        let mut entries = Vec::new();
        for (task_id, raw) in self.store.hgetall(&self.keys.processing).await? {
            match serde_json::from_str::<ProcessingEntry>(&raw) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(task_id = %task_id, "skipping unreadable processing entry: {}", e),
            }
        }
        Ok(entries)
    }

    pub async fn pending_count(&self) -> TaskMeshResult<u64> {
        self.store.zcard(&self.keys.pending).await
    }

    /// Remove a processing entry, treating the delete as a fence. A task
    /// that is no longer in processing (settled, reclaimed or moved by
    /// another node) reports `TaskNotFound`.
    async fn take_processing_entry(&self, task_id: &str) -> TaskMeshResult<ProcessingEntry> {
        let Some(raw) = self.store.hget(&self.keys.processing, task_id).await? else {
            return Err(TaskMeshError::task_not_found(task_id));
        };
        let entry: ProcessingEntry = serde_json::from_str(&raw)?;
        if !self.store.hdel(&self.keys.processing, task_id).await? {
            return Err(TaskMeshError::task_not_found(task_id));
        }
        Ok(entry)
    }

    /// Shared retry decision. Publishes `TASK_FAILED` in both branches so
    /// observers see every failed attempt, not only the terminal one.
    async fn retry_or_fail(&self, mut task: Task, error: &str) -> TaskMeshResult<()> {
        if task.retry_count < self.config.max_attempts {
            task.retry_count += 1;
            task.priority = (task.priority + 1).min(MAX_PRIORITY);
            task.update_status(TaskStatus::Pending);

            let member = serde_json::to_string(&task)?;
            let score = score_for(task.priority, Utc::now());
            self.store.zadd(&self.keys.pending, score, &member).await?;

            info!(
                task_id = %task.id,
                retry_count = task.retry_count,
                priority = task.priority,
                error,
                "task failed, requeued for retry"
            );
        } else {
            task.update_status(TaskStatus::Failed);
            let record = FailedEntry {
                task: task.clone(),
                error: error.to_string(),
                failed_at: Utc::now(),
            };
            self.store
                .hset(&self.keys.failures, &task.id, &serde_json::to_string(&record)?)
                .await?;

            warn!(
                task_id = %task.id,
                retry_count = task.retry_count,
                error,
                "task failed terminally"
            );
        }

        self.publish_event(
            topics::TASK_FAILED,
            TaskEvent::from_task(&task).with_error(error),
        )
        .await;
        Ok(())
    }

    /// Event delivery is best-effort: a publish failure must not undo a
    /// state transition that already happened.
    async fn publish_event(&self, topic: &str, event: TaskEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(topic, "failed to serialize task event: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.publish(topic, &payload).await {
            warn!(topic, task_id = %event.task_id, "failed to publish task event: {}", e);
        }
    }
}
