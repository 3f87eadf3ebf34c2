//! Persisted task records — one per unit of dispatchable work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "running" => TaskStatus::Running,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }
}

/// A unit of dispatchable work.
///
/// Created by an external producer with `status = pending`,
/// `retry_count = 0`, `next_retry_at = NULL`. The dispatcher is the only
/// writer of `running`; the retry state machine is the only writer of
/// `completed`, `failed`, and retry bookkeeping. Terminal rows are never
/// deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub tenant_id: String,
    /// Tag used for callback routing ("login", "verify", "comment_reply").
    pub task_type: String,
    /// Opaque text sent to the worker.
    pub instructions: String,
    /// Tag-specific key/value data, consumed only by the callback handler.
    pub metadata: serde_json::Value,
    pub status: TaskStatus,
    /// Lower dispatches first.
    pub priority: i64,
    pub retry_count: u32,
    /// `None` = eligible immediately; otherwise a timestamp gate.
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Free-form result payload from the worker.
    pub response: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub iterations_used: Option<u32>,
    pub actions_taken: Option<u32>,
}

/// Fields a producer supplies when enqueueing work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTask {
    pub tenant_id: String,
    pub task_type: String,
    pub instructions: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: i64,
}

fn default_priority() -> i64 {
    100
}

/// Response body of a worker's `POST /agent/task`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTaskResponse {
    pub success: bool,
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub iterations: Option<u32>,
    #[serde(default)]
    pub actions: Option<u32>,
    #[serde(default)]
    pub duration: Option<f64>,
}
