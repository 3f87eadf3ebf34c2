//! Unified `Database` trait — single async interface for all persistence.
//!
//! Covers the task queue the dispatcher reads and writes, the tenant
//! records (worker endpoint override, credit counter), the connection-status
//! table, and the system-config flags. Any store offering these reads and
//! writes satisfies the gateway contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::dispatch::task::{NewTask, TaskRecord};
use crate::error::DatabaseError;

/// Connection state of a tenant's platform session.
#[derive(Debug, Clone)]
pub struct ConnectionStatus {
    pub tenant_id: String,
    pub is_connected: bool,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Backend-agnostic persistence trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Enqueue a new pending task. Returns the generated id.
    async fn insert_task(&self, task: &NewTask) -> Result<Uuid, DatabaseError>;

    /// Fetch a task by id.
    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Tasks in `running` state whose `started_at` is at or after `cutoff`.
    /// The single-flight gate ignores older rows as stale.
    async fn running_tasks_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// The oldest fresh pending task (`next_retry_at IS NULL`), ordered by
    /// priority then creation time.
    async fn next_fresh_task(&self) -> Result<Option<TaskRecord>, DatabaseError>;

    /// The most overdue eligible retry: `pending`, `retry_count < max_retries`,
    /// `next_retry_at <= now`, ordered by `next_retry_at`.
    async fn next_due_retry(
        &self,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Move a task to `running` with the given start time.
    async fn mark_task_running(&self, id: Uuid, now: DateTime<Utc>)
        -> Result<(), DatabaseError>;

    /// Terminal success: `completed`, retry fields reset, result stored.
    async fn complete_task(
        &self,
        id: Uuid,
        response: &serde_json::Value,
        iterations: Option<u32>,
        actions: Option<u32>,
    ) -> Result<(), DatabaseError>;

    /// Back to `pending` with retry bookkeeping; `started_at` is cleared.
    async fn reschedule_task(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), DatabaseError>;

    /// Terminal failure after the retry budget is exhausted.
    async fn fail_task(
        &self,
        id: Uuid,
        retry_count: u32,
        error_message: &str,
    ) -> Result<(), DatabaseError>;

    // ── Tenants ─────────────────────────────────────────────────────

    /// A tenant's configured worker endpoint, if any.
    async fn tenant_endpoint(&self, tenant_id: &str) -> Result<Option<String>, DatabaseError>;

    /// Record a tenant's worker endpoint override.
    async fn set_tenant_endpoint(
        &self,
        tenant_id: &str,
        endpoint: &str,
    ) -> Result<(), DatabaseError>;

    /// Remaining credits for a tenant (None if the tenant is unknown).
    async fn get_credits(&self, tenant_id: &str) -> Result<Option<i64>, DatabaseError>;

    /// Set a tenant's credit counter.
    async fn set_credits(&self, tenant_id: &str, credits: i64) -> Result<(), DatabaseError>;

    /// Decrement a tenant's credits by one, floored at zero. Returns the
    /// new value.
    async fn decrement_credits(&self, tenant_id: &str) -> Result<i64, DatabaseError>;

    // ── Connection status ───────────────────────────────────────────

    /// Flip a tenant's platform connection state.
    async fn set_connection_status(
        &self,
        tenant_id: &str,
        connected: bool,
        error: Option<&str>,
    ) -> Result<(), DatabaseError>;

    /// Current connection state, if recorded.
    async fn get_connection_status(
        &self,
        tenant_id: &str,
    ) -> Result<Option<ConnectionStatus>, DatabaseError>;

    // ── System config ───────────────────────────────────────────────

    /// Whether dispatch is globally paused (e.g. an upstream credential is
    /// known-expired).
    async fn automation_paused(&self) -> Result<bool, DatabaseError>;

    /// Flip the global dispatch pause flag.
    async fn set_automation_paused(&self, paused: bool) -> Result<(), DatabaseError>;
}
