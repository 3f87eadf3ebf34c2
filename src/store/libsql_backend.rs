//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. All timestamps are written
//! as RFC 3339 and parsed back leniently.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::dispatch::task::{NewTask, TaskRecord, TaskStatus};
use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{ConnectionStatus, Database};

/// Column list shared by every task query.
const TASK_COLUMNS: &str = "id, tenant_id, task_type, instructions, metadata, status, priority, \
     retry_count, next_retry_at, created_at, started_at, completed_at, response, \
     error_message, iterations_used, actions_taken";

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    async fn query_one_task(
        &self,
        sql: &str,
        query_params: impl libsql::params::IntoParams,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(sql, query_params)
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

/// Map a libsql Row to a TaskRecord. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let get_str = |idx: i32| -> Result<String, DatabaseError> {
        row.get(idx)
            .map_err(|e| DatabaseError::Query(format!("column {idx}: {e}")))
    };

    let id_str = get_str(0)?;
    let metadata_str = get_str(4)?;
    let status_str = get_str(5)?;
    let priority: i64 = row
        .get(6)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let retry_count: i64 = row
        .get(7)
        .map_err(|e| DatabaseError::Query(e.to_string()))?;
    let next_retry_at: Option<String> = row.get(8).ok();
    let created_at = get_str(9)?;
    let started_at: Option<String> = row.get(10).ok();
    let completed_at: Option<String> = row.get(11).ok();
    let response_str: Option<String> = row.get(12).ok();
    let error_message: Option<String> = row.get(13).ok();
    let iterations_used: Option<i64> = row.get(14).ok();
    let actions_taken: Option<i64> = row.get(15).ok();

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task id {id_str}: {e}")))?;
    let metadata = serde_json::from_str(&metadata_str)
        .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
    let response = response_str.and_then(|s| serde_json::from_str(&s).ok());

    Ok(TaskRecord {
        id,
        tenant_id: get_str(1)?,
        task_type: get_str(2)?,
        instructions: get_str(3)?,
        metadata,
        status: TaskStatus::parse(&status_str),
        priority,
        retry_count: retry_count.max(0) as u32,
        next_retry_at: parse_optional_datetime(next_retry_at),
        created_at: parse_datetime(&created_at),
        started_at: parse_optional_datetime(started_at),
        completed_at: parse_optional_datetime(completed_at),
        response,
        error_message,
        iterations_used: iterations_used.map(|i| i.max(0) as u32),
        actions_taken: actions_taken.map(|i| i.max(0) as u32),
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run(&self.conn).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &NewTask) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let metadata = serde_json::to_string(&task.metadata)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO tasks (id, tenant_id, task_type, instructions, metadata, status, \
                 priority, retry_count, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, 0, ?7)",
                params![
                    id.to_string(),
                    task.tenant_id.clone(),
                    task.task_type.clone(),
                    task.instructions.clone(),
                    metadata,
                    task.priority,
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(id)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<TaskRecord>, DatabaseError> {
        self.query_one_task(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
    }

    async fn running_tasks_since(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status = 'running' AND started_at >= ?1"
                ),
                params![cutoff.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn next_fresh_task(&self) -> Result<Option<TaskRecord>, DatabaseError> {
        self.query_one_task(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE status = 'pending' AND next_retry_at IS NULL \
                 ORDER BY priority ASC, created_at ASC LIMIT 1"
            ),
            (),
        )
        .await
    }

    async fn next_due_retry(
        &self,
        now: DateTime<Utc>,
        max_retries: u32,
    ) -> Result<Option<TaskRecord>, DatabaseError> {
        self.query_one_task(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks \
                 WHERE status = 'pending' AND retry_count < ?1 \
                   AND next_retry_at IS NOT NULL AND next_retry_at <= ?2 \
                 ORDER BY next_retry_at ASC LIMIT 1"
            ),
            params![max_retries as i64, now.to_rfc3339()],
        )
        .await
    }

    async fn mark_task_running(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE tasks SET status = 'running', started_at = ?2 WHERE id = ?1",
                params![id.to_string(), now.to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn complete_task(
        &self,
        id: Uuid,
        response: &serde_json::Value,
        iterations: Option<u32>,
        actions: Option<u32>,
    ) -> Result<(), DatabaseError> {
        let response = serde_json::to_string(response)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        self.conn
            .execute(
                "UPDATE tasks SET status = 'completed', completed_at = ?2, response = ?3, \
                 iterations_used = ?4, actions_taken = ?5, error_message = NULL, \
                 retry_count = 0, next_retry_at = NULL \
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    Utc::now().to_rfc3339(),
                    response,
                    iterations.map(|i| i as i64),
                    actions.map(|a| a as i64),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn reschedule_task(
        &self,
        id: Uuid,
        retry_count: u32,
        next_retry_at: DateTime<Utc>,
        error_message: &str,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE tasks SET status = 'pending', started_at = NULL, retry_count = ?2, \
                 next_retry_at = ?3, error_message = ?4 \
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    retry_count as i64,
                    next_retry_at.to_rfc3339(),
                    error_message,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn fail_task(
        &self,
        id: Uuid,
        retry_count: u32,
        error_message: &str,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE tasks SET status = 'failed', completed_at = ?2, retry_count = ?3, \
                 next_retry_at = NULL, error_message = ?4 \
                 WHERE id = ?1",
                params![
                    id.to_string(),
                    Utc::now().to_rfc3339(),
                    retry_count as i64,
                    error_message,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    // ── Tenants ─────────────────────────────────────────────────────

    async fn tenant_endpoint(&self, tenant_id: &str) -> Result<Option<String>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT endpoint_url FROM tenants WHERE tenant_id = ?1",
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(row.get::<String>(0).ok().filter(|s| !s.is_empty())),
            None => Ok(None),
        }
    }

    async fn set_tenant_endpoint(
        &self,
        tenant_id: &str,
        endpoint: &str,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO tenants (tenant_id, endpoint_url, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(tenant_id) DO UPDATE SET endpoint_url = ?2, updated_at = ?3",
                params![tenant_id, endpoint, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn get_credits(&self, tenant_id: &str) -> Result<Option<i64>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT credits FROM tenants WHERE tenant_id = ?1",
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => Ok(Some(
                row.get::<i64>(0)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn set_credits(&self, tenant_id: &str, credits: i64) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO tenants (tenant_id, credits, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(tenant_id) DO UPDATE SET credits = ?2, updated_at = ?3",
                params![tenant_id, credits, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }

    async fn decrement_credits(&self, tenant_id: &str) -> Result<i64, DatabaseError> {
        self.conn
            .execute(
                "UPDATE tenants SET credits = MAX(credits - 1, 0), updated_at = ?2 \
                 WHERE tenant_id = ?1",
                params![tenant_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(self.get_credits(tenant_id).await?.unwrap_or(0))
    }

    // ── Connection status ───────────────────────────────────────────

    async fn set_connection_status(
        &self,
        tenant_id: &str,
        connected: bool,
        error: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        if connected {
            self.conn
                .execute(
                    "INSERT INTO connection_status (tenant_id, is_connected, connected_at, last_error, last_error_at) \
                     VALUES (?1, 1, ?2, NULL, NULL) \
                     ON CONFLICT(tenant_id) DO UPDATE SET \
                       is_connected = 1, connected_at = ?2, last_error = NULL, last_error_at = NULL",
                    params![tenant_id, now],
                )
                .await
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
        } else {
            self.conn
                .execute(
                    "INSERT INTO connection_status (tenant_id, is_connected, last_error, last_error_at) \
                     VALUES (?1, 0, ?2, ?3) \
                     ON CONFLICT(tenant_id) DO UPDATE SET \
                       is_connected = 0, last_error = ?2, last_error_at = ?3",
                    params![tenant_id, error.unwrap_or("unknown"), now],
                )
                .await
                .map_err(|e| DatabaseError::Query(e.to_string()))?;
        }
        Ok(())
    }

    async fn get_connection_status(
        &self,
        tenant_id: &str,
    ) -> Result<Option<ConnectionStatus>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT tenant_id, is_connected, connected_at, last_error, last_error_at \
                 FROM connection_status WHERE tenant_id = ?1",
                params![tenant_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let is_connected: i64 = row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(Some(ConnectionStatus {
                    tenant_id: row
                        .get(0)
                        .map_err(|e| DatabaseError::Query(e.to_string()))?,
                    is_connected: is_connected != 0,
                    connected_at: parse_optional_datetime(row.get(2).ok()),
                    last_error: row.get(3).ok(),
                    last_error_at: parse_optional_datetime(row.get(4).ok()),
                }))
            }
            None => Ok(None),
        }
    }

    // ── System config ───────────────────────────────────────────────

    async fn automation_paused(&self) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT value FROM system_config WHERE key = 'automation_paused'",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?
        {
            Some(row) => {
                let value: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(e.to_string()))?;
                Ok(value == "true")
            }
            None => Ok(false),
        }
    }

    async fn set_automation_paused(&self, paused: bool) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO system_config (key, value) VALUES ('automation_paused', ?1) \
                 ON CONFLICT(key) DO UPDATE SET value = ?1",
                params![if paused { "true" } else { "false" }],
            )
            .await
            .map_err(|e| DatabaseError::Query(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_task(tenant: &str, task_type: &str) -> NewTask {
        NewTask {
            tenant_id: tenant.to_string(),
            task_type: task_type.to_string(),
            instructions: "reply to the comment".to_string(),
            metadata: serde_json::json!({}),
            priority: 100,
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.insert_task(&new_task("58", "comment_reply")).await.unwrap();

        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.tenant_id, "58");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
        assert!(task.next_retry_at.is_none());
        assert!(task.started_at.is_none());
    }

    #[tokio::test]
    async fn fresh_tasks_ordered_by_priority_then_age() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let mut low = new_task("58", "comment_reply");
        low.priority = 200;
        let low_id = db.insert_task(&low).await.unwrap();
        let mut high = new_task("58", "comment_reply");
        high.priority = 50;
        let high_id = db.insert_task(&high).await.unwrap();

        let next = db.next_fresh_task().await.unwrap().unwrap();
        assert_eq!(next.id, high_id);

        db.mark_task_running(high_id, Utc::now()).await.unwrap();
        // With the high-priority task running, selection would not happen at
        // all (single-flight), but the fresh query itself must fall through.
        let next = db.next_fresh_task().await.unwrap().unwrap();
        assert_eq!(next.id, low_id);
    }

    #[tokio::test]
    async fn retry_query_respects_due_time_and_budget() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.insert_task(&new_task("58", "comment_reply")).await.unwrap();
        let now = Utc::now();

        db.reschedule_task(id, 1, now + chrono::Duration::minutes(5), "[Retry 1/3] busy")
            .await
            .unwrap();

        // A rescheduled task is no longer fresh.
        assert!(db.next_fresh_task().await.unwrap().is_none());
        // Not due yet.
        assert!(db.next_due_retry(now, 3).await.unwrap().is_none());
        // Due once the gate passes.
        let due = db
            .next_due_retry(now + chrono::Duration::minutes(6), 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(due.id, id);
        assert_eq!(due.retry_count, 1);

        // Budget exhausted rows never come back.
        db.reschedule_task(id, 3, now, "[Retry 3/3] busy").await.unwrap();
        assert!(db
            .next_due_retry(now + chrono::Duration::minutes(6), 3)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn complete_resets_retry_fields() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.insert_task(&new_task("58", "comment_reply")).await.unwrap();
        db.reschedule_task(id, 2, Utc::now(), "[Retry 2/3] flaky")
            .await
            .unwrap();

        db.complete_task(id, &serde_json::json!({"result": "ok"}), Some(7), Some(12))
            .await
            .unwrap();

        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 0);
        assert!(task.next_retry_at.is_none());
        assert!(task.error_message.is_none());
        assert_eq!(task.iterations_used, Some(7));
        assert_eq!(task.response.unwrap()["result"], "ok");
    }

    #[tokio::test]
    async fn running_gate_ignores_stale_rows() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db.insert_task(&new_task("58", "comment_reply")).await.unwrap();
        let stale_start = Utc::now() - chrono::Duration::hours(2);
        db.mark_task_running(id, stale_start).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::minutes(30);
        assert!(db.running_tasks_since(cutoff).await.unwrap().is_empty());

        let fresh = db.insert_task(&new_task("59", "login")).await.unwrap();
        db.mark_task_running(fresh, Utc::now()).await.unwrap();
        assert_eq!(db.running_tasks_since(cutoff).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn credits_floor_at_zero() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.set_credits("58", 1).await.unwrap();
        assert_eq!(db.decrement_credits("58").await.unwrap(), 0);
        assert_eq!(db.decrement_credits("58").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn connection_status_flips() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.set_connection_status("58", false, Some("Session disconnected"))
            .await
            .unwrap();
        let status = db.get_connection_status("58").await.unwrap().unwrap();
        assert!(!status.is_connected);
        assert_eq!(status.last_error.as_deref(), Some("Session disconnected"));

        db.set_connection_status("58", true, None).await.unwrap();
        let status = db.get_connection_status("58").await.unwrap().unwrap();
        assert!(status.is_connected);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn automation_pause_flag() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(!db.automation_paused().await.unwrap());
        db.set_automation_paused(true).await.unwrap();
        assert!(db.automation_paused().await.unwrap());
        db.set_automation_paused(false).await.unwrap();
        assert!(!db.automation_paused().await.unwrap());
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.db");

        let id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.insert_task(&new_task("58", "comment_reply")).await.unwrap()
        };

        // Reopening runs migrations again (a no-op) and sees the row.
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let task = db.get_task(id).await.unwrap().unwrap();
        assert_eq!(task.tenant_id, "58");
    }
}
