//! Worker session registry — in-memory map of tenant → worker session.
//!
//! The single source of truth for "is there a worker for tenant X and is it
//! alive". All mutations go through the registry's async interface; callers
//! never hold references into the map.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

/// Lifecycle state of a worker environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Creating,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerStatus::Creating => "creating",
            WorkerStatus::Running => "running",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Lazily provisioned live-view companion attached to a primary session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionWorker {
    pub worker_id: String,
    pub name: String,
    pub port: u16,
    pub url: String,
    pub status: WorkerStatus,
}

/// One worker session per tenant while a worker exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSession {
    pub tenant_id: String,
    pub user_id: String,
    /// Opaque handle from the execution environment.
    pub worker_id: String,
    /// Derived environment name (`browser-agent-<tenant>`).
    pub name: String,
    /// Host port bound to the worker's task/control endpoint.
    pub control_port: u16,
    /// Host port bound to the worker's live-view endpoint.
    pub view_port: u16,
    /// Slot owned by this session; unique across live sessions.
    pub port_index: usize,
    pub status: WorkerStatus,
    pub control_url: String,
    pub view_url: String,
    pub created_at: DateTime<Utc>,
    /// Bumped on every lookup/use; drives the idle reaper.
    pub last_activity: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub companion: Option<CompanionWorker>,
}

/// Summary fields for list endpoints.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub tenant_id: String,
    pub user_id: String,
    pub name: String,
    pub status: WorkerStatus,
    pub control_url: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl From<&WorkerSession> for SessionSummary {
    fn from(s: &WorkerSession) -> Self {
        Self {
            tenant_id: s.tenant_id.clone(),
            user_id: s.user_id.clone(),
            name: s.name.clone(),
            status: s.status,
            control_url: s.control_url.clone(),
            created_at: s.created_at,
            last_activity: s.last_activity,
        }
    }
}

/// Registry-wide counters.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total_workers: usize,
    pub running_workers: usize,
    pub max_workers: usize,
    pub available_slots: usize,
}

/// In-memory keyed store of worker sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, WorkerSession>>,
    max_workers: usize,
}

impl SessionRegistry {
    pub fn new(max_workers: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_workers,
        }
    }

    /// Look up a session, bumping `last_activity`.
    pub async fn get(&self, tenant_id: &str) -> Option<WorkerSession> {
        let mut sessions = self.sessions.write().await;
        let session = sessions.get_mut(tenant_id)?;
        session.last_activity = Utc::now();
        Some(session.clone())
    }

    /// Look up a session without touching `last_activity`.
    ///
    /// Used by the idle reaper, which must not keep sessions alive by
    /// inspecting them.
    pub async fn peek(&self, tenant_id: &str) -> Option<WorkerSession> {
        self.sessions.read().await.get(tenant_id).cloned()
    }

    /// Insert or replace a session.
    pub async fn insert(&self, session: WorkerSession) {
        self.sessions
            .write()
            .await
            .insert(session.tenant_id.clone(), session);
    }

    /// Remove a session, returning it if present.
    pub async fn remove(&self, tenant_id: &str) -> Option<WorkerSession> {
        self.sessions.write().await.remove(tenant_id)
    }

    /// Apply a mutation to an existing session. Returns false if absent.
    pub async fn update<F>(&self, tenant_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut WorkerSession),
    {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(tenant_id) {
            Some(session) => {
                f(session);
                true
            }
            None => false,
        }
    }

    /// Snapshot of all sessions.
    pub async fn all(&self) -> Vec<WorkerSession> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Port slots held by live sessions.
    pub async fn held_slots(&self) -> Vec<usize> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.port_index)
            .collect()
    }

    /// Count of sessions in `Running` state.
    pub async fn running_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.status == WorkerStatus::Running)
            .count()
    }

    /// Counts by status plus remaining capacity.
    pub async fn stats(&self) -> RegistryStats {
        let sessions = self.sessions.read().await;
        let running = sessions
            .values()
            .filter(|s| s.status == WorkerStatus::Running)
            .count();
        RegistryStats {
            total_workers: sessions.len(),
            running_workers: running,
            max_workers: self.max_workers,
            available_slots: self.max_workers.saturating_sub(running),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(tenant: &str, slot: usize, status: WorkerStatus) -> WorkerSession {
        WorkerSession {
            tenant_id: tenant.to_string(),
            user_id: "user".to_string(),
            worker_id: format!("w-{tenant}"),
            name: format!("browser-agent-{tenant}"),
            control_port: 10100 + slot as u16,
            view_port: 16000 + slot as u16,
            port_index: slot,
            status,
            control_url: format!("http://127.0.0.1:{}", 10100 + slot),
            view_url: format!("http://127.0.0.1:{}", 16000 + slot),
            created_at: Utc::now(),
            last_activity: Utc::now(),
            companion: None,
        }
    }

    #[tokio::test]
    async fn get_bumps_last_activity() {
        let registry = SessionRegistry::new(6);
        let mut s = session("1", 0, WorkerStatus::Running);
        s.last_activity = Utc::now() - chrono::Duration::hours(1);
        registry.insert(s).await;

        let fetched = registry.get("1").await.unwrap();
        assert!(Utc::now() - fetched.last_activity < chrono::Duration::seconds(5));
    }

    #[tokio::test]
    async fn peek_does_not_bump() {
        let registry = SessionRegistry::new(6);
        let stale = Utc::now() - chrono::Duration::hours(1);
        let mut s = session("1", 0, WorkerStatus::Running);
        s.last_activity = stale;
        registry.insert(s).await;

        let peeked = registry.peek("1").await.unwrap();
        assert_eq!(peeked.last_activity, stale);
    }

    #[tokio::test]
    async fn stats_count_running_and_capacity() {
        let registry = SessionRegistry::new(6);
        registry.insert(session("1", 0, WorkerStatus::Running)).await;
        registry.insert(session("2", 1, WorkerStatus::Stopped)).await;

        let stats = registry.stats().await;
        assert_eq!(stats.total_workers, 2);
        assert_eq!(stats.running_workers, 1);
        assert_eq!(stats.available_slots, 5);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let registry = SessionRegistry::new(6);
        registry.insert(session("1", 0, WorkerStatus::Running)).await;
        assert!(registry.remove("1").await.is_some());
        assert!(registry.remove("1").await.is_none());
    }
}
