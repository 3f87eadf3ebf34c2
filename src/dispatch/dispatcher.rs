//! Task dispatcher — the scheduler core.
//!
//! A tick runs strictly sequentially: feature gate, single-flight gate,
//! selection (fresh before retries), dispatch over HTTP, outcome handling
//! through the retry state machine, then the idempotent callback pass.
//! Ticks are additionally serialized by a mutex since the running-row gate
//! is a best-effort check against a shared store, not a lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::dispatch::callback::{CallbackHandler, ClassifierRules, ResultClass};
use crate::dispatch::retry::{RetryDecision, RetryState};
use crate::dispatch::task::{AgentTaskResponse, TaskRecord};
use crate::error::{DatabaseError, DispatchError};
use crate::orchestrator::session::{SessionRegistry, WorkerStatus};
use crate::store::Database;

/// What a single dispatcher tick did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickOutcome {
    /// Automation is globally paused; nothing was touched.
    Paused,
    /// Another task is in flight; single-flight gate refused to proceed.
    AlreadyRunning { task_id: Uuid },
    /// No eligible task.
    NoWork,
    /// Task dispatched and completed.
    Completed { task_id: Uuid },
    /// Task dispatched, failed, and was rescheduled with backoff.
    Rescheduled { task_id: Uuid, retry_count: u32 },
    /// Task dispatched, failed, and exhausted its retry budget.
    Exhausted { task_id: Uuid },
}

/// Drives pending tasks into tenant workers, one at a time system-wide.
pub struct Dispatcher {
    config: OrchestratorConfig,
    db: Arc<dyn Database>,
    registry: Arc<SessionRegistry>,
    callbacks: CallbackHandler,
    http: reqwest::Client,
    tick_lock: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        config: OrchestratorConfig,
        db: Arc<dyn Database>,
        registry: Arc<SessionRegistry>,
        rules: ClassifierRules,
    ) -> Self {
        let callbacks = CallbackHandler::new(Arc::clone(&db), rules);
        Self {
            config,
            db,
            registry,
            callbacks,
            http: reqwest::Client::new(),
            tick_lock: Mutex::new(()),
        }
    }

    /// Run one dispatch tick.
    pub async fn tick(&self) -> Result<TickOutcome, DatabaseError> {
        let _guard = self.tick_lock.lock().await;

        // Feature gate: upstream credential expired or operator pause.
        if self.db.automation_paused().await? {
            info!("dispatch paused, skipping tick");
            return Ok(TickOutcome::Paused);
        }

        // Single-flight gate. Rows older than the safety window are stale
        // leftovers of a crashed dispatch and no longer block.
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.running_safety_window)
                .unwrap_or(chrono::Duration::minutes(30));
        let running = self.db.running_tasks_since(cutoff).await?;
        if let Some(in_flight) = running.first() {
            info!(task_id = %in_flight.id, "task already running, skipping tick");
            return Ok(TickOutcome::AlreadyRunning {
                task_id: in_flight.id,
            });
        }

        // Selection: fresh tasks have strict priority over due retries.
        let task = match self.db.next_fresh_task().await? {
            Some(task) => task,
            None => match self
                .db
                .next_due_retry(Utc::now(), self.config.max_retries)
                .await?
            {
                Some(task) => task,
                None => return Ok(TickOutcome::NoWork),
            },
        };

        let attempt = if task.retry_count > 0 {
            format!("[retry {}/{}]", task.retry_count, self.config.max_retries)
        } else {
            "[fresh]".to_string()
        };
        info!(
            task_id = %task.id,
            tenant_id = %task.tenant_id,
            task_type = %task.task_type,
            attempt = %attempt,
            "dispatching task"
        );

        let agent_url = self.resolve_agent_url(&task.tenant_id).await?;
        self.db.mark_task_running(task.id, Utc::now()).await?;

        match self.call_agent(&agent_url, &task).await {
            Ok(agent) => self.handle_agent_result(&task, agent).await,
            Err(e) => {
                let reason = e.to_string();
                warn!(task_id = %task.id, error = %reason, "dispatch failed");
                let outcome = self.apply_failure(&task, &reason).await?;
                self.run_callback(&task, &reason).await;
                Ok(outcome)
            }
        }
    }

    /// Resolve the worker endpoint for a tenant.
    ///
    /// The live session registry wins (and the lookup counts as activity);
    /// then the tenant record's configured endpoint; then the static default
    /// address. The `/agent/task` suffix is appended when missing.
    async fn resolve_agent_url(&self, tenant_id: &str) -> Result<String, DatabaseError> {
        let base = match self.registry.get(tenant_id).await {
            Some(session) if session.status == WorkerStatus::Running => session.control_url,
            _ => match self.db.tenant_endpoint(tenant_id).await? {
                Some(endpoint) => endpoint,
                None => format!(
                    "http://{}:{}",
                    self.config.host_ip, self.config.control_port_base
                ),
            },
        };

        if base.ends_with("/agent/task") {
            Ok(base)
        } else {
            Ok(format!("{}/agent/task", base.trim_end_matches('/')))
        }
    }

    async fn call_agent(
        &self,
        url: &str,
        task: &TaskRecord,
    ) -> Result<AgentTaskResponse, DispatchError> {
        let body = serde_json::json!({
            "task": task.instructions,
            "taskId": task.id,
            "maxIterations": self.config.max_iterations,
        });

        let response = self
            .http
            .post(url)
            .json(&body)
            .timeout(self.config.dispatch_timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DispatchError::Timeout {
                        timeout: self.config.dispatch_timeout,
                    }
                } else {
                    DispatchError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 409 {
            // Worker busy with unrelated work; same bounded-retry policy as
            // any other failure.
            return Err(DispatchError::AgentStatus {
                status: 409,
                body: "Agent busy with another task".to_string(),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DispatchError::AgentStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<AgentTaskResponse>()
            .await
            .map_err(|e| DispatchError::InvalidResponse(e.to_string()))
    }

    async fn handle_agent_result(
        &self,
        task: &TaskRecord,
        agent: AgentTaskResponse,
    ) -> Result<TickOutcome, DatabaseError> {
        // The result text overrides the agent's own success flag in both
        // directions; only unmarked text falls back to the flag.
        let actual_success = match self.callbacks.rules().classify(&agent.result) {
            ResultClass::Success => true,
            ResultClass::Disconnected | ResultClass::PermanentError => false,
            ResultClass::Ambiguous => agent.success,
        };

        let outcome = if actual_success {
            let response = serde_json::json!({
                "result": agent.result,
                "success": true,
                "duration": agent.duration,
            });
            self.db
                .complete_task(task.id, &response, agent.iterations, agent.actions)
                .await?;
            info!(task_id = %task.id, "task completed");
            TickOutcome::Completed { task_id: task.id }
        } else {
            self.apply_failure(task, &agent.result).await?
        };

        self.run_callback(task, &agent.result).await;
        Ok(outcome)
    }

    /// Route a failure through the retry state machine and persist the
    /// decision. The only writer of `failed` and of retry bookkeeping.
    async fn apply_failure(
        &self,
        task: &TaskRecord,
        reason: &str,
    ) -> Result<TickOutcome, DatabaseError> {
        let state = RetryState::new(task.retry_count, self.config.max_retries);
        match state.on_failure(reason, Utc::now(), self.config.retry_delay) {
            RetryDecision::Reschedule {
                retry_count,
                next_retry_at,
                error_message,
            } => {
                self.db
                    .reschedule_task(task.id, retry_count, next_retry_at, &error_message)
                    .await?;
                info!(
                    task_id = %task.id,
                    retry_count,
                    next_retry_at = %next_retry_at,
                    "task rescheduled"
                );
                Ok(TickOutcome::Rescheduled {
                    task_id: task.id,
                    retry_count,
                })
            }
            RetryDecision::Exhausted {
                retry_count,
                error_message,
            } => {
                self.db
                    .fail_task(task.id, retry_count, &error_message)
                    .await?;
                warn!(task_id = %task.id, retry_count, "task permanently failed");
                Ok(TickOutcome::Exhausted { task_id: task.id })
            }
        }
    }

    /// Callback pass runs regardless of outcome; its failures are logged
    /// and never disturb the task row already written.
    async fn run_callback(&self, task: &TaskRecord, result_text: &str) {
        if let Err(e) = self.callbacks.apply(task, result_text).await {
            error!(task_id = %task.id, error = %e, "callback side effect failed");
        }
    }
}

/// Spawn the periodic dispatch loop. The first tick fires immediately.
pub fn spawn_dispatch_loop(dispatcher: Arc<Dispatcher>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "dispatch loop started");

        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            if let Err(e) = dispatcher.tick().await {
                error!(error = %e, "dispatch tick failed");
            }
        }
    })
}
