//! Worker lifecycle manager.
//!
//! Creates, health-checks, and tears down one isolated execution environment
//! per tenant. Provision/deprovision run under a single lock so the port
//! allocator always scans a consistent snapshot of live sessions.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::ProvisionError;
use crate::orchestrator::health::wait_until_healthy;
use crate::orchestrator::ports::next_free_slot;
use crate::orchestrator::session::{
    CompanionWorker, SessionRegistry, WorkerSession, WorkerStatus,
};
use crate::runtime::{
    KIND_COMPANION, KIND_WORKER, LABEL_KIND, LABEL_TENANT, LABEL_USER, PortBinding, WorkerRuntime,
    WorkerSpec,
};

/// Service port inside a worker environment for the task/control endpoint.
const WORKER_CONTROL_PORT: u16 = 3000;
/// Service port inside a worker environment for the live view.
const WORKER_VIEW_PORT: u16 = 6080;
/// Grace period for a stop request before the runtime kills the environment.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Owns worker environments and the session registry.
pub struct LifecycleManager {
    config: OrchestratorConfig,
    runtime: Arc<dyn WorkerRuntime>,
    registry: Arc<SessionRegistry>,
    http: reqwest::Client,
    /// Serializes provision/deprovision; port allocation depends on a
    /// consistent view of held slots.
    provision_lock: Mutex<()>,
}

impl LifecycleManager {
    pub fn new(
        config: OrchestratorConfig,
        runtime: Arc<dyn WorkerRuntime>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            config,
            runtime,
            registry,
            http: reqwest::Client::new(),
            provision_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Provision a worker for a tenant, or return the existing one.
    ///
    /// Idempotent fast path: a `running` session just gets its activity
    /// refreshed. A failed create/start rolls back the speculative session
    /// so no slot stays held and no `creating` entry lingers.
    pub async fn provision(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<WorkerSession, ProvisionError> {
        // Fast path outside the lock; `get` bumps last_activity.
        if let Some(existing) = self.registry.get(tenant_id).await {
            if existing.status == WorkerStatus::Running {
                info!(tenant_id = %tenant_id, "worker already running, reusing session");
                return Ok(existing);
            }
        }

        let _guard = self.provision_lock.lock().await;

        // Re-check under the lock; a concurrent call may have won.
        if let Some(existing) = self.registry.get(tenant_id).await {
            if existing.status == WorkerStatus::Running {
                return Ok(existing);
            }
            // A dead or half-created session for this tenant: clear it out
            // and rebuild from scratch.
            self.registry.remove(tenant_id).await;
        }

        if self.registry.running_count().await >= self.config.max_workers {
            return Err(ProvisionError::CapacityExceeded {
                max: self.config.max_workers,
            });
        }

        let slot = next_free_slot(self.registry.held_slots().await, self.config.max_workers)?;
        let control_port = self.config.control_port_base + slot as u16;
        let view_port = self.config.view_port_base + slot as u16;
        let name = worker_name(tenant_id);

        info!(
            tenant_id = %tenant_id,
            slot,
            control_port,
            view_port,
            "provisioning worker"
        );

        // A stale environment with the same derived name blocks creation.
        if let Err(e) = self.runtime.remove(&name, true).await {
            warn!(name = %name, error = %e, "failed to remove stale environment");
        }

        let now = Utc::now();
        let mut session = WorkerSession {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.to_string(),
            worker_id: String::new(),
            name: name.clone(),
            control_port,
            view_port,
            port_index: slot,
            status: WorkerStatus::Creating,
            control_url: format!("http://{}:{}", self.config.host_ip, control_port),
            view_url: format!("http://{}:{}", self.config.host_ip, view_port),
            created_at: now,
            last_activity: now,
            companion: None,
        };

        // Record the session before creating so the slot is held; rolled
        // back on any failure below.
        self.registry.insert(session.clone()).await;

        let spec = self.worker_spec(&session);
        let worker_id = match self.runtime.create(&spec).await {
            Ok(id) => id,
            Err(e) => {
                self.registry.remove(tenant_id).await;
                error!(tenant_id = %tenant_id, error = %e, "worker creation failed");
                return Err(ProvisionError::Failed {
                    tenant_id: tenant_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        if let Err(e) = self.runtime.start(&worker_id).await {
            self.registry.remove(tenant_id).await;
            if let Err(rm) = self.runtime.remove(&worker_id, true).await {
                warn!(worker_id = %worker_id, error = %rm, "failed to remove half-started worker");
            }
            error!(tenant_id = %tenant_id, error = %e, "worker start failed");
            return Err(ProvisionError::Failed {
                tenant_id: tenant_id.to_string(),
                reason: e.to_string(),
            });
        }

        session.worker_id = worker_id.clone();
        session.status = WorkerStatus::Running;
        self.registry.insert(session.clone()).await;

        info!(tenant_id = %tenant_id, worker_id = %worker_id, "worker started");

        drop(_guard);

        // Non-fatal: a slow cold start just means the caller may reach the
        // worker before its first healthy probe.
        wait_until_healthy(&self.http, &session.control_url, self.config.health_timeout).await;

        Ok(session)
    }

    /// Tear down a tenant's worker. No-op if no session exists.
    ///
    /// The session is deleted from the registry even when stop/remove fail:
    /// the registry must never reference a worker the manager no longer
    /// tracks.
    pub async fn deprovision(&self, tenant_id: &str) {
        let _guard = self.provision_lock.lock().await;

        let Some(session) = self.registry.remove(tenant_id).await else {
            info!(tenant_id = %tenant_id, "deprovision: no session, nothing to do");
            return;
        };

        info!(tenant_id = %tenant_id, worker_id = %session.worker_id, "destroying worker");

        if let Some(companion) = &session.companion {
            self.destroy_environment(&companion.worker_id, &companion.name)
                .await;
        }

        let target = if session.worker_id.is_empty() {
            session.name.clone()
        } else {
            session.worker_id.clone()
        };
        self.destroy_environment(&target, &session.name).await;
    }

    async fn destroy_environment(&self, id: &str, name: &str) {
        if let Err(e) = self.runtime.stop(id, STOP_GRACE).await {
            warn!(name = %name, error = %e, "stop failed, forcing removal");
        }
        if let Err(e) = self.runtime.remove(id, true).await {
            warn!(name = %name, error = %e, "remove failed");
        }
    }

    /// Rebuild the registry from environments the runtime still knows about.
    ///
    /// Run on process start so an orchestrator restart does not orphan
    /// already-running workers.
    pub async fn reconcile(&self) {
        let _guard = self.provision_lock.lock().await;

        let observed = match self.runtime.list_labeled(LABEL_KIND, KIND_WORKER).await {
            Ok(list) => list,
            Err(e) => {
                error!(error = %e, "reconcile: failed to list workers");
                return;
            }
        };

        let mut recovered = 0usize;
        for worker in &observed {
            let Some(tenant_id) = worker.labels.get(LABEL_TENANT) else {
                continue;
            };
            let user_id = worker
                .labels
                .get(LABEL_USER)
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());

            let control_port = worker
                .ports
                .iter()
                .find(|b| b.container == WORKER_CONTROL_PORT)
                .map(|b| b.host)
                .unwrap_or(0);
            if control_port < self.config.control_port_base {
                warn!(name = %worker.name, control_port, "reconcile: unexpected port binding, skipping");
                continue;
            }
            let slot = (control_port - self.config.control_port_base) as usize;
            let view_port = worker
                .ports
                .iter()
                .find(|b| b.container == WORKER_VIEW_PORT)
                .map(|b| b.host)
                .unwrap_or(self.config.view_port_base + slot as u16);

            let now = Utc::now();
            let session = WorkerSession {
                tenant_id: tenant_id.clone(),
                user_id,
                worker_id: worker.id.clone(),
                name: worker.name.clone(),
                control_port,
                view_port,
                port_index: slot,
                status: if worker.running {
                    WorkerStatus::Running
                } else {
                    WorkerStatus::Stopped
                },
                control_url: format!("http://{}:{}", self.config.host_ip, control_port),
                view_url: format!("http://{}:{}", self.config.host_ip, view_port),
                created_at: now,
                last_activity: now,
                companion: None,
            };

            info!(tenant_id = %tenant_id, name = %worker.name, status = %session.status, "recovered session");
            self.registry.insert(session).await;
            recovered += 1;
        }

        // Reattach companions to their primaries.
        match self.runtime.list_labeled(LABEL_KIND, KIND_COMPANION).await {
            Ok(companions) => {
                for companion in companions {
                    let Some(tenant_id) = companion.labels.get(LABEL_TENANT).cloned() else {
                        continue;
                    };
                    let port = companion.ports.first().map(|b| b.host).unwrap_or(0);
                    let info = CompanionWorker {
                        worker_id: companion.id.clone(),
                        name: companion.name.clone(),
                        port,
                        url: format!("http://{}:{}", self.config.host_ip, port),
                        status: if companion.running {
                            WorkerStatus::Running
                        } else {
                            WorkerStatus::Stopped
                        },
                    };
                    self.registry
                        .update(&tenant_id, |s| s.companion = Some(info))
                        .await;
                }
            }
            Err(e) => warn!(error = %e, "reconcile: failed to list companions"),
        }

        info!(recovered, "reconcile complete");
    }

    /// Lazily provision the live-view companion for a tenant's primary
    /// worker. Idempotent while the companion is running.
    pub async fn provision_companion(
        &self,
        tenant_id: &str,
    ) -> Result<CompanionWorker, ProvisionError> {
        let _guard = self.provision_lock.lock().await;

        let Some(session) = self.registry.get(tenant_id).await else {
            return Err(ProvisionError::NoPrimary {
                tenant_id: tenant_id.to_string(),
            });
        };
        if session.status != WorkerStatus::Running {
            return Err(ProvisionError::NoPrimary {
                tenant_id: tenant_id.to_string(),
            });
        }
        if let Some(companion) = &session.companion {
            if companion.status == WorkerStatus::Running {
                return Ok(companion.clone());
            }
        }

        // Companion ports run in a parallel range keyed off the primary's
        // slot, so they can never collide with another tenant.
        let port = self.config.companion_port_base + session.port_index as u16;
        let name = companion_name(tenant_id);

        if let Err(e) = self.runtime.remove(&name, true).await {
            warn!(name = %name, error = %e, "failed to remove stale companion");
        }

        let spec = WorkerSpec {
            name: name.clone(),
            image: self.config.companion_image.clone(),
            env: vec![
                ("TENANT_ID".to_string(), tenant_id.to_string()),
                (
                    "VIEW_TARGET".to_string(),
                    format!("{}:{}", session.name, WORKER_VIEW_PORT),
                ),
            ],
            ports: vec![PortBinding {
                container: WORKER_VIEW_PORT,
                host: port,
            }],
            volumes: Vec::new(),
            memory: "512m".to_string(),
            shm_size: "64m".to_string(),
            cpus: 0.5,
            network: self.config.worker_network.clone(),
            labels: vec![
                (LABEL_KIND.to_string(), KIND_COMPANION.to_string()),
                (LABEL_TENANT.to_string(), tenant_id.to_string()),
            ],
        };

        let worker_id = self.runtime.create(&spec).await.map_err(|e| {
            ProvisionError::Failed {
                tenant_id: tenant_id.to_string(),
                reason: e.to_string(),
            }
        })?;

        if let Err(e) = self.runtime.start(&worker_id).await {
            if let Err(rm) = self.runtime.remove(&worker_id, true).await {
                warn!(worker_id = %worker_id, error = %rm, "failed to remove half-started companion");
            }
            return Err(ProvisionError::Failed {
                tenant_id: tenant_id.to_string(),
                reason: e.to_string(),
            });
        }

        let companion = CompanionWorker {
            worker_id,
            name,
            port,
            url: format!("http://{}:{}", self.config.host_ip, port),
            status: WorkerStatus::Running,
        };
        self.registry
            .update(tenant_id, |s| s.companion = Some(companion.clone()))
            .await;

        info!(tenant_id = %tenant_id, port, "companion started");
        Ok(companion)
    }

    /// Destroy a tenant's companion worker, leaving the primary untouched.
    /// No-op if none exists.
    pub async fn deprovision_companion(&self, tenant_id: &str) {
        let _guard = self.provision_lock.lock().await;

        let Some(session) = self.registry.peek(tenant_id).await else {
            return;
        };
        let Some(companion) = session.companion else {
            return;
        };

        self.destroy_environment(&companion.worker_id, &companion.name)
            .await;
        self.registry.update(tenant_id, |s| s.companion = None).await;
        info!(tenant_id = %tenant_id, "companion destroyed");
    }

    /// Destroy every session idle beyond `max_inactive`. Returns the number
    /// of sessions reaped. Per-session failures are logged, not propagated,
    /// so one bad worker cannot block the rest of the sweep.
    pub async fn cleanup_inactive(&self, max_inactive: Duration) -> usize {
        let now = Utc::now();
        let max_inactive =
            chrono::Duration::from_std(max_inactive).unwrap_or(chrono::Duration::minutes(30));

        let mut reaped = 0usize;
        for session in self.registry.all().await {
            let idle = now - session.last_activity;
            if idle > max_inactive {
                info!(
                    tenant_id = %session.tenant_id,
                    idle_minutes = idle.num_minutes(),
                    "reaping inactive session"
                );
                self.deprovision(&session.tenant_id).await;
                reaped += 1;
            }
        }
        reaped
    }

    fn worker_spec(&self, session: &WorkerSession) -> WorkerSpec {
        let proxy_port = self.config.proxy_port_base + session.port_index as u16;
        WorkerSpec {
            name: session.name.clone(),
            image: self.config.worker_image.clone(),
            env: vec![
                ("AGENT_PORT".to_string(), WORKER_CONTROL_PORT.to_string()),
                ("TENANT_ID".to_string(), session.tenant_id.clone()),
                ("TENANT_INDEX".to_string(), session.port_index.to_string()),
                ("PROFILES_DIR".to_string(), "/data/profiles".to_string()),
                ("HEADLESS".to_string(), "true".to_string()),
                (
                    "API_SECRET_KEY".to_string(),
                    self.config.api_secret_key.expose_secret().to_string(),
                ),
                ("PROXY_LOGIN".to_string(), self.config.proxy_login.clone()),
                (
                    "PROXY_PASSWORD".to_string(),
                    self.config.proxy_password.expose_secret().to_string(),
                ),
                ("PROXY_HOST".to_string(), self.config.proxy_host.clone()),
                ("PROXY_STICKY_PORT".to_string(), proxy_port.to_string()),
            ],
            ports: vec![
                PortBinding {
                    container: WORKER_CONTROL_PORT,
                    host: session.control_port,
                },
                PortBinding {
                    container: WORKER_VIEW_PORT,
                    host: session.view_port,
                },
            ],
            volumes: vec![format!(
                "{}:/data/profiles",
                self.config.profiles_volume
            )],
            memory: self.config.worker_memory.clone(),
            shm_size: self.config.worker_shm_size.clone(),
            cpus: self.config.worker_cpus,
            network: self.config.worker_network.clone(),
            labels: vec![
                (LABEL_KIND.to_string(), KIND_WORKER.to_string()),
                (LABEL_TENANT.to_string(), session.tenant_id.clone()),
                (LABEL_USER.to_string(), session.user_id.clone()),
            ],
        }
    }
}

/// Derived environment name for a tenant's primary worker.
pub fn worker_name(tenant_id: &str) -> String {
    format!("browser-agent-{tenant_id}")
}

/// Derived environment name for a tenant's companion.
pub fn companion_name(tenant_id: &str) -> String {
    format!("browser-view-{tenant_id}")
}
