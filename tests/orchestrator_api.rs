//! Integration tests for the worker management API.
//!
//! Each test spins up the real Axum router on a random port with a stub
//! worker runtime, and exercises the HTTP contract with reqwest.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use browser_orchestrator::config::OrchestratorConfig;
use browser_orchestrator::dispatch::{ClassifierRules, Dispatcher};
use browser_orchestrator::error::RuntimeError;
use browser_orchestrator::orchestrator::{LifecycleManager, SessionRegistry};
use browser_orchestrator::runtime::{ObservedWorker, WorkerRuntime, WorkerSpec};
use browser_orchestrator::server::{AppState, api_routes};
use browser_orchestrator::store::{Database, LibSqlBackend};

const API_KEY: &str = "test-secret";

/// In-memory worker runtime. Records specs, never touches Docker.
#[derive(Default)]
struct StubRuntime {
    counter: AtomicUsize,
    fail_create: AtomicBool,
    fail_start: AtomicBool,
    workers: Mutex<HashMap<String, (WorkerSpec, bool)>>,
}

impl StubRuntime {
    async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }
}

#[async_trait]
impl WorkerRuntime for StubRuntime {
    async fn create(&self, spec: &WorkerSpec) -> Result<String, RuntimeError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed("image missing".to_string()));
        }
        let id = format!("stub-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        self.workers
            .lock()
            .await
            .insert(id.clone(), (spec.clone(), false));
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::CommandFailed("won't start".to_string()));
        }
        let mut workers = self.workers.lock().await;
        match workers.get_mut(id) {
            Some(entry) => {
                entry.1 = true;
                Ok(())
            }
            None => Err(RuntimeError::NotFound { id: id.to_string() }),
        }
    }

    async fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        if let Some(entry) = self.workers.lock().await.get_mut(id) {
            entry.1 = false;
        }
        Ok(())
    }

    async fn remove(&self, id_or_name: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut workers = self.workers.lock().await;
        let by_id = workers.remove(id_or_name).is_some();
        if !by_id {
            workers.retain(|_, (spec, _)| spec.name != id_or_name);
        }
        Ok(())
    }

    async fn list_labeled(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ObservedWorker>, RuntimeError> {
        let workers = self.workers.lock().await;
        Ok(workers
            .iter()
            .filter(|(_, (spec, _))| {
                spec.labels
                    .iter()
                    .any(|(k, v)| k == label_key && v == label_value)
            })
            .map(|(id, (spec, running))| ObservedWorker {
                id: id.clone(),
                name: spec.name.clone(),
                running: *running,
                labels: spec.labels.iter().cloned().collect(),
                ports: spec.ports.clone(),
            })
            .collect())
    }
}

fn test_config(max_workers: usize) -> OrchestratorConfig {
    OrchestratorConfig {
        max_workers,
        api_secret_key: secrecy::SecretString::from(API_KEY.to_string()),
        // No real worker answers health probes in these tests.
        health_timeout: Duration::ZERO,
        ..OrchestratorConfig::default()
    }
}

/// Start the API on a random port. Returns the base URL and the runtime.
async fn start_server(max_workers: usize) -> (String, Arc<StubRuntime>) {
    let config = test_config(max_workers);
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let registry = Arc::new(SessionRegistry::new(config.max_workers));
    let runtime = Arc::new(StubRuntime::default());
    let manager = Arc::new(LifecycleManager::new(
        config.clone(),
        runtime.clone() as Arc<dyn WorkerRuntime>,
        Arc::clone(&registry),
    ));
    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        Arc::clone(&db),
        Arc::clone(&registry),
        ClassifierRules::default(),
    ));

    let app = api_routes(AppState {
        manager,
        registry,
        dispatcher,
        db,
        config,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (format!("http://127.0.0.1:{port}"), runtime)
}

fn client() -> reqwest::Client {
    reqwest::Client::new()
}

async fn provision(base: &str, tenant: &str) -> reqwest::Response {
    client()
        .post(format!("{base}/workers"))
        .header("x-api-key", API_KEY)
        .json(&serde_json::json!({"tenantId": tenant, "userId": "u1"}))
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn provision_returns_created_session() {
    let (base, _runtime) = start_server(6).await;

    let response = provision(&base, "58").await;
    assert_eq!(response.status(), 201);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["tenantId"], "58");
    assert_eq!(body["status"], "running");
    assert_eq!(body["portIndex"], 0);
    assert!(body["controlUrl"].as_str().unwrap().contains(":10100"));
}

#[tokio::test]
async fn provision_is_idempotent_per_tenant() {
    let (base, runtime) = start_server(6).await;

    let first: serde_json::Value = provision(&base, "58").await.json().await.unwrap();
    let second: serde_json::Value = provision(&base, "58").await.json().await.unwrap();

    assert_eq!(first["workerId"], second["workerId"]);
    assert_eq!(second["portIndex"], 0);
    assert_eq!(runtime.worker_count().await, 1);
}

#[tokio::test]
async fn capacity_ceiling_returns_429() {
    let (base, _runtime) = start_server(2).await;

    assert_eq!(provision(&base, "1").await.status(), 201);
    assert_eq!(provision(&base, "2").await.status(), 201);

    let third = provision(&base, "3").await;
    assert_eq!(third.status(), 429);

    // The failed call allocated nothing.
    let list: serde_json::Value = client()
        .get(format!("{base}/workers"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list["count"], 2);
}

#[tokio::test]
async fn port_slots_are_unique_and_reused() {
    let (base, _runtime) = start_server(6).await;

    let s58: serde_json::Value = provision(&base, "58").await.json().await.unwrap();
    assert_eq!(s58["portIndex"], 0);
    let s59: serde_json::Value = provision(&base, "59").await.json().await.unwrap();
    assert_eq!(s59["portIndex"], 1);

    let del = client()
        .delete(format!("{base}/workers/58"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(del.status(), 200);

    let get_58 = client()
        .get(format!("{base}/workers/58"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(get_58.status(), 404);

    // Slot 0 was released and is handed to the next tenant.
    let s60: serde_json::Value = provision(&base, "60").await.json().await.unwrap();
    assert_eq!(s60["portIndex"], 0);
}

#[tokio::test]
async fn delete_missing_worker_is_a_noop() {
    let (base, _runtime) = start_server(6).await;

    let response = client()
        .delete(format!("{base}/workers/ghost"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
}

#[tokio::test]
async fn failed_provision_rolls_back_session() {
    let (base, runtime) = start_server(6).await;
    runtime.fail_start.store(true, Ordering::SeqCst);

    let response = provision(&base, "58").await;
    assert_eq!(response.status(), 500);

    // No dangling `creating` session, and the slot is free again.
    let get = client()
        .get(format!("{base}/workers/58"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(get.status(), 404);

    runtime.fail_start.store(false, Ordering::SeqCst);
    let retry: serde_json::Value = provision(&base, "58").await.json().await.unwrap();
    assert_eq!(retry["portIndex"], 0);
    assert_eq!(retry["status"], "running");
}

#[tokio::test]
async fn heartbeat_refreshes_and_404s_on_missing() {
    let (base, _runtime) = start_server(6).await;
    provision(&base, "58").await;

    let beat = client()
        .post(format!("{base}/workers/58/heartbeat"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(beat.status(), 200);
    let body: serde_json::Value = beat.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert!(body["lastActivity"].is_string());

    let missing = client()
        .post(format!("{base}/workers/ghost/heartbeat"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test]
async fn manual_cleanup_reaps_idle_sessions() {
    let (base, runtime) = start_server(6).await;
    provision(&base, "58").await;
    assert_eq!(runtime.worker_count().await, 1);

    // Zero tolerance: every session counts as idle.
    let response = client()
        .post(format!("{base}/cleanup"))
        .header("x-api-key", API_KEY)
        .json(&serde_json::json!({"maxInactiveMinutes": 0}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["reaped"], 1);
    assert_eq!(runtime.worker_count().await, 0);
}

#[tokio::test]
async fn companion_requires_running_primary() {
    let (base, _runtime) = start_server(6).await;

    let orphan = client()
        .post(format!("{base}/workers/58/companion"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(orphan.status(), 404);

    provision(&base, "58").await;
    let attached = client()
        .post(format!("{base}/workers/58/companion"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(attached.status(), 201);
    let body: serde_json::Value = attached.json().await.unwrap();
    assert!(body["viewUrl"].as_str().unwrap().contains(":17000"));

    // Companion teardown leaves the primary alone.
    let detach = client()
        .delete(format!("{base}/workers/58/companion"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(detach.status(), 200);

    let primary = client()
        .get(format!("{base}/workers/58"))
        .header("x-api-key", API_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(primary.status(), 200);
}

#[tokio::test]
async fn auth_gates_everything_but_health() {
    let (base, _runtime) = start_server(6).await;

    let unauthed = client()
        .get(format!("{base}/workers"))
        .send()
        .await
        .unwrap();
    assert_eq!(unauthed.status(), 401);

    let wrong_key = client()
        .get(format!("{base}/workers"))
        .header("x-api-key", "nope")
        .send()
        .await
        .unwrap();
    assert_eq!(wrong_key.status(), 401);

    let health = client().get(format!("{base}/health")).send().await.unwrap();
    assert_eq!(health.status(), 200);
    let body: serde_json::Value = health.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["stats"]["maxWorkers"], 6);
}

#[tokio::test]
async fn reconcile_rebuilds_registry_from_runtime() {
    let config = test_config(6);
    let registry = Arc::new(SessionRegistry::new(config.max_workers));
    let runtime = Arc::new(StubRuntime::default());
    let manager = Arc::new(LifecycleManager::new(
        config.clone(),
        runtime.clone() as Arc<dyn WorkerRuntime>,
        Arc::clone(&registry),
    ));

    manager.provision("58", "u1").await.unwrap();
    manager.provision("59", "u1").await.unwrap();

    // Simulate an orchestrator restart: fresh registry, same runtime state.
    let registry2 = Arc::new(SessionRegistry::new(config.max_workers));
    let manager2 = Arc::new(LifecycleManager::new(
        config,
        runtime as Arc<dyn WorkerRuntime>,
        Arc::clone(&registry2),
    ));
    manager2.reconcile().await;

    let recovered = registry2.get("58").await.expect("session 58 recovered");
    assert_eq!(recovered.port_index, 0);
    assert_eq!(recovered.control_port, 10100);
    assert!(registry2.get("59").await.is_some());
    assert_eq!(registry2.stats().await.running_workers, 2);
}
