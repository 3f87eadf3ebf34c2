//! Worker execution-environment backend.
//!
//! The orchestrator treats the environment runtime as a narrow interface:
//! create/start/stop/remove one isolated environment, and list the ones we
//! tagged. Everything inside the environment (the automation runtime itself)
//! is an opaque HTTP service.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::RuntimeError;

pub mod docker;

pub use docker::DockerRuntime;

/// Label key identifying environments owned by this orchestrator.
pub const LABEL_KIND: &str = "orchestrator.kind";
/// Label key carrying the owning tenant id.
pub const LABEL_TENANT: &str = "orchestrator.tenant";
/// Label key carrying the requesting user id.
pub const LABEL_USER: &str = "orchestrator.user";
/// Label value for primary worker environments.
pub const KIND_WORKER: &str = "browser-agent";
/// Label value for live-view companions.
pub const KIND_COMPANION: &str = "browser-view";

/// One container-port → host-port binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container: u16,
    pub host: u16,
}

/// Everything needed to create one worker environment.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub ports: Vec<PortBinding>,
    /// Named-volume binds, `volume:/container/path`.
    pub volumes: Vec<String>,
    /// Memory limit string ("2g", "512m").
    pub memory: String,
    /// Shared-memory size string.
    pub shm_size: String,
    /// Fractional CPU limit.
    pub cpus: f64,
    pub network: String,
    pub labels: Vec<(String, String)>,
}

/// A worker environment as observed by the runtime (used by `reconcile`).
#[derive(Debug, Clone)]
pub struct ObservedWorker {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
    pub ports: Vec<PortBinding>,
}

/// Backend that owns the actual execution environments.
#[async_trait]
pub trait WorkerRuntime: Send + Sync {
    /// Create an environment from the spec. Returns the runtime's opaque id.
    async fn create(&self, spec: &WorkerSpec) -> Result<String, RuntimeError>;

    /// Start a created environment.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Request a graceful stop, waiting up to `grace` before the runtime
    /// kills the environment.
    async fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    /// Remove an environment by id or name. With `force`, a running
    /// environment is killed first; removing a missing one is not an error.
    async fn remove(&self, id_or_name: &str, force: bool) -> Result<(), RuntimeError>;

    /// List all environments (running or not) carrying `label_key=label_value`.
    async fn list_labeled(
        &self,
        label_key: &str,
        label_value: &str,
    ) -> Result<Vec<ObservedWorker>, RuntimeError>;
}
