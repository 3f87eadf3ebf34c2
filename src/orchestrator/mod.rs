//! Worker lifecycle: port slots, sessions, provisioning, health, reaping.

pub mod health;
pub mod manager;
pub mod ports;
pub mod reaper;
pub mod session;

pub use manager::LifecycleManager;
pub use session::{SessionRegistry, WorkerSession, WorkerStatus};
