//! Browser Orchestrator — per-tenant automation workers and task dispatch.
//!
//! Two independent entry points share the session registry and the task
//! store: the lifecycle manager provisions one isolated worker environment
//! per tenant, and the dispatcher drives pending tasks into those workers
//! one at a time.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod orchestrator;
pub mod runtime;
pub mod server;
pub mod store;
