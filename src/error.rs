//! Error types for the orchestrator.

use std::time::Duration;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Provision error: {0}")]
    Provision(#[from] ProvisionError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Worker provisioning errors, surfaced to management-API callers.
#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    /// All worker slots are held. Surfaced as a rate-limit-style response,
    /// never retried internally.
    #[error("Maximum workers ({max}) reached")]
    CapacityExceeded { max: usize },

    /// Worker creation or start failed. The speculative session has already
    /// been rolled back when this is returned.
    #[error("Failed to provision worker for tenant {tenant_id}: {reason}")]
    Failed { tenant_id: String, reason: String },

    #[error("No worker session for tenant {tenant_id}")]
    NotFound { tenant_id: String },

    /// Companion workers require a running primary session.
    #[error("No primary worker for tenant {tenant_id}, cannot attach companion")]
    NoPrimary { tenant_id: String },
}

/// Errors from the worker execution-environment backend.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Runtime command failed: {0}")]
    CommandFailed(String),

    #[error("Runtime command timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Worker {id} not found in runtime")]
    NotFound { id: String },

    #[error("Invalid runtime response: {0}")]
    InvalidResponse(String),
}

/// Task dispatch errors. These are internal: they route through the retry
/// state machine and are never surfaced raw to an external caller.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Agent returned {status}: {body}")]
    AgentStatus { status: u16, body: String },

    #[error("Agent request failed: {0}")]
    Http(String),

    #[error("Agent request timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Invalid agent response: {0}")]
    InvalidResponse(String),
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;
