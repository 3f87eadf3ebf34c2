//! Management API server.

pub mod auth;
pub mod routes;

pub use routes::{AppState, api_routes};
