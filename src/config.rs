//! Configuration types.

use std::time::Duration;

use secrecy::SecretString;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Host address workers are reachable on.
    pub host_ip: String,
    /// Image used for primary worker environments.
    pub worker_image: String,
    /// Image used for live-view companion environments.
    pub companion_image: String,
    /// Maximum concurrently provisioned workers (= size of the port pool).
    pub max_workers: usize,
    /// Base host port for worker control endpoints; slot N binds base + N.
    pub control_port_base: u16,
    /// Base host port for worker live-view endpoints.
    pub view_port_base: u16,
    /// Base host port for companion workers.
    pub companion_port_base: u16,
    /// Base upstream sticky-proxy port handed to each worker.
    pub proxy_port_base: u16,
    /// Memory limit per worker ("2g", "512m").
    pub worker_memory: String,
    /// Shared-memory size per worker.
    pub worker_shm_size: String,
    /// CPU limit per worker (fractional cores).
    pub worker_cpus: f64,
    /// Runtime network workers are attached to.
    pub worker_network: String,
    /// Named volume for persistent browser profiles.
    pub profiles_volume: String,
    /// Shared secret gating the management API. Empty disables auth.
    pub api_secret_key: SecretString,
    /// Upstream proxy credentials forwarded into worker environments.
    pub proxy_login: String,
    pub proxy_password: SecretString,
    pub proxy_host: String,
    /// Sessions idle beyond this are reaped.
    pub session_timeout: Duration,
    /// Interval between idle-reaper sweeps.
    pub cleanup_interval: Duration,
    /// Interval between dispatcher ticks.
    pub dispatch_interval: Duration,
    /// Health-poll budget after worker start; expiry is non-fatal.
    pub health_timeout: Duration,
    /// Timeout for a single task dispatch to a worker.
    pub dispatch_timeout: Duration,
    /// A `running` task older than this is considered stale and no longer
    /// blocks the single-flight gate.
    pub running_safety_window: Duration,
    /// Maximum dispatch attempts per task.
    pub max_retries: u32,
    /// Fixed delay before a failed task becomes eligible again.
    pub retry_delay: Duration,
    /// Step budget handed to the agent per task.
    pub max_iterations: u32,
    /// Management API listen port.
    pub api_port: u16,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            worker_image: "browser-agent:latest".to_string(),
            companion_image: "browser-view:latest".to_string(),
            max_workers: 6,
            control_port_base: 10100,
            view_port_base: 16000,
            companion_port_base: 17000,
            proxy_port_base: 10000,
            worker_memory: "2g".to_string(),
            worker_shm_size: "1g".to_string(),
            worker_cpus: 1.0,
            worker_network: "browser-agent-net".to_string(),
            profiles_volume: "browser-profiles".to_string(),
            api_secret_key: SecretString::from(String::new()),
            proxy_login: String::new(),
            proxy_password: SecretString::from(String::new()),
            proxy_host: String::new(),
            session_timeout: Duration::from_secs(30 * 60),
            cleanup_interval: Duration::from_secs(5 * 60),
            dispatch_interval: Duration::from_secs(60),
            health_timeout: Duration::from_secs(30),
            dispatch_timeout: Duration::from_secs(600),
            running_safety_window: Duration::from_secs(30 * 60),
            max_retries: 3,
            retry_delay: Duration::from_secs(5 * 60),
            max_iterations: 30,
            api_port: 8080,
        }
    }
}

impl OrchestratorConfig {
    /// Build a config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host_ip: env_or("ORCH_HOST_IP", defaults.host_ip),
            worker_image: env_or("ORCH_WORKER_IMAGE", defaults.worker_image),
            companion_image: env_or("ORCH_COMPANION_IMAGE", defaults.companion_image),
            max_workers: env_parsed("ORCH_MAX_WORKERS", defaults.max_workers),
            control_port_base: env_parsed("ORCH_CONTROL_PORT_BASE", defaults.control_port_base),
            view_port_base: env_parsed("ORCH_VIEW_PORT_BASE", defaults.view_port_base),
            companion_port_base: env_parsed(
                "ORCH_COMPANION_PORT_BASE",
                defaults.companion_port_base,
            ),
            proxy_port_base: env_parsed("ORCH_PROXY_PORT_BASE", defaults.proxy_port_base),
            worker_memory: env_or("ORCH_WORKER_MEMORY", defaults.worker_memory),
            worker_shm_size: env_or("ORCH_WORKER_SHM_SIZE", defaults.worker_shm_size),
            worker_cpus: env_parsed("ORCH_WORKER_CPUS", defaults.worker_cpus),
            worker_network: env_or("ORCH_WORKER_NETWORK", defaults.worker_network),
            profiles_volume: env_or("ORCH_PROFILES_VOLUME", defaults.profiles_volume),
            api_secret_key: SecretString::from(env_or("ORCH_API_SECRET_KEY", String::new())),
            proxy_login: env_or("ORCH_PROXY_LOGIN", String::new()),
            proxy_password: SecretString::from(env_or("ORCH_PROXY_PASSWORD", String::new())),
            proxy_host: env_or("ORCH_PROXY_HOST", String::new()),
            session_timeout: Duration::from_secs(
                60 * env_parsed("ORCH_SESSION_TIMEOUT_MINUTES", 30u64),
            ),
            cleanup_interval: Duration::from_secs(
                60 * env_parsed("ORCH_CLEANUP_INTERVAL_MINUTES", 5u64),
            ),
            dispatch_interval: Duration::from_secs(env_parsed("ORCH_DISPATCH_INTERVAL_SECS", 60u64)),
            health_timeout: Duration::from_secs(env_parsed("ORCH_HEALTH_TIMEOUT_SECS", 30u64)),
            dispatch_timeout: Duration::from_secs(env_parsed("ORCH_DISPATCH_TIMEOUT_SECS", 600u64)),
            running_safety_window: Duration::from_secs(
                60 * env_parsed("ORCH_RUNNING_SAFETY_WINDOW_MINUTES", 30u64),
            ),
            max_retries: env_parsed("ORCH_MAX_RETRIES", defaults.max_retries),
            retry_delay: Duration::from_secs(60 * env_parsed("ORCH_RETRY_DELAY_MINUTES", 5u64)),
            max_iterations: env_parsed("ORCH_MAX_ITERATIONS", defaults.max_iterations),
            api_port: env_parsed("ORCH_API_PORT", defaults.api_port),
        }
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_port_pool_size() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_workers, 6);
        assert_eq!(config.control_port_base, 10100);
        assert_eq!(config.retry_delay, Duration::from_secs(300));
        assert_eq!(config.max_retries, 3);
    }
}
