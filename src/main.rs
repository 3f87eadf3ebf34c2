use std::sync::Arc;

use browser_orchestrator::config::OrchestratorConfig;
use browser_orchestrator::dispatch::dispatcher::{Dispatcher, spawn_dispatch_loop};
use browser_orchestrator::dispatch::ClassifierRules;
use browser_orchestrator::orchestrator::reaper::spawn_reaper_loop;
use browser_orchestrator::orchestrator::{LifecycleManager, SessionRegistry};
use browser_orchestrator::runtime::DockerRuntime;
use browser_orchestrator::server::{AppState, api_routes};
use browser_orchestrator::store::{Database, LibSqlBackend};
use secrecy::ExposeSecret;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = OrchestratorConfig::from_env();

    eprintln!("Browser Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}", config.api_port);
    eprintln!("   Max workers: {}", config.max_workers);
    eprintln!(
        "   Session timeout: {} minutes",
        config.session_timeout.as_secs() / 60
    );
    eprintln!(
        "   Dispatch interval: {}s",
        config.dispatch_interval.as_secs()
    );
    eprintln!(
        "   Auth: {}",
        if config.api_secret_key.expose_secret().is_empty() {
            "DISABLED (no ORCH_API_SECRET_KEY)"
        } else {
            "enabled"
        }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("ORCH_DB_PATH").unwrap_or_else(|_| "./data/orchestrator.db".to_string());
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: Failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}\n");

    // ── Lifecycle manager ────────────────────────────────────────────────
    let registry = Arc::new(SessionRegistry::new(config.max_workers));
    let runtime = Arc::new(DockerRuntime::new());
    let manager = Arc::new(LifecycleManager::new(
        config.clone(),
        runtime,
        Arc::clone(&registry),
    ));

    // Recover sessions for workers that survived an orchestrator restart.
    manager.reconcile().await;

    // ── Background jobs ──────────────────────────────────────────────────
    let _reaper_handle = spawn_reaper_loop(
        Arc::clone(&manager),
        config.cleanup_interval,
        config.session_timeout,
    );

    let dispatcher = Arc::new(Dispatcher::new(
        config.clone(),
        Arc::clone(&db),
        Arc::clone(&registry),
        ClassifierRules::default(),
    ));
    let _dispatch_handle = spawn_dispatch_loop(Arc::clone(&dispatcher), config.dispatch_interval);

    // ── Management API ───────────────────────────────────────────────────
    let state = AppState {
        manager,
        registry,
        dispatcher,
        db,
        config: config.clone(),
    };
    let app = api_routes(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.api_port)).await?;
    tracing::info!(port = config.api_port, "management API started");
    axum::serve(listener, app).await?;

    Ok(())
}
