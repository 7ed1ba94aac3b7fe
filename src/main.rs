//! Operations core entry point: loads configuration, wires up the audit
//! store, self-healer, observer loop, and update control API, and owns
//! the heartbeat ticker and the graceful-shutdown signal handler.

use clap::Parser;
use ops_common::AppConfig;
use ops_health::{AuditStore, Observer, ObserverConfig as ObserverRuntimeConfig, SelfHealer, Sources};
use ops_updater::{ApiState, ExecutorConfig, UpdateExecutor};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ops-core", version, about = "Self-observing operations core")]
struct Cli {
    /// Path to an optional config.toml overlay.
    #[arg(long, env = "OPS_CORE_CONFIG")]
    config: Option<std::path::PathBuf>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("OPS_CORE_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    info!(bind = %config.server.bind_address, port = config.server.port, "starting ops-core");

    let store = Arc::new(AuditStore::connect(&config.storage.database_path).await?);

    let healer = Arc::new(SelfHealer::new(
        config.healer.enabled,
        config.healer.cooldown_seconds,
        config.healer.ollama_url.clone(),
        config.healer.ollama_keep_alive.clone(),
        config.healer.rate_limit_cap_seconds,
        Some(store.clone()),
        None,
    ));

    let sources = Sources {
        cost_store: None,
        heartbeat_stats: None,
        skill_registry: None,
        data_dir: config.storage.database_path.parent().unwrap_or_else(|| std::path::Path::new(".")).to_path_buf(),
    };

    let observer = Arc::new(Observer::new(
        ObserverRuntimeConfig {
            analysis_every_n_ticks: config.observer.analysis_every_n_ticks,
            daily_report_every_n_ticks: config.observer.daily_report_every_n_ticks,
            baseline_window: config.observer.baseline_window,
        },
        sources,
        store.clone(),
        healer,
    ));

    let executor = Arc::new(UpdateExecutor::new(ExecutorConfig {
        project_dir: config.updater.project_dir.clone(),
        compose_file: config.updater.compose_file.clone(),
        route_config_path: config.updater.route_config_path.clone(),
        runtime_state_path: config.updater.runtime_state_path.clone(),
        health_urls: config.updater.health_urls.clone(),
        pause_on_failure: true,
    }));

    let secret = ops_updater::get_or_create_secret(&config.updater.secret_file)?;
    let api_state = Arc::new(ApiState::new(executor, secret));
    let app = ops_updater::router(api_state);

    let bind_addr = format!("{}:{}", config.server.bind_address, config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind_addr, "update control API listening");

    let owner_ids: Vec<String> = Vec::new();
    let ticker_observer = observer.clone();
    let tick_interval = std::time::Duration::from_secs(config.observer.tick_interval_seconds);
    let heartbeat = tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            let actions = ticker_observer.on_heartbeat(&owner_ids).await;
            if !actions.is_empty() {
                warn!(count = actions.len(), "heartbeat produced pending alert actions with no delivery channel wired");
            }
        }
    });

    let shutdown = shutdown_signal();
    let serve_result = axum::serve(listener, app).with_graceful_shutdown(shutdown).await;
    heartbeat.abort();

    if let Err(e) = serve_result {
        error!(error = %e, "server error");
        std::process::exit(1);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("received shutdown signal, shutting down gracefully");
}
