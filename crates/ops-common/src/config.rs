//! Configuration for the operations core.
//!
//! Layered: compiled defaults, then an optional TOML file on disk, then
//! `OPS_CORE_*` env vars.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration for the whole process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub observer: ObserverConfig,
    pub healer: HealerConfig,
    pub updater: UpdaterConfig,
}

/// Bind address for the update control API (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Audit store (C5) backend location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path (or `:memory:` for tests).
    pub database_path: PathBuf,
}

/// Observer loop (C7) cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Seconds between internally-generated heartbeats, when this process
    /// drives its own ticker rather than being ticked externally.
    pub tick_interval_seconds: u64,
    /// Run analysis every Nth tick.
    pub analysis_every_n_ticks: u64,
    /// Run the daily rollup every Nth tick.
    pub daily_report_every_n_ticks: u64,
    /// Number of recent snapshots used as the baseline window for the
    /// P95-vs-median anomaly check (Open Question in spec.md §9).
    pub baseline_window: usize,
}

/// Self-healer (C6) knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealerConfig {
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub ollama_url: String,
    /// Keepalive duration string sent to Ollama (Open Question in
    /// spec.md §9, default "10m").
    pub ollama_keep_alive: String,
    pub rate_limit_cap_seconds: u64,
}

/// Update executor (C8) / control API (C9) knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    pub secret_file: PathBuf,
    pub runtime_state_path: PathBuf,
    pub route_config_path: PathBuf,
    pub compose_file: PathBuf,
    pub project_dir: PathBuf,
    pub health_urls: HashMap<String, String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let mut health_urls = HashMap::new();
        // Direct, per-color service health checks, keyed `{service}-{color}`
        // so the executor can tell the color it just brought up apart from
        // the color it's tearing down.
        health_urls.insert("skills-blue".to_string(), "http://skills-blue:8080/health".to_string());
        health_urls.insert("skills-green".to_string(), "http://skills-green:8080/health".to_string());
        health_urls.insert("api-blue".to_string(), "http://api-blue:8080/health".to_string());
        health_urls.insert("api-green".to_string(), "http://api-green:8080/health".to_string());
        // Routed through the reverse proxy once traffic has been switched;
        // these aren't color-specific since they always hit whichever color
        // is currently live.
        health_urls.insert("routed_skills".to_string(), "http://proxy/skills/health".to_string());
        health_urls.insert("routed_api".to_string(), "http://proxy/api/health".to_string());

        Self {
            server: ServerConfig {
                bind_address: "0.0.0.0".to_string(),
                port: 8099,
            },
            storage: StorageConfig {
                database_path: PathBuf::from("./data/ops_core.db"),
            },
            observer: ObserverConfig {
                tick_interval_seconds: 300,
                analysis_every_n_ticks: 6,
                daily_report_every_n_ticks: 288,
                baseline_window: 6,
            },
            healer: HealerConfig {
                enabled: true,
                cooldown_seconds: 300,
                ollama_url: "http://ollama:11434/api/tags".to_string(),
                ollama_keep_alive: "10m".to_string(),
                rate_limit_cap_seconds: 1800,
            },
            updater: UpdaterConfig {
                secret_file: PathBuf::from("./data/updater_secret"),
                runtime_state_path: PathBuf::from("./data/update_runtime_state.json"),
                route_config_path: PathBuf::from("./data/routes.yaml"),
                compose_file: PathBuf::from("docker-compose.yml"),
                project_dir: PathBuf::from("."),
                health_urls,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from compiled defaults, an optional file, and
    /// `OPS_CORE_*`-prefixed environment variables, in that order of
    /// increasing precedence.
    pub fn load(path: Option<&std::path::Path>) -> Result<Self> {
        let defaults = AppConfig::default();
        let defaults_value = serde_json::to_value(&defaults)
            .map_err(|e| Error::Configuration(format!("failed to seed defaults: {e}")))?;

        let mut builder = config::Config::builder()
            .add_source(config::Config::try_from(&defaults_value).map_err(|e| {
                Error::Configuration(format!("failed to build default source: {e}"))
            })?);

        if let Some(path) = path {
            if path.exists() {
                builder = builder.add_source(config::File::from(path));
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("OPS_CORE")
                .separator("__")
                .try_parsing(true),
        );

        let built = builder
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build config: {e}")))?;

        built
            .try_deserialize()
            .map_err(|e| Error::Configuration(format!("failed to deserialize config: {e}")))
    }
}
