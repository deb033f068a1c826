//! Configuration management for the alert dispatcher
//!
//! This module defines the main `Config` struct and its sub-structs. It uses
//! the `figment` crate to layer defaults, an optional TOML file, environment
//! variables (prefixed `ALERTS_`) and command-line arguments.
//!
//! The dispatcher never caches a `Config`: it asks a [`ConfigProvider`] for a
//! fresh snapshot on every cycle, so edits to the file take effect within one
//! interval.

use crate::cli::Cli;
use crate::core::ConfigProvider;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("configuration unavailable: {0}")]
    Unavailable(String),
}

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Enables the file ingestor.
    pub enabled: bool,
    /// Ingest interval, and the fallback for the dispatcher interval.
    pub interval_seconds: u64,
    /// Attempts allowed per delivery before it becomes terminally `FAILED`.
    pub max_attempts: u32,
    /// Fixed delay between retries.
    pub retry_delay_seconds: u64,
    /// Hard deadline for a single webhook call.
    pub webhook_timeout_ms: u64,
    /// Directory scanned for `alert-*.json` files.
    pub alerts_dir: PathBuf,
    pub db_dispatcher: DbDispatcherConfig,
    pub dedupe: DedupeConfig,
    pub slack: SlackConfig,
    pub routing: RoutingConfig,
    pub ingest: IngestConfig,
    pub storage: StorageConfig,
    pub metrics: MetricsConfig,
}

/// Settings for the repository-backed dispatcher.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DbDispatcherConfig {
    pub enabled: bool,
    /// Overrides the top-level `interval_seconds` when set.
    pub interval_seconds: Option<u64>,
    /// Maximum deliveries processed per cycle.
    pub batch_size: usize,
    /// How long a claimed delivery is owned before another instance may retry it.
    pub claim_lease_seconds: u64,
    /// First attempts for alerts older than this are suppressed. `0` disables.
    pub max_alert_age_seconds: u64,
}

/// Dedupe windows consumed by the ingestor.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DedupeConfig {
    pub enabled: bool,
    pub default_window_seconds: u64,
    #[serde(default)]
    pub window_seconds_by_route_key: BTreeMap<String, u64>,
}

/// Configuration for Slack alerts.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SlackConfig {
    pub enabled: bool,
    /// Incoming webhook URL per route key.
    #[serde(default)]
    pub webhooks: BTreeMap<String, String>,
}

/// Maps alert types to route keys.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RoutingConfig {
    /// Alert type prefix to route key. The longest matching prefix wins.
    #[serde(default)]
    pub by_type_prefix: BTreeMap<String, String>,
    pub default_route: String,
}

/// Configuration for the alert file ingestor.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IngestConfig {
    /// Maximum number of files considered per pass (newest first).
    pub limit: usize,
}

/// Which repository implementation backs the process.
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub sqlite_path: PathBuf,
}

/// Configuration for the Prometheus metrics endpoint.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen_address: SocketAddr,
}

impl Config {
    /// Loads the application configuration.
    ///
    /// Sources are layered in order: defaults, the TOML file named by
    /// `cli.config` (if any), `ALERTS_*` environment variables, then the
    /// command-line arguments themselves.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));
        if let Some(path) = &cli.config {
            figment = figment.merge(Toml::file(path));
        }
        let config: Config = figment
            // e.g. ALERTS_DB_DISPATCHER__BATCH_SIZE=20
            .merge(Env::prefixed("ALERTS_").split("__"))
            .merge(cli.clone())
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges and webhook URLs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("interval_seconds", self.interval_seconds, 5, 3600)?;
        if let Some(interval) = self.db_dispatcher.interval_seconds {
            check_range("db_dispatcher.interval_seconds", interval, 1, 3600)?;
        }
        check_range("max_attempts", u64::from(self.max_attempts), 1, 20)?;
        check_range("retry_delay_seconds", self.retry_delay_seconds, 5, 3600)?;
        check_range("webhook_timeout_ms", self.webhook_timeout_ms, 500, 30_000)?;
        check_range("db_dispatcher.batch_size", self.db_dispatcher.batch_size as u64, 1, 1000)?;
        check_range(
            "db_dispatcher.claim_lease_seconds",
            self.db_dispatcher.claim_lease_seconds,
            1,
            86_400,
        )?;
        // A lease that can expire mid-send lets a second dispatcher send too.
        if self.claim_lease() <= self.webhook_timeout() {
            return Err(ConfigError::Invalid(format!(
                "db_dispatcher.claim_lease_seconds ({}s) must be longer than webhook_timeout_ms ({}ms)",
                self.db_dispatcher.claim_lease_seconds, self.webhook_timeout_ms
            )));
        }
        check_range("ingest.limit", self.ingest.limit as u64, 1, 10_000)?;
        if self.routing.default_route.trim().is_empty() {
            return Err(ConfigError::Invalid("routing.default_route must not be empty".into()));
        }
        // Blank entries are treated as unconfigured routes.
        for (route, url) in self.slack.webhooks.iter().filter(|(_, u)| !u.trim().is_empty()) {
            reqwest::Url::parse(url.trim()).map_err(|e| {
                ConfigError::Invalid(format!("slack.webhooks.{route} is not a valid URL: {e}"))
            })?;
        }
        Ok(())
    }

    /// The period between dispatch cycles.
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(
            self.db_dispatcher
                .interval_seconds
                .unwrap_or(self.interval_seconds)
                .max(1),
        )
    }

    /// The period between ingest passes.
    pub fn ingest_interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds.max(1))
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    /// How long a claimed delivery stays invisible to other dispatchers.
    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.db_dispatcher.claim_lease_seconds)
    }
}

fn check_range(name: &str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::Invalid(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

impl DedupeConfig {
    /// The dedupe window for a route, falling back to the default window.
    pub fn window_for(&self, route_key: &str) -> Duration {
        let seconds = self
            .window_seconds_by_route_key
            .get(route_key)
            .copied()
            .unwrap_or(self.default_window_seconds);
        Duration::from_secs(seconds)
    }
}

fn default_routing() -> RoutingConfig {
    let by_type_prefix = [
        ("ansible-update-", "deploy"),
        ("ansible-health-check-", "deploy"),
        ("storage-", "ops"),
        ("csv-import-", "ops"),
        ("role_change", "security"),
        ("kiosk-support", "support"),
    ]
    .into_iter()
    .map(|(prefix, route)| (prefix.to_string(), route.to_string()))
    .collect();

    RoutingConfig {
        by_type_prefix,
        default_route: "ops".to_string(),
    }
}

// Provide a default implementation for tests and easy setup.
impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            enabled: false,
            interval_seconds: 30,
            max_attempts: 5,
            retry_delay_seconds: 60,
            webhook_timeout_ms: 5000,
            alerts_dir: PathBuf::from("alerts"),
            db_dispatcher: DbDispatcherConfig {
                enabled: false,
                interval_seconds: None,
                batch_size: 50,
                claim_lease_seconds: 30,
                max_alert_age_seconds: 24 * 60 * 60,
            },
            dedupe: DedupeConfig {
                enabled: false,
                default_window_seconds: 600,
                window_seconds_by_route_key: BTreeMap::new(),
            },
            slack: SlackConfig {
                enabled: true,
                webhooks: BTreeMap::new(),
            },
            routing: default_routing(),
            ingest: IngestConfig { limit: 50 },
            storage: StorageConfig {
                backend: StorageBackend::Memory,
                sqlite_path: PathBuf::from("alerts.db"),
            },
            metrics: MetricsConfig {
                enabled: false,
                listen_address: SocketAddr::from(([127, 0, 0, 1], 9090)),
            },
        }
    }
}

// =============================================================================
// Providers
// =============================================================================

/// Re-reads the configuration sources on every snapshot.
#[derive(Debug, Clone, Default)]
pub struct FileConfigProvider {
    cli: Cli,
}

impl FileConfigProvider {
    pub fn new(cli: Cli) -> Self {
        Self { cli }
    }
}

#[async_trait]
impl ConfigProvider for FileConfigProvider {
    async fn snapshot(&self) -> Result<Config, ConfigError> {
        let cli = self.cli.clone();
        tokio::task::spawn_blocking(move || Config::load(&cli))
            .await
            .map_err(|e| ConfigError::Unavailable(e.to_string()))?
    }
}

/// Holds an in-process configuration that can be swapped at runtime.
#[derive(Debug)]
pub struct StaticConfigProvider {
    current: ArcSwap<Config>,
}

impl StaticConfigProvider {
    pub fn new(config: Config) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
        }
    }

    /// Replaces the configuration returned by subsequent snapshots.
    pub fn store(&self, config: Config) {
        self.current.store(Arc::new(config));
    }

    /// Applies `f` to a copy of the current configuration and stores it.
    pub fn update(&self, f: impl FnOnce(&mut Config)) {
        let mut next = (**self.current.load()).clone();
        f(&mut next);
        self.store(next);
    }
}

#[async_trait]
impl ConfigProvider for StaticConfigProvider {
    async fn snapshot(&self) -> Result<Config, ConfigError> {
        Ok((**self.current.load()).clone())
    }
}
