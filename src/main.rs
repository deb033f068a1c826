//! alertdispatch - Alert Delivery Dispatcher
//!
//! Ingests alert files and delivers the resulting alerts to Slack incoming
//! webhooks with bounded retries.

use alertdispatch::{
    app::App,
    cli::Cli,
    config::{Config, StorageBackend},
};
use anyhow::Result;
use clap::Parser;
use tokio::{signal, sync::watch};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration by layering sources: defaults, file, environment, and CLI args.
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            init_tracing("info");
            error!("Failed to load configuration: {}", err);
            // Exit if configuration fails, as it's a critical step.
            std::process::exit(1);
        }
    };

    init_tracing(&config.log_level);
    info!("alertdispatch starting up...");
    log_config_summary(&config);

    // =========================================================================
    // Create Shutdown Channel
    // =========================================================================
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let app = App::builder(config)
        .config_source(cli.clone())
        .build(shutdown_rx)
        .await?;

    if let Some(addr) = app.metrics_addr() {
        info!("Metrics available at http://{}/metrics", addr);
    }

    if cli.once {
        let (ingest, cycle) = app.run_once().await?;
        info!(
            ingested = ingest.ingested,
            deliveries_created = ingest.deliveries_created,
            processed = cycle.processed,
            sent = cycle.sent,
            failed = cycle.failed,
            exhausted = cycle.exhausted,
            suppressed = cycle.suppressed,
            "Single run complete"
        );
        let _ = shutdown_tx.send(true);
        return Ok(());
    }

    tokio::spawn(async move {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl-C received, initiating shutdown."),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    app.run().await?;
    info!("alertdispatch shut down gracefully.");
    Ok(())
}

/// Installs the global `tracing` subscriber. `RUST_LOG` wins over `level`.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn log_config_summary(config: &Config) {
    info!("-------------------- Configuration --------------------");
    info!("Log Level: {}", config.log_level);
    info!(
        "Ingest: {} (every {}s from {}, limit {})",
        enabled(config.enabled),
        config.interval_seconds,
        config.alerts_dir.display(),
        config.ingest.limit
    );
    info!(
        "Dispatcher: {} (every {}s, batch {}, lease {}s)",
        enabled(config.db_dispatcher.enabled),
        config.dispatch_interval().as_secs(),
        config.db_dispatcher.batch_size,
        config.db_dispatcher.claim_lease_seconds
    );
    info!(
        "Retries: {} attempts, {}s apart, {}ms webhook timeout",
        config.max_attempts, config.retry_delay_seconds, config.webhook_timeout_ms
    );
    let routes: Vec<&str> = config.slack.webhooks.keys().map(String::as_str).collect();
    info!(
        "Slack: {} (routes with webhooks: {})",
        enabled(config.slack.enabled),
        if routes.is_empty() { "none".to_string() } else { routes.join(", ") }
    );
    info!(
        "Dedupe: {} (default window {}s)",
        enabled(config.dedupe.enabled),
        config.dedupe.default_window_seconds
    );
    match config.storage.backend {
        StorageBackend::Memory => info!("Storage: in-memory"),
        StorageBackend::Sqlite => info!("Storage: SQLite at {}", config.storage.sqlite_path.display()),
    }
    info!("-------------------------------------------------------");
}

fn enabled(flag: bool) -> &'static str {
    if flag {
        "Enabled"
    } else {
        "Disabled"
    }
}
