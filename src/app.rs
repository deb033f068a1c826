//! The main application logic, decoupled from the entry point.

use crate::{
    cli::Cli,
    config::{Config, FileConfigProvider, StaticConfigProvider, StorageBackend},
    core::{AlertStore, Clock, ConfigProvider, DeliveryRepository, NotificationSink},
    dispatcher::{CycleReport, DeliveryDispatcher},
    formatting::{AlertFormatter, SlackBlockFormatter},
    ingest::{AlertIngestor, IngestReport},
    internal_metrics::MetricsBuilder,
    notification::SlackWebhookSink,
    repository::{InMemoryRepository, SqliteRepository},
    task_manager::{wait_for_shutdown, TaskManager},
    utils::clock::SystemClock,
};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument};

/// A handle to the running application.
pub struct App {
    task_manager: TaskManager,
    dispatcher: Arc<DeliveryDispatcher>,
    ingestor: AlertIngestor,
    metrics_addr: Option<SocketAddr>,
}

impl App {
    /// Creates a new `AppBuilder` to construct an `App`.
    pub fn builder(config: Config) -> AppBuilder {
        AppBuilder::new(config)
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_addr
    }

    pub fn dispatcher(&self) -> Arc<DeliveryDispatcher> {
        self.dispatcher.clone()
    }

    /// Starts the ingestor and the dispatcher, waits for the shutdown signal,
    /// then stops everything.
    pub async fn run(self) -> Result<()> {
        let App {
            task_manager,
            dispatcher,
            ingestor,
            ..
        } = self;

        task_manager.spawn("AlertIngestor", ingestor.run(task_manager.get_shutdown_rx()));
        if let Err(e) = dispatcher.start().await {
            task_manager.abort().await;
            return Err(e).context("Failed to start dispatcher");
        }

        let mut shutdown_rx = task_manager.get_shutdown_rx();
        wait_for_shutdown(&mut shutdown_rx).await;
        info!("Shutdown signal received. Waiting for tasks to complete...");

        dispatcher.stop().await;
        task_manager.shutdown().await;

        info!("All tasks shut down.");
        Ok(())
    }

    /// Runs one ingest pass and one dispatch cycle.
    pub async fn run_once(self) -> Result<(IngestReport, CycleReport)> {
        let ingest = self.ingestor.ingest_once_now().await?;
        let cycle = self.dispatcher.run_once_now().await?;
        Ok((ingest, cycle))
    }
}

/// Builder for the main application.
///
/// This pattern allows for a clean separation of concerns between constructing
/// the application's components and running the application. It also provides
/// a convenient way to override components for testing purposes.
pub struct AppBuilder {
    config: Config,
    config_source: Option<Cli>,
    config_provider_override: Option<Arc<dyn ConfigProvider>>,
    repository_override: Option<(Arc<dyn DeliveryRepository>, Arc<dyn AlertStore>)>,
    sink_override: Option<Arc<dyn NotificationSink>>,
    formatter_override: Option<Arc<dyn AlertFormatter>>,
    clock_override: Option<Arc<dyn Clock>>,
}

impl AppBuilder {
    /// Creates a new `AppBuilder` with the given startup configuration.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            config_source: None,
            config_provider_override: None,
            repository_override: None,
            sink_override: None,
            formatter_override: None,
            clock_override: None,
        }
    }

    /// Re-reads configuration from these sources on every cycle.
    ///
    /// Without it, the startup configuration is used for the life of the app.
    pub fn config_source(mut self, cli: Cli) -> Self {
        self.config_source = Some(cli);
        self
    }

    /// Overrides the configuration provider for testing.
    pub fn config_provider_override(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.config_provider_override = Some(provider);
        self
    }

    /// Overrides the repository for testing.
    pub fn repository_override<R>(mut self, repository: Arc<R>) -> Self
    where
        R: DeliveryRepository + AlertStore + 'static,
    {
        self.repository_override = Some(split_repository(repository));
        self
    }

    /// Overrides the notification sink for testing.
    pub fn sink_override(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink_override = Some(sink);
        self
    }

    pub fn formatter_override(mut self, formatter: Arc<dyn AlertFormatter>) -> Self {
        self.formatter_override = Some(formatter);
        self
    }

    /// Overrides the clock for testing.
    pub fn clock_override(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock_override = Some(clock);
        self
    }

    /// Builds and initializes all application components, returning a runnable `App`.
    #[instrument(skip_all)]
    pub async fn build(self, shutdown_rx: watch::Receiver<bool>) -> Result<App> {
        let config = self.config;
        let task_manager = TaskManager::new(shutdown_rx);

        // =========================================================================
        // 1. Initialize Metrics
        // =========================================================================
        let metrics_addr = match MetricsBuilder::new(config.metrics.clone())
            .build(task_manager.get_shutdown_rx())?
        {
            Some((server, addr)) => {
                task_manager.spawn("MetricsServer", server.run());
                Some(addr)
            }
            None => None,
        };

        // =========================================================================
        // 2. Instantiate Services
        // =========================================================================
        let config_provider: Arc<dyn ConfigProvider> = match (self.config_provider_override, self.config_source) {
            (Some(provider), _) => provider,
            (None, Some(cli)) => Arc::new(FileConfigProvider::new(cli)),
            (None, None) => Arc::new(StaticConfigProvider::new(config.clone())),
        };

        let (repository, store): (Arc<dyn DeliveryRepository>, Arc<dyn AlertStore>) =
            match self.repository_override {
                Some(pair) => pair,
                None => match config.storage.backend {
                    StorageBackend::Memory => {
                        info!("Using in-memory repository");
                        split_repository(Arc::new(InMemoryRepository::new()))
                    }
                    StorageBackend::Sqlite => {
                        let path = config.storage.sqlite_path.clone();
                        info!(path = %path.display(), "Using SQLite repository");
                        let repo = SqliteRepository::open(&path).with_context(|| {
                            format!("Failed to open SQLite database at {}", path.display())
                        })?;
                        split_repository(Arc::new(repo))
                    }
                },
            };

        let sink: Arc<dyn NotificationSink> = match self.sink_override {
            Some(sink) => sink,
            None => Arc::new(SlackWebhookSink::new().context("Failed to build HTTP client")?),
        };
        let formatter = self
            .formatter_override
            .unwrap_or_else(|| Arc::new(SlackBlockFormatter));
        let clock = self.clock_override.unwrap_or_else(|| Arc::new(SystemClock));

        // =========================================================================
        // 3. Wire the Pipeline
        // =========================================================================
        let dispatcher = Arc::new(DeliveryDispatcher::new(
            config_provider.clone(),
            repository,
            sink,
            formatter,
            clock.clone(),
        ));
        let ingestor = AlertIngestor::new(config_provider, store, clock);

        Ok(App {
            task_manager,
            dispatcher,
            ingestor,
            metrics_addr,
        })
    }
}

/// Views one repository through both of its trait seams.
fn split_repository<R>(repository: Arc<R>) -> (Arc<dyn DeliveryRepository>, Arc<dyn AlertStore>)
where
    R: DeliveryRepository + AlertStore + 'static,
{
    (repository.clone(), repository)
}
