//! Turns `alert-*.json` files into alert and delivery records.
//!
//! The upstream pipeline drops one JSON file per alert into the alerts
//! directory. Each pass upserts the newest files into the [`AlertStore`] and
//! creates one `PENDING` delivery per alert and route, which the dispatcher
//! then picks up.

use crate::core::{Alert, AlertStore, Clock, ConfigProvider, Severity};
use crate::config::Config;
use crate::deduplication::{compute_alert_fingerprint, Deduplicator};
use crate::delivery;
use crate::routing::resolve_route_key;
use crate::task_manager::wait_for_shutdown;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// The on-disk shape of an alert file. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
struct AlertFile {
    id: Option<String>,
    #[serde(rename = "type")]
    alert_type: Option<String>,
    severity: Option<String>,
    message: Option<String>,
    details: Option<Value>,
    timestamp: Option<String>,
    acknowledged: Option<bool>,
    source: Option<Value>,
    context: Option<Value>,
    fingerprint: Option<String>,
}

/// Counts from one ingest pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// Alerts upserted into the store.
    pub ingested: usize,
    pub deliveries_created: usize,
    /// Alerts whose fingerprint was seen on the same route within the window.
    pub deduplicated: usize,
    /// Files without an id or a valid timestamp.
    pub skipped: usize,
    /// Unreadable files and store failures.
    pub errors: usize,
    /// The pass did nothing because ingest is disabled.
    pub disabled: bool,
}

pub struct AlertIngestor {
    config: Arc<dyn ConfigProvider>,
    store: Arc<dyn AlertStore>,
    clock: Arc<dyn Clock>,
    deduplicator: Deduplicator,
}

impl AlertIngestor {
    pub fn new(config: Arc<dyn ConfigProvider>, store: Arc<dyn AlertStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            deduplicator: Deduplicator::default(),
        }
    }

    /// Runs one pass with a fresh configuration snapshot.
    pub async fn ingest_once_now(&self) -> Result<IngestReport> {
        let config = self
            .config
            .snapshot()
            .await
            .context("Failed to load configuration for ingest")?;
        if !config.enabled {
            debug!("Alert ingest disabled, skipping pass");
            return Ok(IngestReport {
                disabled: true,
                ..IngestReport::default()
            });
        }
        self.ingest_dir(&config).await
    }

    /// Runs passes every `interval_seconds` until shutdown is signalled.
    ///
    /// The first pass runs immediately.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut period = self.run_pass().await;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
                _ = ticker.tick() => {}
            }
            let next = self.run_pass().await;
            if next != period {
                period = next;
                ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
        }
        debug!("Alert ingestor stopped");
    }

    /// Runs one pass and returns the period until the next one.
    async fn run_pass(&self) -> std::time::Duration {
        match self.config.snapshot().await {
            Ok(config) => {
                if config.enabled {
                    if let Err(e) = self.ingest_dir(&config).await {
                        warn!(error = %e, "Alert ingest pass failed");
                    }
                }
                config.ingest_interval()
            }
            Err(e) => {
                warn!(error = %e, "Failed to load configuration for ingest");
                Config::default().ingest_interval()
            }
        }
    }

    #[instrument(skip_all, fields(alerts_dir = %config.alerts_dir.display()))]
    async fn ingest_dir(&self, config: &Config) -> Result<IngestReport> {
        let mut report = IngestReport::default();
        let files = list_alert_files(&config.alerts_dir).await?;
        if files.is_empty() {
            return Ok(report);
        }

        // Newest first, bounded.
        let start = files.len().saturating_sub(config.ingest.limit);
        for path in files[start..].iter().rev() {
            self.ingest_file(path, config, &mut report).await;
        }

        if report.ingested > 0 || report.skipped > 0 || report.errors > 0 {
            info!(
                ingested = report.ingested,
                deliveries_created = report.deliveries_created,
                deduplicated = report.deduplicated,
                skipped = report.skipped,
                errors = report.errors,
                "Ingest completed"
            );
        }
        Ok(report)
    }

    async fn ingest_file(&self, path: &Path, config: &Config, report: &mut IngestReport) {
        let file = match read_alert_file(path).await {
            Ok(file) => file,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read alert file");
                report.errors += 1;
                return;
            }
        };

        let Some(id) = file.id.clone().filter(|id| !id.trim().is_empty()) else {
            warn!(path = %path.display(), "Alert file missing id, skipping");
            report.skipped += 1;
            return;
        };
        let Some(timestamp) = file.timestamp.as_deref().and_then(parse_timestamp) else {
            warn!(path = %path.display(), id = %id, "Alert file missing or invalid timestamp, skipping");
            report.skipped += 1;
            return;
        };

        let route_key = resolve_route_key(file.alert_type.as_deref(), &config.routing);
        let mut alert = file.into_alert(id, timestamp);
        let fingerprint = match alert.fingerprint.clone() {
            Some(fingerprint) => fingerprint,
            None => {
                let fingerprint = compute_alert_fingerprint(&alert, &route_key);
                alert.fingerprint = Some(fingerprint.clone());
                fingerprint
            }
        };

        if let Err(e) = self.store.upsert_alert(&alert).await {
            warn!(id = %alert.id, error = %e, "Failed to ingest alert");
            report.errors += 1;
            return;
        }
        report.ingested += 1;
        metrics::counter!("alerts_ingested_total").increment(1);

        match self.store.has_delivery(&alert.id, &route_key).await {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                warn!(id = %alert.id, error = %e, "Failed to look up delivery");
                report.errors += 1;
                return;
            }
        }

        let window = config.dedupe.window_for(&route_key);
        if config.dedupe.enabled
            && self
                .deduplicator
                .is_duplicate(&route_key, &fingerprint, window)
                .await
        {
            // Recorded as a delivery so later passes never send it.
            let reason = delivery::dedupe_reason(window.as_secs());
            match self
                .store
                .create_suppressed_delivery(&alert.id, &route_key, &reason, self.clock.now())
                .await
            {
                Ok(_) => {
                    debug!(id = %alert.id, route_key = %route_key, "Duplicate alert within dedupe window");
                    report.deduplicated += 1;
                    metrics::counter!("deduplicated_alerts_total").increment(1);
                }
                Err(e) => {
                    warn!(id = %alert.id, error = %e, "Failed to record duplicate alert");
                    report.errors += 1;
                }
            }
            return;
        }

        match self
            .store
            .create_pending_delivery(&alert.id, &route_key, self.clock.now())
            .await
        {
            Ok(Some(delivery)) => {
                debug!(id = %alert.id, delivery_id = %delivery.id, route_key = %route_key, "Created delivery");
                report.deliveries_created += 1;
            }
            Ok(None) => debug!(id = %alert.id, route_key = %route_key, "Delivery already exists"),
            Err(e) => {
                warn!(id = %alert.id, error = %e, "Failed to create delivery");
                report.errors += 1;
            }
        }
    }
}

impl AlertFile {
    fn into_alert(self, id: String, timestamp: DateTime<Utc>) -> Alert {
        Alert {
            id,
            alert_type: self.alert_type,
            message: self.message,
            severity: self.severity.as_deref().and_then(Severity::parse),
            details: self.details.filter(|v| !v.is_null()),
            source: self.source.filter(|v| !v.is_null()),
            context: self.context.filter(|v| !v.is_null()),
            fingerprint: self.fingerprint.filter(|f| !f.trim().is_empty()),
            timestamp,
            acknowledged: self.acknowledged.unwrap_or(false),
        }
    }
}

async fn list_alert_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "Alerts directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to list {}", dir.display()));
        }
    };

    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if name.starts_with("alert-") && name.ends_with(".json") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

async fn read_alert_file(path: &Path) -> Result<AlertFile> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Parses RFC 3339 timestamps, plus the `+0200` offset form some producers emit.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f%z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
