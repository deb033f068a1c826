//! # Internal Metrics Module
//!
//! Metrics are recorded with the `metrics` macros at the call sites. When
//! enabled, `MetricsBuilder` installs a Prometheus recorder and builds the
//! `MetricsServer` that exposes `/metrics`. When disabled, the macros fall
//! through to the crate's no-op recorder.
//!
//! ## Exported metrics
//!
//! - `dispatch_cycles_total{result}`: dispatch cycles by result (`completed`,
//!   `skipped`, `overlap`, `config_error`, `repository_error`).
//! - `alert_deliveries_total{outcome}`: processed deliveries by outcome (`sent`,
//!   `failed`, `exhausted`, `suppressed`, `contended`, `write_error`).
//! - `alert_send_duration_seconds{sink}`: latency of sink calls.
//! - `dispatch_cycle_duration_seconds`: wall time of completed cycles.
//! - `alerts_ingested_total`: alerts ingested from files.
//! - `deduplicated_alerts_total`: alerts skipped by the dedupe window.
//! - `deduplication_cache_entries`: fingerprints held by the dedupe cache.

use crate::config::MetricsConfig;
use crate::internal_metrics::server::MetricsServer;
use anyhow::Context;
use metrics::Unit;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

pub mod server;

/// Registers descriptions for every metric the crate emits.
pub fn describe_metrics() {
    metrics::describe_counter!("dispatch_cycles_total", Unit::Count, "Total number of dispatch cycles, labeled by result.");
    metrics::describe_counter!("alert_deliveries_total", Unit::Count, "Total number of delivery attempts processed, labeled by outcome.");
    metrics::describe_histogram!(
        "alert_send_duration_seconds",
        Unit::Seconds,
        "The time in seconds it takes to send an alert to the notification sink."
    );
    metrics::describe_histogram!("dispatch_cycle_duration_seconds", Unit::Seconds, "Duration of each dispatch cycle in seconds.");
    metrics::describe_counter!("alerts_ingested_total", Unit::Count, "Total number of alerts ingested from alert files.");
    metrics::describe_counter!("deduplicated_alerts_total", Unit::Count, "Total number of alerts that were suppressed by the deduplication filter.");
    metrics::describe_gauge!("deduplication_cache_entries", Unit::Count, "The current number of fingerprints held by the deduplication filter.");
}

/// Builder for the metrics system.
///
/// This builder is responsible for installing the `PrometheusRecorder` and
/// creating the `MetricsServer`.
pub struct MetricsBuilder {
    config: MetricsConfig,
}

impl MetricsBuilder {
    /// Creates a new `MetricsBuilder` with the given configuration.
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Installs the recorder and returns the server with its bound address.
    ///
    /// Returns `Ok(None)` when metrics are disabled in the configuration.
    ///
    /// # Arguments
    ///
    /// * `shutdown_rx` - A watch channel receiver for graceful shutdown.
    pub fn build(
        self,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Option<(MetricsServer, SocketAddr)>> {
        if !self.config.enabled {
            return Ok(None);
        }

        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0],
            )
            .context("Invalid histogram buckets")?
            .build_recorder();
        let handle = recorder.handle();

        let listener = std::net::TcpListener::bind(self.config.listen_address).with_context(|| {
            format!("Failed to bind metrics server to {}", self.config.listen_address)
        })?;
        let addr = listener
            .local_addr()
            .context("Failed to get local address for metrics server")?;

        // The listener must be non-blocking to be used with Tokio.
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;

        metrics::set_global_recorder(recorder)
            .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {e}"))?;
        describe_metrics();

        info!(address = %addr, "Metrics server bound");
        Ok(Some((MetricsServer::new(listener, handle, shutdown_rx), addr)))
    }
}
