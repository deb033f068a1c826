//! End-to-end runs of the assembled application against a mock Slack webhook.

use alertdispatch::app::App;
use alertdispatch::config::{Config, StorageBackend};
use alertdispatch::repository::InMemoryRepository;
use chrono::Utc;
use serde_json::json;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn write_alert(dir: &Path, name: &str, id: &str, alert_type: &str) {
    let body = json!({
        "id": id,
        "type": alert_type,
        "severity": "WARNING",
        "message": "Disk usage at 91%",
        "timestamp": Utc::now().to_rfc3339(),
        "acknowledged": false
    });
    std::fs::write(dir.join(name), body.to_string()).unwrap();
}

fn app_config(alerts_dir: &Path, server: &MockServer) -> Config {
    let mut config = Config::default();
    config.enabled = true;
    config.alerts_dir = alerts_dir.to_path_buf();
    config.db_dispatcher.enabled = true;
    config
        .slack
        .webhooks
        .insert("ops".into(), format!("{}/services/ops", server.uri()));
    config
}

async fn mount_ops_webhook(server: &MockServer, status: u16, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/services/ops"))
        .and(body_partial_json(json!({ "text": "🔔 Alert (ops)" })))
        .respond_with(ResponseTemplate::new(status))
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_run_once_ingests_and_delivers() {
    let server = MockServer::start().await;
    mount_ops_webhook(&server, 200, 1).await;
    let dir = TempDir::new().unwrap();
    write_alert(dir.path(), "alert-001.json", "a-1", "storage-usage-high");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = App::builder(app_config(dir.path(), &server))
        .build(shutdown_rx)
        .await
        .unwrap();
    let (ingest, cycle) = app.run_once().await.unwrap();

    assert_eq!(ingest.ingested, 1);
    assert_eq!(ingest.deliveries_created, 1);
    assert_eq!(cycle.processed, 1);
    assert_eq!(cycle.sent, 1);
}

#[tokio::test]
async fn test_run_once_records_webhook_failure() {
    let server = MockServer::start().await;
    mount_ops_webhook(&server, 503, 1).await;
    let dir = TempDir::new().unwrap();
    write_alert(dir.path(), "alert-001.json", "a-1", "storage-usage-high");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = App::builder(app_config(dir.path(), &server))
        .build(shutdown_rx)
        .await
        .unwrap();
    let (_, cycle) = app.run_once().await.unwrap();

    assert_eq!(cycle.failed, 1);
    assert_eq!(cycle.sent, 0);
}

#[tokio::test]
async fn test_run_delivers_and_shuts_down_cleanly() {
    let server = MockServer::start().await;
    mount_ops_webhook(&server, 200, 1).await;
    let dir = TempDir::new().unwrap();
    write_alert(dir.path(), "alert-001.json", "a-1", "storage-usage-high");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = App::builder(app_config(dir.path(), &server))
        .build(shutdown_rx)
        .await
        .unwrap();
    let dispatcher = app.dispatcher();
    let handle = tokio::spawn(app.run());

    // The ingestor's first pass races the dispatcher's first cycle, so nudge
    // the dispatcher until the webhook has been called.
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if !server.received_requests().await.unwrap_or_default().is_empty() {
                break;
            }
            let _ = dispatcher.run_once_now().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("webhook should be called");

    shutdown_tx.send(true).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("app should shut down promptly")
        .unwrap();
    assert!(result.is_ok());
    assert!(!dispatcher.is_running().await);
}

#[tokio::test]
async fn test_sqlite_backend_survives_restart() {
    let server = MockServer::start().await;
    mount_ops_webhook(&server, 200, 1).await;
    let dir = TempDir::new().unwrap();
    let alerts = dir.path().join("alerts");
    std::fs::create_dir(&alerts).unwrap();
    write_alert(&alerts, "alert-001.json", "a-1", "storage-usage-high");

    let mut config = app_config(&alerts, &server);
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.sqlite_path = dir.path().join("alerts.db");

    for run in 0..2 {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let app = App::builder(config.clone())
            .build(shutdown_rx)
            .await
            .unwrap();
        let (ingest, cycle) = app.run_once().await.unwrap();

        assert_eq!(ingest.ingested, 1);
        if run == 0 {
            assert_eq!(ingest.deliveries_created, 1);
            assert_eq!(cycle.sent, 1);
        } else {
            // The delivery from the first process is remembered and terminal.
            assert_eq!(ingest.deliveries_created, 0);
            assert_eq!(cycle.processed, 0);
        }
    }
}

#[tokio::test]
async fn test_unopenable_sqlite_path_fails_build() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Sqlite;
    config.storage.sqlite_path = dir.path().join("missing").join("alerts.db");

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let err = App::builder(config).build(shutdown_rx).await.err().unwrap();
    assert!(err.to_string().contains("Failed to open SQLite database"));
}

#[tokio::test]
async fn test_metrics_endpoint_serves_dispatch_counters() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let mut config = app_config(dir.path(), &server);
    config.metrics.enabled = true;
    config.metrics.listen_address = SocketAddr::from(([127, 0, 0, 1], 0));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = App::builder(config).build(shutdown_rx).await.unwrap();
    let addr = app.metrics_addr().expect("metrics should be enabled");
    let handle = tokio::spawn(app.run());

    let url = format!("http://{addr}/metrics");
    let body = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if let Ok(response) = reqwest::get(&url).await {
                let body = response.text().await.unwrap_or_default();
                if body.contains("dispatch_cycles_total") {
                    return body;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("metrics should be exported");

    assert!(body.contains(r#"dispatch_cycles_total{result="completed"}"#));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("app should shut down promptly")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_failed_start_stops_spawned_tasks() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let mut config = app_config(dir.path(), &server);
    config.db_dispatcher.claim_lease_seconds = 0;
    let repo = Arc::new(InMemoryRepository::new());

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let app = App::builder(config)
        .repository_override(repo.clone())
        .build(shutdown_rx)
        .await
        .unwrap();
    let err = tokio::time::timeout(Duration::from_secs(5), app.run())
        .await
        .expect("run should return without a shutdown signal")
        .unwrap_err();

    assert!(err.to_string().contains("Failed to start dispatcher"));
    // The ingestor task no longer holds the repository.
    assert_eq!(Arc::strong_count(&repo), 1);
}
