//! File ingest into the in-memory store.

use alertdispatch::config::{Config, StaticConfigProvider};
use alertdispatch::core::{DeliveryStatus, Severity};
use alertdispatch::ingest::AlertIngestor;
use alertdispatch::repository::InMemoryRepository;
use alertdispatch::utils::clock::ManualClock;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::t0;

struct Fixture {
    dir: TempDir,
    repo: Arc<InMemoryRepository>,
    config: Arc<StaticConfigProvider>,
    ingestor: AlertIngestor,
}

impl Fixture {
    fn new(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.enabled = true;
        config.alerts_dir = dir.path().to_path_buf();
        tweak(&mut config);

        let repo = Arc::new(InMemoryRepository::new());
        let config = Arc::new(StaticConfigProvider::new(config));
        let ingestor = AlertIngestor::new(
            config.clone(),
            repo.clone(),
            Arc::new(ManualClock::new(t0())),
        );
        Self {
            dir,
            repo,
            config,
            ingestor,
        }
    }

    fn write(&self, name: &str, body: &Value) {
        write_raw(self.dir.path(), name, &body.to_string());
    }
}

fn write_raw(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

fn alert_json(id: &str, alert_type: &str) -> Value {
    json!({
        "id": id,
        "type": alert_type,
        "severity": "ERROR",
        "message": format!("{alert_type} on kiosk-01"),
        "details": { "usage": 97 },
        "timestamp": "2026-03-01T11:59:00Z",
        "acknowledged": false,
        "source": { "host": "kiosk-01" }
    })
}

#[tokio::test]
async fn test_ingest_creates_alerts_and_routed_deliveries() {
    let f = Fixture::new(|_| {});
    f.write("alert-001.json", &alert_json("a-1", "storage-usage-high"));
    f.write("alert-002.json", &alert_json("a-2", "ansible-update-failed"));

    let report = f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(report.ingested, 2);
    assert_eq!(report.deliveries_created, 2);
    let alert = f.repo.alert("a-1").unwrap();
    assert_eq!(alert.severity, Some(Severity::Error));
    assert_eq!(alert.details, Some(json!({ "usage": 97 })));
    assert_eq!(alert.fingerprint.as_ref().map(String::len), Some(64));

    let mut routes: Vec<(String, String)> = f
        .repo
        .deliveries()
        .into_iter()
        .map(|d| {
            assert_eq!(d.status, DeliveryStatus::Pending);
            assert_eq!(d.created_at, t0());
            (d.alert_id, d.route_key)
        })
        .collect();
    routes.sort();
    assert_eq!(
        routes,
        vec![
            ("a-1".to_string(), "ops".to_string()),
            ("a-2".to_string(), "deploy".to_string())
        ]
    );
}

#[tokio::test]
async fn test_explicit_fingerprint_is_kept() {
    let f = Fixture::new(|_| {});
    let mut body = alert_json("a-1", "storage-usage-high");
    body["fingerprint"] = json!("upstream-fp");
    f.write("alert-001.json", &body);

    f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(
        f.repo.alert("a-1").unwrap().fingerprint.as_deref(),
        Some("upstream-fp")
    );
}

#[tokio::test]
async fn test_disabled_ingest_reads_nothing() {
    let f = Fixture::new(|c| c.enabled = false);
    f.write("alert-001.json", &alert_json("a-1", "storage-usage-high"));

    let report = f.ingestor.ingest_once_now().await.unwrap();

    assert!(report.disabled);
    assert!(f.repo.alert("a-1").is_none());
}

#[tokio::test]
async fn test_bad_files_are_skipped_or_counted() {
    let f = Fixture::new(|_| {});
    f.write("alert-001.json", &alert_json("a-1", "storage-usage-high"));
    f.write("alert-002.json", &json!({ "type": "storage-usage-high", "timestamp": "2026-03-01T11:59:00Z" }));
    f.write("alert-003.json", &json!({ "id": "a-3", "timestamp": "last tuesday" }));
    write_raw(f.dir.path(), "alert-004.json", "{ not json");
    // Not alert files at all.
    write_raw(f.dir.path(), "notes.txt", "hello");
    write_raw(f.dir.path(), "alert-005.txt", "{}");

    let report = f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(report.ingested, 1);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.errors, 1);
    assert_eq!(f.repo.deliveries().len(), 1);
}

#[tokio::test]
async fn test_reingest_updates_alert_without_new_delivery() {
    let f = Fixture::new(|_| {});
    f.write("alert-001.json", &alert_json("a-1", "storage-usage-high"));
    f.ingestor.ingest_once_now().await.unwrap();

    let mut acked = alert_json("a-1", "storage-usage-high");
    acked["acknowledged"] = json!(true);
    f.write("alert-001.json", &acked);
    let report = f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(report.ingested, 1);
    assert_eq!(report.deliveries_created, 0);
    assert!(f.repo.alert("a-1").unwrap().acknowledged);
    assert_eq!(f.repo.deliveries().len(), 1);
}

#[tokio::test]
async fn test_limit_keeps_newest_files() {
    let f = Fixture::new(|c| c.ingest.limit = 2);
    for i in 1..=5 {
        f.write(
            &format!("alert-00{i}.json"),
            &alert_json(&format!("a-{i}"), "storage-usage-high"),
        );
    }

    let report = f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(report.ingested, 2);
    assert!(f.repo.alert("a-5").is_some());
    assert!(f.repo.alert("a-4").is_some());
    assert!(f.repo.alert("a-3").is_none());
}

#[tokio::test]
async fn test_duplicate_alerts_within_window_get_no_delivery() {
    let f = Fixture::new(|c| c.dedupe.enabled = true);
    // Same type, message, source and context under different ids.
    f.write("alert-001.json", &alert_json("a-1", "storage-usage-high"));
    f.write("alert-002.json", &alert_json("a-2", "storage-usage-high"));

    let report = f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(report.ingested, 2);
    assert_eq!(report.deliveries_created, 1);
    assert_eq!(report.deduplicated, 1);
    // The newest file is processed first and wins.
    let mut deliveries = f.repo.deliveries();
    deliveries.sort_by(|a, b| a.alert_id.cmp(&b.alert_id));
    assert_eq!(deliveries.len(), 2);
    assert_eq!(deliveries[0].alert_id, "a-1");
    assert_eq!(deliveries[0].status, DeliveryStatus::Suppressed);
    assert_eq!(deliveries[0].attempt_count, 0);
    assert_eq!(deliveries[0].last_error.as_deref(), Some("Dedupe window (600s)"));
    assert_eq!(deliveries[1].alert_id, "a-2");
    assert_eq!(deliveries[1].status, DeliveryStatus::Pending);
}

#[tokio::test]
async fn test_duplicate_stays_suppressed_after_window() {
    let f = Fixture::new(|c| {
        c.dedupe.enabled = true;
        c.dedupe.default_window_seconds = 1;
    });
    f.write("alert-001.json", &alert_json("a-1", "storage-usage-high"));
    f.write("alert-002.json", &alert_json("a-2", "storage-usage-high"));
    let first = f.ingestor.ingest_once_now().await.unwrap();
    assert_eq!((first.deliveries_created, first.deduplicated), (1, 1));

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    let second = f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(second.ingested, 2);
    assert_eq!(second.deliveries_created, 0);
    assert_eq!(second.deduplicated, 0);
    let pending: Vec<String> = f
        .repo
        .deliveries()
        .into_iter()
        .filter(|d| d.status == DeliveryStatus::Pending)
        .map(|d| d.alert_id)
        .collect();
    assert_eq!(pending, vec!["a-2".to_string()]);
}

#[tokio::test]
async fn test_zero_window_disables_dedupe_for_route() {
    let f = Fixture::new(|c| {
        c.dedupe.enabled = true;
        c.dedupe.window_seconds_by_route_key.insert("ops".into(), 0);
    });
    f.write("alert-001.json", &alert_json("a-1", "storage-usage-high"));
    f.write("alert-002.json", &alert_json("a-2", "storage-usage-high"));
    f.write("alert-003.json", &alert_json("a-3", "ansible-update-failed"));
    f.write("alert-004.json", &alert_json("a-4", "ansible-update-failed"));

    let report = f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(report.deliveries_created, 3);
    assert_eq!(report.deduplicated, 1);
}

#[tokio::test]
async fn test_dedupe_off_creates_every_delivery() {
    let f = Fixture::new(|_| {});
    f.write("alert-001.json", &alert_json("a-1", "storage-usage-high"));
    f.write("alert-002.json", &alert_json("a-2", "storage-usage-high"));

    let report = f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(report.deliveries_created, 2);
    assert_eq!(report.deduplicated, 0);
}

#[tokio::test]
async fn test_missing_directory_is_empty() {
    let f = Fixture::new(|_| {});
    let missing = f.dir.path().join("does-not-exist");
    f.config.update(|c| c.alerts_dir = missing);

    let report = f.ingestor.ingest_once_now().await.unwrap();

    assert_eq!(report, Default::default());
}

#[tokio::test]
async fn test_run_ingests_immediately_and_stops_on_shutdown() {
    let f = Fixture::new(|_| {});
    f.write("alert-001.json", &alert_json("a-1", "storage-usage-high"));
    let Fixture {
        dir: _dir,
        repo,
        ingestor,
        ..
    } = f;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let handle = tokio::spawn(ingestor.run(shutdown_rx));

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while repo.alert("a-1").is_none() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("first pass should run without waiting for the interval");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
