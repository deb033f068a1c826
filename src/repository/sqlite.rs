//! SQLite-backed repository.
//!
//! Timestamps are stored as epoch milliseconds. All statements run on the
//! blocking pool so the async runtime is never stalled by disk I/O.

use super::{new_delivery_id, RepositoryError};
use crate::core::{
    Alert, AlertDelivery, AlertStore, DeliveryRepository, DeliveryStatus, DeliveryUpdate,
    DeliveryVersion, EligibleDelivery, Severity,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task;

const SCHEMA_VERSION: i64 = 1;

const DELIVERY_COLUMNS: &str = "d.id, d.alert_id, d.route_key, d.attempt_count, d.status, d.last_error, \
     d.next_attempt_at_ms, d.last_attempt_at_ms, d.sent_at_ms, d.created_at_ms, d.updated_at_ms";

const ALERT_COLUMNS: &str = "a.id, a.type, a.message, a.severity, a.details, a.source, a.context, \
     a.fingerprint, a.timestamp_ms, a.acknowledged";

/// A repository persisted in a SQLite database file (or `:memory:`).
#[derive(Clone)]
pub struct SqliteRepository {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteRepository").finish_non_exhaustive()
    }
}

impl SqliteRepository {
    /// Opens (or creates) the database at `path` and ensures the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let conn = Connection::open(path.as_ref()).map_err(|e| backend("open sqlite database", e))?;
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, RepositoryError> {
        let conn = Connection::open_in_memory().map_err(|e| backend("open sqlite database", e))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, RepositoryError> {
        ensure_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, RepositoryError> + Send + 'static,
    {
        let conn = self.conn.clone();
        task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| RepositoryError::Backend("sqlite connection lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| RepositoryError::Backend(format!("sqlite task failed: {e}")))?
    }

    /// Inserts `delivery` unless its `(alert_id, route_key)` pair exists.
    async fn insert_new(&self, delivery: AlertDelivery) -> Result<Option<AlertDelivery>, RepositoryError> {
        self.with_conn(move |conn| {
            let alert_exists = conn
                .query_row("SELECT 1 FROM alerts WHERE id = ?1", params![delivery.alert_id], |_| Ok(()))
                .optional()
                .map_err(|e| backend("lookup alert", e))?
                .is_some();
            if !alert_exists {
                return Err(RepositoryError::AlertNotFound { id: delivery.alert_id });
            }
            let inserted = conn
                .execute(
                    "INSERT INTO alert_deliveries (id, alert_id, route_key, status, attempt_count, last_error, created_at_ms, updated_at_ms)
                     VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6, ?6)
                     ON CONFLICT(alert_id, route_key) DO NOTHING",
                    params![
                        delivery.id,
                        delivery.alert_id,
                        delivery.route_key,
                        delivery.status.as_str(),
                        delivery.last_error,
                        dt_to_ms(delivery.created_at),
                    ],
                )
                .map_err(|e| backend("insert delivery", e))?;
            if inserted == 0 {
                return Ok(None);
            }
            Ok(Some(AlertDelivery {
                created_at: ms_to_dt(dt_to_ms(delivery.created_at)),
                updated_at: ms_to_dt(dt_to_ms(delivery.updated_at)),
                ..delivery
            }))
        })
        .await
    }

    /// Flips the acknowledgement flag, as an operator would.
    pub async fn set_acknowledged(&self, alert_id: &str, acknowledged: bool) -> Result<(), RepositoryError> {
        let alert_id = alert_id.to_string();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE alerts SET acknowledged = ?2 WHERE id = ?1",
                    params![alert_id, acknowledged],
                )
                .map_err(|e| backend("acknowledge alert", e))?;
            if changed == 0 {
                return Err(RepositoryError::AlertNotFound { id: alert_id });
            }
            Ok(())
        })
        .await
    }
}

fn ensure_schema(conn: &Connection) -> Result<(), RepositoryError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
          version INTEGER PRIMARY KEY,
          applied_at_ms INTEGER NOT NULL
        );
        "#,
    )
    .map_err(|e| backend("init migration table", e))?;

    let current: i64 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |r| r.get(0))
        .map_err(|e| backend("read schema version", e))?;
    if current > SCHEMA_VERSION {
        return Err(RepositoryError::Backend(format!(
            "sqlite schema version {current} is newer than supported {SCHEMA_VERSION}"
        )));
    }
    if current < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
              id TEXT PRIMARY KEY,
              type TEXT,
              message TEXT,
              severity TEXT,
              details TEXT,
              source TEXT,
              context TEXT,
              fingerprint TEXT,
              timestamp_ms INTEGER NOT NULL,
              acknowledged INTEGER NOT NULL DEFAULT 0
            );
            CREATE TABLE IF NOT EXISTS alert_deliveries (
              id TEXT PRIMARY KEY,
              alert_id TEXT NOT NULL REFERENCES alerts(id),
              route_key TEXT NOT NULL,
              status TEXT NOT NULL,
              attempt_count INTEGER NOT NULL DEFAULT 0,
              last_error TEXT,
              next_attempt_at_ms INTEGER,
              last_attempt_at_ms INTEGER,
              sent_at_ms INTEGER,
              created_at_ms INTEGER NOT NULL,
              updated_at_ms INTEGER NOT NULL,
              UNIQUE (alert_id, route_key)
            );
            CREATE INDEX IF NOT EXISTS idx_alert_deliveries_due
              ON alert_deliveries (status, next_attempt_at_ms);
            "#,
        )
        .map_err(|e| backend("apply schema v1", e))?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at_ms) VALUES (?1, ?2)",
            params![1, dt_to_ms(Utc::now())],
        )
        .map_err(|e| backend("record schema v1", e))?;
    }
    Ok(())
}

#[async_trait]
impl DeliveryRepository for SqliteRepository {
    async fn find_eligible_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EligibleDelivery>, RepositoryError> {
        let now_ms = dt_to_ms(now);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {DELIVERY_COLUMNS}, {ALERT_COLUMNS}
                 FROM alert_deliveries d
                 JOIN alerts a ON a.id = d.alert_id
                 WHERE (d.status = 'PENDING' AND (d.next_attempt_at_ms IS NULL OR d.next_attempt_at_ms <= ?1))
                    OR (d.status = 'FAILED' AND d.next_attempt_at_ms IS NOT NULL AND d.next_attempt_at_ms <= ?1)
                 ORDER BY COALESCE(d.next_attempt_at_ms, d.created_at_ms) ASC, d.created_at_ms ASC, d.id ASC
                 LIMIT ?2"
            );
            let mut stmt = conn.prepare(&sql).map_err(|e| backend("prepare eligible query", e))?;
            let rows = stmt
                .query_map(params![now_ms, limit as i64], |row| {
                    Ok(EligibleDelivery {
                        delivery: map_row_to_delivery(row, 0)?,
                        alert: map_row_to_alert(row, 11)?,
                    })
                })
                .map_err(|e| backend("query eligible deliveries", e))?;
            rows.collect::<Result<Vec<_>, _>>()
                .map_err(|e| backend("scan eligible deliveries", e))
        })
        .await
    }

    async fn claim_delivery(
        &self,
        id: &str,
        expected: &DeliveryVersion,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryVersion, RepositoryError> {
        let id = id.to_string();
        let expected = *expected;
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE alert_deliveries
                     SET next_attempt_at_ms = ?5, updated_at_ms = ?6
                     WHERE id = ?1 AND status = ?2 AND attempt_count = ?3 AND next_attempt_at_ms IS ?4",
                    params![
                        id,
                        expected.status.as_str(),
                        expected.attempt_count,
                        expected.next_attempt_at.map(dt_to_ms),
                        dt_to_ms(lease_until),
                        dt_to_ms(now),
                    ],
                )
                .map_err(|e| backend("claim delivery", e))?;
            if changed == 0 {
                return Err(missing_or_conflict(conn, id));
            }
            Ok(DeliveryVersion {
                next_attempt_at: Some(ms_to_dt(dt_to_ms(lease_until))),
                ..expected
            })
        })
        .await
    }

    async fn update_delivery(
        &self,
        id: &str,
        expected: &DeliveryVersion,
        update: &DeliveryUpdate,
    ) -> Result<(), RepositoryError> {
        let id = id.to_string();
        let expected = *expected;
        let update = update.clone();
        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE alert_deliveries
                     SET status = ?5, attempt_count = ?6, last_error = ?7, next_attempt_at_ms = ?8,
                         last_attempt_at_ms = ?9, sent_at_ms = ?10, updated_at_ms = ?11
                     WHERE id = ?1 AND status = ?2 AND attempt_count = ?3 AND next_attempt_at_ms IS ?4",
                    params![
                        id,
                        expected.status.as_str(),
                        expected.attempt_count,
                        expected.next_attempt_at.map(dt_to_ms),
                        update.status.as_str(),
                        update.attempt_count,
                        update.last_error,
                        update.next_attempt_at.map(dt_to_ms),
                        update.last_attempt_at.map(dt_to_ms),
                        update.sent_at.map(dt_to_ms),
                        dt_to_ms(update.updated_at),
                    ],
                )
                .map_err(|e| backend("update delivery", e))?;
            if changed == 0 {
                return Err(missing_or_conflict(conn, id));
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl AlertStore for SqliteRepository {
    async fn upsert_alert(&self, alert: &Alert) -> Result<(), RepositoryError> {
        let alert = alert.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO alerts (id, type, message, severity, details, source, context, fingerprint, timestamp_ms, acknowledged)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(id) DO UPDATE SET
                   type = excluded.type,
                   message = excluded.message,
                   severity = excluded.severity,
                   details = excluded.details,
                   source = excluded.source,
                   context = excluded.context,
                   fingerprint = excluded.fingerprint,
                   timestamp_ms = excluded.timestamp_ms,
                   acknowledged = excluded.acknowledged",
                params![
                    alert.id,
                    alert.alert_type,
                    alert.message,
                    alert.severity.map(|s| s.as_str()),
                    alert.details.as_ref().map(Value::to_string),
                    alert.source.as_ref().map(Value::to_string),
                    alert.context.as_ref().map(Value::to_string),
                    alert.fingerprint,
                    dt_to_ms(alert.timestamp),
                    alert.acknowledged,
                ],
            )
            .map_err(|e| backend("upsert alert", e))?;
            Ok(())
        })
        .await
    }

    async fn has_delivery(&self, alert_id: &str, route_key: &str) -> Result<bool, RepositoryError> {
        let alert_id = alert_id.to_string();
        let route_key = route_key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT 1 FROM alert_deliveries WHERE alert_id = ?1 AND route_key = ?2",
                params![alert_id, route_key],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .map_err(|e| backend("lookup delivery", e))
        })
        .await
    }

    async fn create_pending_delivery(
        &self,
        alert_id: &str,
        route_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertDelivery>, RepositoryError> {
        self.insert_new(AlertDelivery::pending(new_delivery_id(), alert_id, route_key, now))
            .await
    }

    async fn create_suppressed_delivery(
        &self,
        alert_id: &str,
        route_key: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertDelivery>, RepositoryError> {
        self.insert_new(AlertDelivery::suppressed(new_delivery_id(), alert_id, route_key, reason, now))
            .await
    }

    async fn get_delivery(&self, id: &str) -> Result<Option<AlertDelivery>, RepositoryError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {DELIVERY_COLUMNS} FROM alert_deliveries d WHERE d.id = ?1");
            conn.query_row(&sql, params![id], |row| map_row_to_delivery(row, 0))
                .optional()
                .map_err(|e| backend("get delivery", e))
        })
        .await
    }
}

fn missing_or_conflict(conn: &Connection, id: String) -> RepositoryError {
    let exists = conn
        .query_row("SELECT 1 FROM alert_deliveries WHERE id = ?1", params![id], |_| Ok(()))
        .optional();
    match exists {
        Ok(Some(())) => RepositoryError::Conflict { id },
        Ok(None) => RepositoryError::NotFound { id },
        Err(e) => backend("lookup delivery", e),
    }
}

fn map_row_to_delivery(row: &Row, offset: usize) -> rusqlite::Result<AlertDelivery> {
    let status: String = row.get(offset + 4)?;
    let status = DeliveryStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            offset + 4,
            rusqlite::types::Type::Text,
            format!("unknown delivery status {status}").into(),
        )
    })?;
    Ok(AlertDelivery {
        id: row.get(offset)?,
        alert_id: row.get(offset + 1)?,
        route_key: row.get(offset + 2)?,
        attempt_count: row.get(offset + 3)?,
        status,
        last_error: row.get(offset + 5)?,
        next_attempt_at: row.get::<_, Option<i64>>(offset + 6)?.map(ms_to_dt),
        last_attempt_at: row.get::<_, Option<i64>>(offset + 7)?.map(ms_to_dt),
        sent_at: row.get::<_, Option<i64>>(offset + 8)?.map(ms_to_dt),
        created_at: ms_to_dt(row.get(offset + 9)?),
        updated_at: ms_to_dt(row.get(offset + 10)?),
    })
}

fn map_row_to_alert(row: &Row, offset: usize) -> rusqlite::Result<Alert> {
    let json = |idx: usize| -> rusqlite::Result<Option<Value>> {
        let raw: Option<String> = row.get(idx)?;
        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
    };
    Ok(Alert {
        id: row.get(offset)?,
        alert_type: row.get(offset + 1)?,
        message: row.get(offset + 2)?,
        severity: row
            .get::<_, Option<String>>(offset + 3)?
            .and_then(|s| Severity::parse(&s)),
        details: json(offset + 4)?,
        source: json(offset + 5)?,
        context: json(offset + 6)?,
        fingerprint: row.get(offset + 7)?,
        timestamp: ms_to_dt(row.get(offset + 8)?),
        acknowledged: row.get(offset + 9)?,
    })
}

fn backend(action: &str, err: rusqlite::Error) -> RepositoryError {
    RepositoryError::Backend(format!("{action}: {err}"))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}
