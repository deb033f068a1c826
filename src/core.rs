//! Core domain types and service traits for the alert dispatcher
//!
//! This module defines the alert and delivery records, and the trait contracts
//! the dispatcher uses to talk to configuration, storage and the outbound
//! notification channel.

use crate::config::{Config, ConfigError};
use crate::formatting::RenderedAlert;
use crate::repository::RepositoryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Severity attached to an alert by the pipeline that produced it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    /// Parses a severity case-insensitively. Unknown values yield `None`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "INFO" => Some(Self::Info),
            "WARNING" => Some(Self::Warning),
            "ERROR" => Some(Self::Error),
            "CRITICAL" => Some(Self::Critical),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record describing a detected condition.
///
/// Alerts are owned by the upstream pipeline; the dispatcher only reads them.
/// `acknowledged` is flipped by an operator outside of this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: Option<String>,
    pub message: Option<String>,
    pub severity: Option<Severity>,
    /// Opaque structured payload.
    pub details: Option<Value>,
    pub source: Option<Value>,
    pub context: Option<Value>,
    pub fingerprint: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
}

impl Alert {
    /// Creates a minimal, unacknowledged alert.
    pub fn new(id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            alert_type: None,
            message: None,
            severity: None,
            details: None,
            source: None,
            context: None,
            fingerprint: None,
            timestamp,
            acknowledged: false,
        }
    }
}

/// Lifecycle status of a delivery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
    Suppressed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
            Self::Suppressed => "SUPPRESSED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "FAILED" => Some(Self::Failed),
            "SUPPRESSED" => Some(Self::Suppressed),
            _ => None,
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One delivery lineage of an alert to a single route. Owns the retry state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertDelivery {
    pub id: String,
    pub alert_id: String,
    pub route_key: String,
    pub attempt_count: u32,
    pub status: DeliveryStatus,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AlertDelivery {
    /// Creates a fresh `PENDING` delivery with no attempts.
    pub fn pending(
        id: impl Into<String>,
        alert_id: impl Into<String>,
        route_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            alert_id: alert_id.into(),
            route_key: route_key.into(),
            attempt_count: 0,
            status: DeliveryStatus::Pending,
            last_error: None,
            next_attempt_at: None,
            last_attempt_at: None,
            sent_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Creates a `SUPPRESSED` delivery that was never attempted.
    pub fn suppressed(
        id: impl Into<String>,
        alert_id: impl Into<String>,
        route_key: impl Into<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: DeliveryStatus::Suppressed,
            last_error: Some(reason.into()),
            ..Self::pending(id, alert_id, route_key, now)
        }
    }

    /// The fields a conditional write is keyed on.
    pub fn version(&self) -> DeliveryVersion {
        DeliveryVersion {
            status: self.status,
            attempt_count: self.attempt_count,
            next_attempt_at: self.next_attempt_at,
        }
    }

    /// Whether the delivery can never be processed again.
    pub fn is_terminal(&self, max_attempts: u32) -> bool {
        match self.status {
            DeliveryStatus::Sent | DeliveryStatus::Suppressed => true,
            DeliveryStatus::Failed => self.attempt_count >= max_attempts,
            DeliveryStatus::Pending => false,
        }
    }

    /// Whether the delivery is due at `now`.
    ///
    /// A `PENDING` delivery is due unless it carries a live claim. A `FAILED`
    /// delivery is due only when a retry has been scheduled and has come due.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            DeliveryStatus::Pending => self.next_attempt_at.is_none_or(|at| at <= now),
            DeliveryStatus::Failed => self.next_attempt_at.is_some_and(|at| at <= now),
            DeliveryStatus::Sent | DeliveryStatus::Suppressed => false,
        }
    }

    /// The instant the delivery became due, used for oldest-first ordering.
    pub fn eligible_since(&self) -> DateTime<Utc> {
        self.next_attempt_at.unwrap_or(self.created_at)
    }

    /// Applies an update to this in-memory record.
    pub fn apply(&mut self, update: &DeliveryUpdate) {
        self.status = update.status;
        self.attempt_count = update.attempt_count;
        self.last_error = update.last_error.clone();
        self.next_attempt_at = update.next_attempt_at;
        self.last_attempt_at = update.last_attempt_at;
        self.sent_at = update.sent_at;
        self.updated_at = update.updated_at;
    }
}

/// The compare-and-swap key for a delivery.
///
/// A write succeeds only when the stored delivery still has exactly these
/// values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryVersion {
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// The full set of fields the dispatcher writes back after an attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryUpdate {
    pub status: DeliveryStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A delivery joined with its alert.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibleDelivery {
    pub delivery: AlertDelivery,
    pub alert: Alert,
}

/// Outcome of a single send through a [`NotificationSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendResult {
    Delivered,
    /// A short, human-readable failure reason.
    Failed(String),
}

impl SendResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

// =============================================================================
// Service Traits
// =============================================================================

/// Supplies a configuration snapshot on demand.
#[async_trait]
pub trait ConfigProvider: Send + Sync {
    /// Returns a fresh snapshot. Called once per dispatch cycle.
    async fn snapshot(&self) -> Result<Config, ConfigError>;
}

/// Conditional-update access to deliveries, as used by the dispatcher.
#[async_trait]
pub trait DeliveryRepository: Send + Sync {
    /// Returns deliveries that are `PENDING` (without a live claim) or `FAILED`
    /// with a retry due at or before `now`, joined with their alert, ordered
    /// oldest-eligible-first and capped at `limit`.
    async fn find_eligible_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EligibleDelivery>, RepositoryError>;

    /// Claims a delivery by moving its `next_attempt_at` to `lease_until`.
    ///
    /// # Returns
    /// * `Ok(version)` with the claimed version on success
    /// * `Err(RepositoryError::Conflict)` if the stored version no longer
    ///   matches `expected`
    async fn claim_delivery(
        &self,
        id: &str,
        expected: &DeliveryVersion,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryVersion, RepositoryError>;

    /// Writes the result of an attempt, conditional on `expected`.
    async fn update_delivery(
        &self,
        id: &str,
        expected: &DeliveryVersion,
        update: &DeliveryUpdate,
    ) -> Result<(), RepositoryError>;
}

/// Write access for the upstream pipeline that creates alerts and deliveries.
#[async_trait]
pub trait AlertStore: Send + Sync {
    /// Inserts the alert or replaces the stored copy with the same id.
    async fn upsert_alert(&self, alert: &Alert) -> Result<(), RepositoryError>;

    async fn has_delivery(&self, alert_id: &str, route_key: &str) -> Result<bool, RepositoryError>;

    /// Creates a `PENDING` delivery unless one already exists for the pair.
    ///
    /// # Returns
    /// * `Ok(Some(delivery))` if a new delivery was created
    /// * `Ok(None)` if a delivery for `(alert_id, route_key)` already existed
    async fn create_pending_delivery(
        &self,
        alert_id: &str,
        route_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertDelivery>, RepositoryError>;

    /// Records a delivery that was decided against before any attempt, such
    /// as a duplicate inside the dedupe window. The delivery starts out
    /// `SUPPRESSED` with `reason` as its error, so the pair is never
    /// delivered later. Returns `Ok(None)` like `create_pending_delivery`.
    async fn create_suppressed_delivery(
        &self,
        alert_id: &str,
        route_key: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertDelivery>, RepositoryError>;

    async fn get_delivery(&self, id: &str) -> Result<Option<AlertDelivery>, RepositoryError>;
}

/// Sends rendered alerts to an outbound destination.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// A short name for the sink, used for logging and metrics.
    fn name(&self) -> &str;

    /// Sends `content` to `endpoint`, honouring `timeout`.
    ///
    /// Ordinary delivery failures (network errors, non-success responses,
    /// timeouts) are reported as [`SendResult::Failed`], never as panics.
    async fn send(&self, endpoint: &str, content: &RenderedAlert, timeout: Duration) -> SendResult;
}

/// Source of wall-clock time for scheduling decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
