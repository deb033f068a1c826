//! Repository wrappers that count calls and inject failures.

use alertdispatch::core::{
    Alert, AlertDelivery, AlertStore, DeliveryRepository, DeliveryUpdate, DeliveryVersion,
    EligibleDelivery,
};
use alertdispatch::repository::{InMemoryRepository, RepositoryError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Wraps an [`InMemoryRepository`], counting dispatcher-side calls.
#[derive(Debug, Default)]
pub struct CountingRepository {
    pub inner: Arc<InMemoryRepository>,
    finds: AtomicUsize,
    claims: AtomicUsize,
    updates: AtomicUsize,
    fail_reads: AtomicBool,
    fail_updates_for: Mutex<HashSet<String>>,
}

impl CountingRepository {
    pub fn new(inner: Arc<InMemoryRepository>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            ..Self::default()
        })
    }

    /// Total calls made through the [`DeliveryRepository`] trait.
    pub fn calls(&self) -> usize {
        self.finds() + self.claims.load(Ordering::SeqCst) + self.updates()
    }

    pub fn finds(&self) -> usize {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes the final write for `delivery_id` fail with a backend error.
    pub fn fail_updates_for(&self, delivery_id: &str) {
        self.fail_updates_for
            .lock()
            .unwrap()
            .insert(delivery_id.to_string());
    }
}

#[async_trait]
impl DeliveryRepository for CountingRepository {
    async fn find_eligible_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EligibleDelivery>, RepositoryError> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(RepositoryError::Backend("database is locked".into()));
        }
        self.inner.find_eligible_deliveries(now, limit).await
    }

    async fn claim_delivery(
        &self,
        id: &str,
        expected: &DeliveryVersion,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryVersion, RepositoryError> {
        self.claims.fetch_add(1, Ordering::SeqCst);
        self.inner.claim_delivery(id, expected, lease_until, now).await
    }

    async fn update_delivery(
        &self,
        id: &str,
        expected: &DeliveryVersion,
        update: &DeliveryUpdate,
    ) -> Result<(), RepositoryError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if self.fail_updates_for.lock().unwrap().contains(id) {
            return Err(RepositoryError::Backend("disk I/O error".into()));
        }
        self.inner.update_delivery(id, expected, update).await
    }
}

#[async_trait]
impl AlertStore for CountingRepository {
    async fn upsert_alert(&self, alert: &Alert) -> Result<(), RepositoryError> {
        self.inner.upsert_alert(alert).await
    }

    async fn has_delivery(&self, alert_id: &str, route_key: &str) -> Result<bool, RepositoryError> {
        self.inner.has_delivery(alert_id, route_key).await
    }

    async fn create_pending_delivery(
        &self,
        alert_id: &str,
        route_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertDelivery>, RepositoryError> {
        self.inner.create_pending_delivery(alert_id, route_key, now).await
    }

    async fn create_suppressed_delivery(
        &self,
        alert_id: &str,
        route_key: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertDelivery>, RepositoryError> {
        self.inner
            .create_suppressed_delivery(alert_id, route_key, reason, now)
            .await
    }

    async fn get_delivery(&self, id: &str) -> Result<Option<AlertDelivery>, RepositoryError> {
        self.inner.get_delivery(id).await
    }
}
