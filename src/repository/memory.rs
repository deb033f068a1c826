//! An in-process repository guarded by a single mutex.

use super::{new_delivery_id, RepositoryError};
use crate::core::{
    Alert, AlertDelivery, AlertStore, DeliveryRepository, DeliveryUpdate, DeliveryVersion,
    EligibleDelivery,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    alerts: HashMap<String, Alert>,
    deliveries: HashMap<String, AlertDelivery>,
}

/// Keeps alerts and deliveries in memory. State is lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    state: Mutex<State>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `delivery` unless its `(alert_id, route_key)` pair exists.
    fn insert_new(&self, delivery: AlertDelivery) -> Result<Option<AlertDelivery>, RepositoryError> {
        let mut state = self.lock();
        if !state.alerts.contains_key(&delivery.alert_id) {
            return Err(RepositoryError::AlertNotFound { id: delivery.alert_id });
        }
        if state
            .deliveries
            .values()
            .any(|d| d.alert_id == delivery.alert_id && d.route_key == delivery.route_key)
        {
            return Ok(None);
        }
        state.deliveries.insert(delivery.id.clone(), delivery.clone());
        Ok(Some(delivery))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores a delivery as-is, replacing any delivery with the same id.
    pub fn insert_delivery(&self, delivery: AlertDelivery) {
        self.lock().deliveries.insert(delivery.id.clone(), delivery);
    }

    /// Returns a copy of every delivery, ordered by creation time.
    pub fn deliveries(&self) -> Vec<AlertDelivery> {
        let mut all: Vec<_> = self.lock().deliveries.values().cloned().collect();
        all.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        all
    }

    pub fn delivery(&self, id: &str) -> Option<AlertDelivery> {
        self.lock().deliveries.get(id).cloned()
    }

    pub fn alert(&self, id: &str) -> Option<Alert> {
        self.lock().alerts.get(id).cloned()
    }

    /// Flips the acknowledgement flag, as an operator would.
    pub fn set_acknowledged(&self, alert_id: &str, acknowledged: bool) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let alert = state
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| RepositoryError::AlertNotFound { id: alert_id.to_string() })?;
        alert.acknowledged = acknowledged;
        Ok(())
    }

    fn checked_mut<'a>(
        state: &'a mut State,
        id: &str,
        expected: &DeliveryVersion,
    ) -> Result<&'a mut AlertDelivery, RepositoryError> {
        let delivery = state
            .deliveries
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound { id: id.to_string() })?;
        if delivery.version() != *expected {
            return Err(RepositoryError::Conflict { id: id.to_string() });
        }
        Ok(delivery)
    }
}

#[async_trait]
impl DeliveryRepository for InMemoryRepository {
    async fn find_eligible_deliveries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<EligibleDelivery>, RepositoryError> {
        let state = self.lock();
        let mut eligible: Vec<EligibleDelivery> = state
            .deliveries
            .values()
            .filter(|d| d.is_eligible(now))
            .filter_map(|d| {
                state.alerts.get(&d.alert_id).map(|alert| EligibleDelivery {
                    delivery: d.clone(),
                    alert: alert.clone(),
                })
            })
            .collect();
        eligible.sort_by(|a, b| {
            let a = &a.delivery;
            let b = &b.delivery;
            (a.eligible_since(), a.created_at, &a.id).cmp(&(b.eligible_since(), b.created_at, &b.id))
        });
        eligible.truncate(limit);
        Ok(eligible)
    }

    async fn claim_delivery(
        &self,
        id: &str,
        expected: &DeliveryVersion,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<DeliveryVersion, RepositoryError> {
        let mut state = self.lock();
        let delivery = Self::checked_mut(&mut state, id, expected)?;
        delivery.next_attempt_at = Some(lease_until);
        delivery.updated_at = now;
        Ok(delivery.version())
    }

    async fn update_delivery(
        &self,
        id: &str,
        expected: &DeliveryVersion,
        update: &DeliveryUpdate,
    ) -> Result<(), RepositoryError> {
        let mut state = self.lock();
        let delivery = Self::checked_mut(&mut state, id, expected)?;
        delivery.apply(update);
        Ok(())
    }
}

#[async_trait]
impl AlertStore for InMemoryRepository {
    async fn upsert_alert(&self, alert: &Alert) -> Result<(), RepositoryError> {
        self.lock().alerts.insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn has_delivery(&self, alert_id: &str, route_key: &str) -> Result<bool, RepositoryError> {
        Ok(self
            .lock()
            .deliveries
            .values()
            .any(|d| d.alert_id == alert_id && d.route_key == route_key))
    }

    async fn create_pending_delivery(
        &self,
        alert_id: &str,
        route_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertDelivery>, RepositoryError> {
        self.insert_new(AlertDelivery::pending(new_delivery_id(), alert_id, route_key, now))
    }

    async fn create_suppressed_delivery(
        &self,
        alert_id: &str,
        route_key: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<AlertDelivery>, RepositoryError> {
        self.insert_new(AlertDelivery::suppressed(new_delivery_id(), alert_id, route_key, reason, now))
    }

    async fn get_delivery(&self, id: &str) -> Result<Option<AlertDelivery>, RepositoryError> {
        Ok(self.delivery(id))
    }
}
