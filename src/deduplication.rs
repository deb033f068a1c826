// Fingerprinting and time-windowed suppression of repeated alerts.

use crate::core::Alert;
use moka::future::Cache;
use moka::Expiry;
use serde_json::json;
use std::time::{Duration, Instant};

/// Computes a stable fingerprint for an alert on a route.
///
/// The hash covers the route, type, message, source and context. Timestamps
/// and ids are left out so that repeats of the same condition collide.
pub fn compute_alert_fingerprint(alert: &Alert, route_key: &str) -> String {
    // serde_json maps are ordered by key, so the encoding is stable.
    let stable = json!({
        "routeKey": route_key,
        "type": alert.alert_type,
        "message": alert.message,
        "source": alert.source,
        "context": alert.context,
    });
    blake3::hash(stable.to_string().as_bytes()).to_hex().to_string()
}

/// Each entry lives for the window it was inserted with.
struct WindowExpiry;

impl Expiry<String, Duration> for WindowExpiry {
    fn expire_after_create(&self, _key: &String, window: &Duration, _created_at: Instant) -> Option<Duration> {
        Some(*window)
    }
}

/// A service that filters out repeated fingerprints within a per-route window.
pub struct Deduplicator {
    cache: Cache<String, Duration>,
}

impl Deduplicator {
    /// Creates a new `Deduplicator`.
    ///
    /// # Arguments
    /// * `max_capacity` - The maximum number of fingerprints remembered.
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(WindowExpiry)
            .build();
        Self { cache }
    }

    /// Checks if a fingerprint was already seen on a route within `window`.
    ///
    /// The first sighting is remembered for `window`. A zero window disables
    /// deduplication for the call.
    ///
    /// # Returns
    /// * `true` if the fingerprint is a duplicate.
    /// * `false` if it is new (or the window is zero).
    pub async fn is_duplicate(&self, route_key: &str, fingerprint: &str, window: Duration) -> bool {
        if window.is_zero() {
            return false;
        }
        let key = format!("{route_key}::{fingerprint}");
        let entry = self.cache.entry(key).or_insert(window).await;
        let is_dupe = !entry.is_fresh();

        metrics::gauge!("deduplication_cache_entries").set(self.cache.entry_count() as f64);

        is_dupe
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(10_000)
    }
}
