//! Delivery state transitions.
//!
//! Every attempt the dispatcher makes ends in exactly one [`AttemptOutcome`],
//! which [`transition`] turns into the [`DeliveryUpdate`] written back to the
//! repository. Nothing here touches I/O.

use crate::core::{AlertDelivery, DeliveryStatus, DeliveryUpdate};
use chrono::{DateTime, Duration, Utc};

/// Maximum length of a stored `last_error`, in characters.
pub const MAX_ERROR_LEN: usize = 500;

pub const ACKNOWLEDGED_REASON: &str = "Acknowledged";

const MAX_RETRY_DELAY_SECONDS: u64 = 365 * 24 * 60 * 60;

/// What happened to a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The alert must not be sent. Does not count as an attempt.
    Suppressed(String),
    Sent,
    /// The send failed or could not be made.
    Failed(String),
}

/// Retry limits taken from the configuration snapshot of the current cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retry_delay_seconds: u64) -> Self {
        Self {
            max_attempts,
            retry_delay: Duration::seconds(retry_delay_seconds.min(MAX_RETRY_DELAY_SECONDS) as i64),
        }
    }
}

/// Computes the new delivery state for an attempt outcome.
pub fn transition(
    delivery: &AlertDelivery,
    outcome: &AttemptOutcome,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> DeliveryUpdate {
    match outcome {
        AttemptOutcome::Suppressed(reason) => DeliveryUpdate {
            status: DeliveryStatus::Suppressed,
            attempt_count: delivery.attempt_count,
            last_error: Some(normalize_error(reason)),
            next_attempt_at: None,
            last_attempt_at: Some(now),
            sent_at: None,
            updated_at: now,
        },
        AttemptOutcome::Sent => DeliveryUpdate {
            status: DeliveryStatus::Sent,
            attempt_count: delivery.attempt_count + 1,
            last_error: None,
            next_attempt_at: None,
            last_attempt_at: Some(now),
            sent_at: Some(now),
            updated_at: now,
        },
        AttemptOutcome::Failed(reason) => {
            let attempt_count = delivery.attempt_count + 1;
            let next_attempt_at = if attempt_count >= policy.max_attempts {
                None
            } else {
                Some(now + policy.retry_delay)
            };
            DeliveryUpdate {
                status: DeliveryStatus::Failed,
                attempt_count,
                last_error: Some(normalize_error(reason)),
                next_attempt_at,
                last_attempt_at: Some(now),
                sent_at: None,
                updated_at: now,
            }
        }
    }
}

/// Closes out a `FAILED` delivery that has no attempts left without making
/// another one. The previous error and attempt time are kept.
pub fn retire(delivery: &AlertDelivery, now: DateTime<Utc>) -> DeliveryUpdate {
    DeliveryUpdate {
        status: DeliveryStatus::Failed,
        attempt_count: delivery.attempt_count,
        last_error: delivery.last_error.clone(),
        next_attempt_at: None,
        last_attempt_at: delivery.last_attempt_at,
        sent_at: None,
        updated_at: now,
    }
}

/// Reduces an error message to its first line with whitespace collapsed,
/// truncated to [`MAX_ERROR_LEN`] characters.
pub fn normalize_error(raw: &str) -> String {
    let first_line = raw.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");
    let normalized: String = collapsed.chars().take(MAX_ERROR_LEN).collect();
    if normalized.is_empty() {
        "Unknown error".to_string()
    } else {
        normalized
    }
}

/// The suppression reason for a stale first attempt.
pub fn too_old_reason(max_age_seconds: u64) -> String {
    format!("Too old (>{max_age_seconds}s)")
}

/// The suppression reason for a duplicate inside the dedupe window.
pub fn dedupe_reason(window_seconds: u64) -> String {
    format!("Dedupe window ({window_seconds}s)")
}
