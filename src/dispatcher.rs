//! The alert delivery dispatcher.
//!
//! A [`DeliveryDispatcher`] repeatedly polls the repository for eligible
//! deliveries and drives each one through a single attempt:
//!
//! 1. claim the delivery with a conditional write (the lease),
//! 2. decide whether to suppress it,
//! 3. otherwise resolve the route, render the alert and call the sink under a
//!    hard deadline,
//! 4. write the resulting state back, conditional on the claim.
//!
//! The timer loop and [`DeliveryDispatcher::run_once_now`] share one cycle
//! function and one overlap guard.

use crate::config::{Config, ConfigError};
use crate::core::{
    Alert, AlertDelivery, Clock, ConfigProvider, DeliveryRepository, DeliveryUpdate,
    DeliveryVersion, EligibleDelivery, NotificationSink, SendResult,
};
use crate::delivery::{self, AttemptOutcome, RetryPolicy, ACKNOWLEDGED_REASON};
use crate::formatting::AlertFormatter;
use crate::notification::slack::timeout_reason;
use crate::repository::RepositoryError;
use crate::routing::{effective_route_key, resolve_webhook};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

/// Cycle-level failures. Per-delivery failures never surface here.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to query eligible deliveries: {0}")]
    Repository(#[from] RepositoryError),
}

/// Why a cycle did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    DispatcherDisabled,
    SlackDisabled,
}

/// What a single dispatch cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Deliveries returned by the eligibility query.
    pub processed: usize,
    pub sent: usize,
    /// Failed attempts that will be retried.
    pub failed: usize,
    /// Failed attempts that used up the last allowed attempt.
    pub exhausted: usize,
    pub suppressed: usize,
    /// Deliveries another writer changed first; left untouched.
    pub contended: usize,
    pub write_errors: usize,
    pub skipped: Option<SkipReason>,
    /// The dispatch interval from this cycle's configuration snapshot.
    pub interval: Option<Duration>,
}

impl CycleReport {
    fn skipped(reason: SkipReason, interval: Duration) -> Self {
        Self {
            skipped: Some(reason),
            interval: Some(interval),
            ..Self::default()
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

struct TimerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Shared state used by both the timer task and direct callers.
struct DispatcherCore {
    config: Arc<dyn ConfigProvider>,
    repository: Arc<dyn DeliveryRepository>,
    sink: Arc<dyn NotificationSink>,
    formatter: Arc<dyn AlertFormatter>,
    clock: Arc<dyn Clock>,
    /// Held for the duration of a cycle.
    cycle_lock: Mutex<()>,
}

/// Delivers stored alerts through a [`NotificationSink`] on a fixed interval.
pub struct DeliveryDispatcher {
    core: Arc<DispatcherCore>,
    timer: Mutex<Option<TimerHandle>>,
}

impl DeliveryDispatcher {
    pub fn new(
        config: Arc<dyn ConfigProvider>,
        repository: Arc<dyn DeliveryRepository>,
        sink: Arc<dyn NotificationSink>,
        formatter: Arc<dyn AlertFormatter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            core: Arc::new(DispatcherCore {
                config,
                repository,
                sink,
                formatter,
                clock,
                cycle_lock: Mutex::new(()),
            }),
            timer: Mutex::new(None),
        }
    }

    /// Starts the dispatcher.
    ///
    /// Runs one cycle immediately, then arms the repeating timer. Returns
    /// without scheduling anything (and without touching the repository) when
    /// dispatch or Slack is disabled. Calling `start` while started is a no-op.
    ///
    /// # Errors
    /// Returns [`DispatchError::Config`] if the configuration cannot be loaded.
    /// A failure of the initial cycle is logged, not returned.
    pub async fn start(&self) -> Result<(), DispatchError> {
        let mut timer = self.timer.lock().await;
        if timer.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            debug!("Dispatcher already running");
            return Ok(());
        }

        let config = self.core.config.snapshot().await?;
        config.validate()?;
        if !config.db_dispatcher.enabled {
            info!("Dispatcher disabled (db_dispatcher.enabled = false)");
            return Ok(());
        }
        if !config.slack.enabled {
            info!("Dispatcher disabled (slack.enabled = false)");
            return Ok(());
        }

        let period = config.dispatch_interval();
        info!(
            interval_seconds = period.as_secs(),
            batch_size = config.db_dispatcher.batch_size,
            max_attempts = config.max_attempts,
            "Starting dispatcher"
        );

        {
            let _guard = self.core.cycle_lock.lock().await;
            if let Err(e) = self.core.run_cycle().await {
                warn!(error = %e, "Initial dispatch cycle failed");
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_timer(self.core.clone(), period, shutdown_rx));
        *timer = Some(TimerHandle { shutdown_tx, handle });
        Ok(())
    }

    /// Stops the timer. An in-flight cycle is allowed to finish first.
    pub async fn stop(&self) {
        let Some(TimerHandle { shutdown_tx, handle }) = self.timer.lock().await.take() else {
            return;
        };
        shutdown_tx.send_replace(true);
        if let Err(e) = handle.await {
            warn!(error = %e, "Dispatcher timer task ended abnormally");
        }
        info!("Dispatcher stopped");
    }

    /// Whether the repeating timer is armed.
    pub async fn is_running(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|t| !t.handle.is_finished())
    }

    /// Runs exactly one cycle and returns its report.
    ///
    /// Waits for a cycle already in flight to finish before running.
    pub async fn run_once_now(&self) -> Result<CycleReport, DispatchError> {
        let _guard = self.core.cycle_lock.lock().await;
        self.core.run_cycle().await
    }
}

async fn run_timer(core: Arc<DispatcherCore>, mut period: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => break,
            _ = ticker.tick() => {}
        }

        let Ok(_guard) = core.cycle_lock.try_lock() else {
            debug!("Dispatch cycle still in flight, skipping tick");
            metrics::counter!("dispatch_cycles_total", "result" => "overlap").increment(1);
            continue;
        };

        match core.run_cycle().await {
            Ok(report) => {
                if let Some(next) = report.interval.filter(|next| *next != period) {
                    info!(
                        from_seconds = period.as_secs(),
                        to_seconds = next.as_secs(),
                        "Dispatch interval changed, re-arming timer"
                    );
                    period = next;
                    ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                }
            }
            Err(e) => warn!(error = %e, "Dispatch cycle failed"),
        }
    }
    debug!("Dispatcher timer loop finished");
}

impl DispatcherCore {
    /// One pass over the eligible batch. The caller must hold `cycle_lock`.
    #[instrument(name = "dispatch_cycle", skip_all)]
    async fn run_cycle(&self) -> Result<CycleReport, DispatchError> {
        let started = std::time::Instant::now();

        let config = match self
            .config
            .snapshot()
            .await
            .and_then(|config| config.validate().map(|()| config))
        {
            Ok(config) => config,
            Err(e) => {
                metrics::counter!("dispatch_cycles_total", "result" => "config_error").increment(1);
                return Err(e.into());
            }
        };
        let interval = config.dispatch_interval();

        if !config.db_dispatcher.enabled {
            debug!("Dispatcher disabled, skipping cycle");
            metrics::counter!("dispatch_cycles_total", "result" => "skipped").increment(1);
            return Ok(CycleReport::skipped(SkipReason::DispatcherDisabled, interval));
        }
        if !config.slack.enabled {
            debug!("Slack disabled, skipping cycle");
            metrics::counter!("dispatch_cycles_total", "result" => "skipped").increment(1);
            return Ok(CycleReport::skipped(SkipReason::SlackDisabled, interval));
        }

        let now = self.clock.now();
        let batch = match self
            .repository
            .find_eligible_deliveries(now, config.db_dispatcher.batch_size)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                metrics::counter!("dispatch_cycles_total", "result" => "repository_error").increment(1);
                return Err(e.into());
            }
        };

        let mut report = CycleReport {
            processed: batch.len(),
            interval: Some(interval),
            ..CycleReport::default()
        };
        let policy = RetryPolicy::new(config.max_attempts, config.retry_delay_seconds);

        for EligibleDelivery { delivery, alert } in batch {
            self.process_delivery(&delivery, &alert, &config, &policy, &mut report)
                .await;
        }

        metrics::counter!("dispatch_cycles_total", "result" => "completed").increment(1);
        metrics::histogram!("dispatch_cycle_duration_seconds").record(started.elapsed().as_secs_f64());

        if report.processed > 0 {
            info!(
                processed = report.processed,
                sent = report.sent,
                failed = report.failed,
                exhausted = report.exhausted,
                suppressed = report.suppressed,
                contended = report.contended,
                write_errors = report.write_errors,
                "Dispatch cycle completed"
            );
        } else {
            debug!("Dispatch cycle found no eligible deliveries");
        }
        Ok(report)
    }

    async fn process_delivery(
        &self,
        delivery: &AlertDelivery,
        alert: &Alert,
        config: &Config,
        policy: &RetryPolicy,
        report: &mut CycleReport,
    ) {
        let now = self.clock.now();
        // Validated to at most a day, so the conversion cannot fail.
        let lease = chrono::Duration::from_std(config.claim_lease()).unwrap_or(chrono::Duration::zero());

        let claimed = match self
            .repository
            .claim_delivery(&delivery.id, &delivery.version(), now + lease, now)
            .await
        {
            Ok(version) => version,
            Err(e) if e.is_conflict() => {
                debug!(delivery_id = %delivery.id, "Delivery claimed by another dispatcher, skipping");
                report.contended += 1;
                record_outcome("contended");
                return;
            }
            Err(e) => {
                warn!(delivery_id = %delivery.id, error = %e, "Failed to claim delivery");
                report.write_errors += 1;
                record_outcome("write_error");
                return;
            }
        };

        // max_attempts may have been lowered since the retry was scheduled.
        if delivery.is_terminal(policy.max_attempts) {
            let update = delivery::retire(delivery, self.clock.now());
            if self.persist(delivery, &claimed, &update, report).await {
                warn!(
                    delivery_id = %delivery.id,
                    alert_id = %alert.id,
                    attempts = delivery.attempt_count,
                    max_attempts = policy.max_attempts,
                    "Delivery exceeds max attempts, not retrying"
                );
                report.exhausted += 1;
                record_outcome("exhausted");
            }
            return;
        }

        let outcome = self.attempt(delivery, alert, config, now).await;
        let update = delivery::transition(delivery, &outcome, policy, self.clock.now());

        if !self.persist(delivery, &claimed, &update, report).await {
            return;
        }

        let label = match &outcome {
            AttemptOutcome::Sent => {
                report.sent += 1;
                "sent"
            }
            AttemptOutcome::Suppressed(reason) => {
                debug!(delivery_id = %delivery.id, alert_id = %alert.id, reason = %reason, "Delivery suppressed");
                report.suppressed += 1;
                "suppressed"
            }
            AttemptOutcome::Failed(reason) if update.next_attempt_at.is_none() => {
                warn!(
                    delivery_id = %delivery.id,
                    alert_id = %alert.id,
                    attempts = update.attempt_count,
                    error = %reason,
                    "Delivery failed permanently"
                );
                report.exhausted += 1;
                "exhausted"
            }
            AttemptOutcome::Failed(reason) => {
                warn!(
                    delivery_id = %delivery.id,
                    alert_id = %alert.id,
                    attempts = update.attempt_count,
                    error = %reason,
                    "Delivery failed, will retry"
                );
                report.failed += 1;
                "failed"
            }
        };
        record_outcome(label);
    }

    /// Writes `update` conditional on the claim. Failures are counted in
    /// `report` and yield `false`.
    async fn persist(
        &self,
        delivery: &AlertDelivery,
        claimed: &DeliveryVersion,
        update: &DeliveryUpdate,
        report: &mut CycleReport,
    ) -> bool {
        match self
            .repository
            .update_delivery(&delivery.id, claimed, update)
            .await
        {
            Ok(()) => true,
            Err(e) if e.is_conflict() => {
                warn!(delivery_id = %delivery.id, "Delivery changed while being sent, result discarded");
                report.contended += 1;
                record_outcome("contended");
                false
            }
            Err(e) => {
                warn!(delivery_id = %delivery.id, error = %e, "Failed to persist delivery result");
                report.write_errors += 1;
                record_outcome("write_error");
                false
            }
        }
    }

    /// Decides and performs the attempt for one claimed delivery.
    async fn attempt(
        &self,
        delivery: &AlertDelivery,
        alert: &Alert,
        config: &Config,
        now: chrono::DateTime<chrono::Utc>,
    ) -> AttemptOutcome {
        if alert.acknowledged {
            return AttemptOutcome::Suppressed(ACKNOWLEDGED_REASON.to_string());
        }

        let max_age = config.db_dispatcher.max_alert_age_seconds;
        if max_age > 0 && delivery.attempt_count == 0 {
            let age = now.signed_duration_since(alert.timestamp);
            if age.num_seconds() > i64::try_from(max_age).unwrap_or(i64::MAX) {
                return AttemptOutcome::Suppressed(delivery::too_old_reason(max_age));
            }
        }

        let route_key = effective_route_key(
            &delivery.route_key,
            alert.alert_type.as_deref(),
            &config.routing,
        );
        let Some(endpoint) = resolve_webhook(&route_key, &config.slack) else {
            return AttemptOutcome::Failed(format!("No webhook configured for route '{route_key}'"));
        };

        let rendered = self.formatter.render(&route_key, alert);
        let timeout = config.webhook_timeout();
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, self.sink.send(endpoint, &rendered, timeout)).await;
        metrics::histogram!("alert_send_duration_seconds", "sink" => self.sink.name().to_string())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(SendResult::Delivered) => AttemptOutcome::Sent,
            Ok(SendResult::Failed(reason)) => AttemptOutcome::Failed(reason),
            Err(_) => AttemptOutcome::Failed(timeout_reason(timeout)),
        }
    }
}

fn record_outcome(outcome: &'static str) {
    metrics::counter!("alert_deliveries_total", "outcome" => outcome).increment(1);
}
