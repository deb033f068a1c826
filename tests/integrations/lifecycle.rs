//! Start/stop behaviour of the dispatcher timer, on paused tokio time.

use alertdispatch::dispatcher::DispatchError;
use std::time::Duration;

#[path = "../helpers/mod.rs"]
mod helpers;
use helpers::{alert, dispatch_config, Harness};

async fn elapse(seconds: u64) {
    tokio::time::sleep(Duration::from_secs(seconds)).await;
}

#[tokio::test(start_paused = true)]
async fn test_start_runs_immediately_then_on_interval() {
    let h = Harness::new(dispatch_config());
    h.seed(&alert("a-1", "storage-usage-high")).await;

    h.dispatcher.start().await.unwrap();
    assert!(h.dispatcher.is_running().await);
    assert_eq!(h.counting.finds(), 1);
    assert_eq!(h.sink.calls(), 1);

    elapse(29).await;
    assert_eq!(h.counting.finds(), 1);

    elapse(2).await;
    assert_eq!(h.counting.finds(), 2);

    elapse(30).await;
    assert_eq!(h.counting.finds(), 3);

    h.dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_prevents_further_cycles() {
    let h = Harness::new(dispatch_config());
    h.dispatcher.start().await.unwrap();
    h.dispatcher.stop().await;

    assert!(!h.dispatcher.is_running().await);
    elapse(300).await;
    assert_eq!(h.counting.finds(), 1);

    // Stopping twice is harmless.
    h.dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent() {
    let h = Harness::new(dispatch_config());

    h.dispatcher.start().await.unwrap();
    h.dispatcher.start().await.unwrap();
    assert_eq!(h.counting.finds(), 1);

    elapse(31).await;
    assert_eq!(h.counting.finds(), 2);

    h.dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_restart_after_stop() {
    let h = Harness::new(dispatch_config());
    h.dispatcher.start().await.unwrap();
    h.dispatcher.stop().await;

    h.dispatcher.start().await.unwrap();
    assert!(h.dispatcher.is_running().await);
    assert_eq!(h.counting.finds(), 2);

    h.dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_interval_change_rearms_timer() {
    let h = Harness::new(dispatch_config());
    h.dispatcher.start().await.unwrap();

    h.config
        .inner
        .update(|c| c.db_dispatcher.interval_seconds = Some(10));

    // The 30s tick picks up the new interval; later ticks land at 40s and 50s.
    elapse(31).await;
    assert_eq!(h.counting.finds(), 2);
    elapse(20).await;
    assert_eq!(h.counting.finds(), 4);

    h.dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabled_start_schedules_nothing() {
    let mut config = dispatch_config();
    config.db_dispatcher.enabled = false;
    let h = Harness::new(config);

    h.dispatcher.start().await.unwrap();

    assert!(!h.dispatcher.is_running().await);
    elapse(300).await;
    assert_eq!(h.counting.calls(), 0);
    assert_eq!(h.config.snapshots(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_slack_disabled_start_schedules_nothing() {
    let mut config = dispatch_config();
    config.slack.enabled = false;
    let h = Harness::new(config);

    h.dispatcher.start().await.unwrap();

    assert!(!h.dispatcher.is_running().await);
    assert_eq!(h.counting.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_start_fails_when_config_unavailable() {
    let h = Harness::new(dispatch_config());
    h.config.set_failing(true);

    let err = h.dispatcher.start().await.unwrap_err();

    assert!(matches!(err, DispatchError::Config(_)));
    assert!(!h.dispatcher.is_running().await);
    assert_eq!(h.counting.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_failing_cycles_keep_timer_alive() {
    let h = Harness::new(dispatch_config());
    h.counting.fail_reads(true);

    // The initial cycle fails but start still succeeds.
    h.dispatcher.start().await.unwrap();
    assert!(h.dispatcher.is_running().await);

    elapse(31).await;
    assert_eq!(h.counting.finds(), 2);
    assert!(h.dispatcher.is_running().await);

    h.counting.fail_reads(false);
    h.seed(&alert("a-1", "storage-usage-high")).await;
    elapse(30).await;
    assert_eq!(h.sink.calls(), 1);

    h.dispatcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_disabling_at_runtime_skips_cycles_without_stopping() {
    let h = Harness::new(dispatch_config());
    h.dispatcher.start().await.unwrap();

    h.config.inner.update(|c| c.db_dispatcher.enabled = false);
    elapse(61).await;
    assert_eq!(h.counting.finds(), 1);
    assert!(h.dispatcher.is_running().await);

    h.config.inner.update(|c| c.db_dispatcher.enabled = true);
    elapse(30).await;
    assert_eq!(h.counting.finds(), 2);

    h.dispatcher.stop().await;
}
