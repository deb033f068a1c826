//! A sink for sending notifications to Slack incoming webhooks.

use crate::core::{NotificationSink, SendResult};
use crate::formatting::RenderedAlert;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Posts rendered alerts to Slack incoming webhooks.
///
/// The webhook URL is supplied per call, so one sink serves every route.
#[derive(Debug, Clone)]
pub struct SlackWebhookSink {
    client: reqwest::Client,
}

impl SlackWebhookSink {
    /// Creates a new `SlackWebhookSink` with its own connection pool.
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("alertdispatch/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    /// Creates a sink that shares an existing client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NotificationSink for SlackWebhookSink {
    fn name(&self) -> &str {
        "slack"
    }

    #[instrument(skip(self, endpoint, content), fields(summary = %content.summary))]
    async fn send(&self, endpoint: &str, content: &RenderedAlert, timeout: Duration) -> SendResult {
        let response = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .json(&content.payload)
            .send()
            .await;

        match response {
            Ok(res) if res.status().is_success() => {
                debug!(status = %res.status(), "Slack webhook accepted alert");
                SendResult::Delivered
            }
            Ok(res) => {
                let status = res.status();
                let reason = status.canonical_reason().unwrap_or("Unknown");
                warn!(status = %status, "Slack webhook rejected alert");
                SendResult::Failed(format!(
                    "Slack webhook returned {}: {}",
                    status.as_u16(),
                    reason
                ))
            }
            Err(e) if e.is_timeout() => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Slack webhook timed out");
                SendResult::Failed(timeout_reason(timeout))
            }
            Err(e) => {
                warn!(error = %e, "HTTP request to Slack failed");
                SendResult::Failed(e.without_url().to_string())
            }
        }
    }
}

/// The failure reason recorded when a webhook misses its deadline.
pub fn timeout_reason(timeout: Duration) -> String {
    format!(
        "Timeout: webhook did not respond within {}ms",
        timeout.as_millis()
    )
}
