// src/formatting.rs

use crate::core::Alert;
use chrono::SecondsFormat;
use serde_json::{json, Value};

/// An alert rendered for an outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedAlert {
    /// A one-line plain-text summary.
    pub summary: String,
    /// The request body posted to the channel.
    pub payload: Value,
}

/// A trait for rendering a single alert for a route.
pub trait AlertFormatter: Send + Sync {
    fn render(&self, route_key: &str, alert: &Alert) -> RenderedAlert;
}

/// Renders Slack Block Kit messages for incoming webhooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct SlackBlockFormatter;

impl SlackBlockFormatter {
    fn body(&self, alert: &Alert) -> String {
        let mut body = String::new();
        if !alert.id.is_empty() {
            body.push_str(&format!("*ID*: {}\n", alert.id));
        }
        if let Some(alert_type) = alert.alert_type.as_deref().filter(|t| !t.is_empty()) {
            body.push_str(&format!("*Type*: {alert_type}\n"));
        }
        if let Some(severity) = alert.severity {
            body.push_str(&format!("*Severity*: {severity}\n"));
        }
        body.push_str(&format!(
            "*Timestamp*: {}\n",
            alert.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
        ));
        body.push_str("*Message*:\n");
        body.push_str(alert.message.as_deref().unwrap_or_default());
        body
    }

    fn details(&self, alert: &Alert) -> Option<String> {
        match alert.details.as_ref()? {
            Value::Null => None,
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            other => serde_json::to_string_pretty(other).ok(),
        }
    }
}

impl AlertFormatter for SlackBlockFormatter {
    fn render(&self, route_key: &str, alert: &Alert) -> RenderedAlert {
        let header = format!("🔔 Alert ({route_key})");

        let mut blocks = vec![
            json!({ "type": "header", "text": { "type": "plain_text", "text": header } }),
            json!({ "type": "section", "text": { "type": "mrkdwn", "text": self.body(alert) } }),
        ];
        if let Some(details) = self.details(alert) {
            blocks.push(json!({
                "type": "section",
                "text": { "type": "mrkdwn", "text": format!("*Details*:\n```\n{details}\n```") }
            }));
        }

        RenderedAlert {
            summary: header.clone(),
            payload: json!({ "text": header, "blocks": blocks }),
        }
    }
}
