//! Outbound notification channels.
//!
//! The dispatcher talks to a channel only through the
//! [`NotificationSink`](crate::core::NotificationSink) trait. Slack incoming
//! webhooks are the one channel implemented here.
pub mod slack;

pub use slack::SlackWebhookSink;
