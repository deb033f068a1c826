//! alertdispatch - reliable delivery of stored alerts to Slack webhooks
//!
//! This library provides the delivery dispatcher, its storage and notification
//! seams, and the supporting file ingestor, configuration and metrics.
pub mod app;
pub mod cli;
pub mod config;
pub mod core;
pub mod deduplication;
pub mod delivery;
pub mod dispatcher;
pub mod formatting;
pub mod ingest;
pub mod internal_metrics;
pub mod notification;
pub mod repository;
pub mod routing;
pub mod task_manager;
pub mod utils;

// Re-export core types for convenience
pub use core::*;
