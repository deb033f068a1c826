//! Storage for alerts and their deliveries.
//!
//! Both implementations honour the conditional-write contract of
//! [`DeliveryRepository`](crate::core::DeliveryRepository): a claim or update
//! only lands if the stored `(status, attempt_count, next_attempt_at)` still
//! matches what the caller read.

pub mod memory;
pub mod sqlite;

pub use memory::InMemoryRepository;
pub use sqlite::SqliteRepository;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    /// The delivery changed since it was read; another writer won.
    #[error("delivery {id} was modified concurrently")]
    Conflict { id: String },
    #[error("delivery {id} not found")]
    NotFound { id: String },
    #[error("alert {id} not found")]
    AlertNotFound { id: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl RepositoryError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

pub(crate) fn new_delivery_id() -> String {
    format!("dlv-{}", uuid::Uuid::new_v4())
}
