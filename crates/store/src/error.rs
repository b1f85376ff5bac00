//! Typed error type for the store crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Append-only violation: a step log with this id was already written.
    #[error("step log {0} already written")]
    DuplicateStepLog(uuid::Uuid),

    /// Any failure reported by a backing store implementation.
    #[error("store backend error: {0}")]
    Backend(String),
}
