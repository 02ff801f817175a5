//! Error types for telemetry-flux

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur while reconciling a telemetry stream
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to decode raw sample: {0}")]
    Decode(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Backfill {backfill_id} for session {session} failed: {source}")]
    Backfill {
        session: String,
        backfill_id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error("Batch starting at {first} precedes buffer tail {tail}")]
    OrderingViolation {
        tail: DateTime<Utc>,
        first: DateTime<Utc>,
    },

    #[error("Processing host is no longer running")]
    HostClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineError {
    /// True for errors that affect data completeness and must reach the caller
    pub fn is_backfill(&self) -> bool {
        matches!(self, EngineError::Backfill { .. })
    }
}

/// Errors reported by a [`crate::store::SampleStore`] implementation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Query failed: {0}")]
    Query(String),
}
