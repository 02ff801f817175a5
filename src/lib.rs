//! Telemetry Flux - stream reconciliation and derived metrics for vehicle telemetry
//!
//! Flux turns a live, at-least-once stream of raw telemetry records into one
//! ordered, deduplicated, bounded series per session: normalization → gap and
//! session-switch backfill → derived signals → merge → downsampling and KPIs.
//!
//! ## Entry points
//!
//! - [`StreamProcessor`]: synchronous engine owning buffer, filter state and backfill
//! - [`host::spawn`]: the same engine on a tokio task behind a FIFO mailbox
//! - [`downsample::lttb`] and [`summary::summarize`]: pure functions over a buffer

pub mod backfill;
pub mod config;
pub mod derived;
pub mod downsample;
pub mod error;
pub mod host;
pub mod merge;
pub mod normalizer;
pub mod outlier;
pub mod pipeline;
pub mod store;
pub mod summary;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, StoreError};
pub use host::{HostHandle, ProcessingHost};
pub use normalizer::Normalizer;
pub use outlier::{OutlierConfig, OutlierDetector};
pub use pipeline::{BackfillOutcome, BatchReply, IngestReply, SnapshotReply, StreamProcessor};
pub use store::{MemoryStore, SampleStore};
pub use summary::{Kpis, QualityReport, Summary};
pub use types::{DerivedFields, Sample, SessionStatus, Severity};

/// Flux version
pub const FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");
