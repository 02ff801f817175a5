//! Engine configuration
//!
//! All limits that bound memory and latency live here. Defaults suit a
//! dashboard charting a single live session.

use crate::error::EngineError;
use crate::outlier::OutlierConfig;
use serde::{Deserialize, Serialize};

/// Default sliding-window length of the session buffer
pub const DEFAULT_MAX_POINTS: usize = 50_000;

/// Default point count for downsampled chart payloads
pub const DEFAULT_CHART_POINTS: usize = 1_000;

/// Default page size for historical fetches
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Upper bound on records pulled by a single backfill
pub const DEFAULT_MAX_BACKFILL_RECORDS: usize = 200_000;

/// Gap between buffer tail and a live sample that triggers a backfill (ms)
pub const DEFAULT_GAP_THRESHOLD_MS: i64 = 5_000;

/// Freshness above which the quality report flags the stream as stale (ms)
pub const DEFAULT_STALE_AFTER_MS: i64 = 10_000;

/// Live ingests between KPI refreshes in ingest replies
pub const DEFAULT_KPI_INTERVAL: usize = 10;

/// Default processing host mailbox depth
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_points: usize,
    pub chart_points: usize,
    pub page_size: usize,
    pub max_backfill_records: usize,
    pub gap_threshold_ms: i64,
    pub stale_after_ms: i64,
    pub kpi_interval: usize,
    pub mailbox_capacity: usize,
    /// Thresholds for samples that arrive without an outlier annotation
    pub outliers: OutlierConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_points: DEFAULT_MAX_POINTS,
            chart_points: DEFAULT_CHART_POINTS,
            page_size: DEFAULT_PAGE_SIZE,
            max_backfill_records: DEFAULT_MAX_BACKFILL_RECORDS,
            gap_threshold_ms: DEFAULT_GAP_THRESHOLD_MS,
            stale_after_ms: DEFAULT_STALE_AFTER_MS,
            kpi_interval: DEFAULT_KPI_INTERVAL,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            outliers: OutlierConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_max_points(mut self, max_points: usize) -> Self {
        self.max_points = max_points;
        self
    }

    pub fn with_chart_points(mut self, chart_points: usize) -> Self {
        self.chart_points = chart_points;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_max_backfill_records(mut self, max_backfill_records: usize) -> Self {
        self.max_backfill_records = max_backfill_records;
        self
    }

    pub fn with_gap_threshold_ms(mut self, gap_threshold_ms: i64) -> Self {
        self.gap_threshold_ms = gap_threshold_ms;
        self
    }

    /// Load configuration from JSON; missing keys take their defaults
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_points == 0 {
            return Err(EngineError::InvalidConfig("max_points must be > 0".into()));
        }
        if self.page_size == 0 {
            return Err(EngineError::InvalidConfig("page_size must be > 0".into()));
        }
        if self.mailbox_capacity == 0 {
            return Err(EngineError::InvalidConfig(
                "mailbox_capacity must be > 0".into(),
            ));
        }
        if self.gap_threshold_ms <= 0 || self.stale_after_ms <= 0 {
            return Err(EngineError::InvalidConfig(
                "time thresholds must be positive".into(),
            ));
        }
        if self.outliers.window_size == 0 || self.outliers.sample_interval_s <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "outlier window and sample interval must be positive".into(),
            ));
        }
        Ok(())
    }
}
