//! Gap detection and historical backfill
//!
//! The coordinator decides when a live sample cannot simply be appended:
//! - its session differs from the buffer's session (session switch)
//! - it arrives long after the buffer tail (gap)
//! - a resync was requested for its session (external discontinuity)
//!
//! While a backfill is outstanding, live samples for the target session are
//! held in a queue and replayed once history has been applied.

use crate::error::StoreError;
use crate::store::SampleStore;
use crate::types::{Sample, SampleKey};
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Why a backfill was started
#[derive(Debug, Clone, PartialEq)]
pub enum BackfillReason {
    /// Live data for a session other than the buffered one
    SessionSwitch,
    /// Live data resumed after the buffer tail at `after`
    Gap { after: DateTime<Utc> },
    /// Externally requested resynchronization from `after`
    Resync { after: Option<DateTime<Utc>> },
}

/// A backfill in flight
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillPlan {
    pub id: Uuid,
    pub session_id: String,
    pub reason: BackfillReason,
}

impl BackfillPlan {
    /// Whether applying this plan replaces the buffer and filter state
    pub fn is_full_reload(&self) -> bool {
        matches!(
            self.reason,
            BackfillReason::SessionSwitch | BackfillReason::Resync { after: None }
        )
    }

    /// Fetch cursor: records strictly after this instant are requested
    pub fn fetch_after(&self) -> Option<DateTime<Utc>> {
        match self.reason {
            BackfillReason::SessionSwitch => None,
            BackfillReason::Gap { after } => Some(after),
            BackfillReason::Resync { after } => after,
        }
    }
}

#[derive(Debug, Default)]
pub struct BackfillCoordinator {
    pending: Option<BackfillPlan>,
    queue: VecDeque<Sample>,
    queue_session: Option<String>,
    resync: Option<String>,
    max_queue: usize,
    evicted: u64,
}

impl BackfillCoordinator {
    pub fn new(max_queue: usize) -> Self {
        Self {
            max_queue,
            ..Default::default()
        }
    }

    pub fn pending(&self) -> Option<&BackfillPlan> {
        self.pending.as_ref()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queued samples evicted because the queue was full
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    /// Mark `session_id` as needing resynchronization on its next live sample
    pub fn request_resync(&mut self, session_id: &str) {
        self.resync = Some(session_id.to_string());
    }

    /// Decide whether `sample` requires a backfill before it can be merged
    pub fn detect(
        &self,
        current_session: Option<&str>,
        tail: Option<DateTime<Utc>>,
        sample: &Sample,
        gap_threshold_ms: i64,
    ) -> Option<BackfillReason> {
        if current_session != Some(sample.session_id.as_str()) {
            return Some(BackfillReason::SessionSwitch);
        }
        if self.resync.as_deref() == Some(sample.session_id.as_str()) {
            return Some(BackfillReason::Resync { after: tail });
        }
        // Samples held from a failed attempt mean history is still missing.
        if self.queue_session.as_deref() == Some(sample.session_id.as_str()) {
            return Some(match tail {
                Some(after) => BackfillReason::Gap { after },
                None => BackfillReason::SessionSwitch,
            });
        }
        match tail {
            Some(after) if (sample.timestamp - after).num_milliseconds() > gap_threshold_ms => {
                Some(BackfillReason::Gap { after })
            }
            _ => None,
        }
    }

    /// Start a backfill for `session_id`
    pub fn begin(&mut self, session_id: &str, reason: BackfillReason) -> BackfillPlan {
        if self.queue_session.as_deref() != Some(session_id) {
            self.queue.clear();
            self.queue_session = Some(session_id.to_string());
        }
        if self.resync.as_deref() == Some(session_id) {
            self.resync = None;
        }
        let plan = BackfillPlan {
            id: Uuid::new_v4(),
            session_id: session_id.to_string(),
            reason,
        };
        info!(
            backfill_id = %plan.id,
            session = %session_id,
            reason = ?plan.reason,
            "starting backfill"
        );
        self.pending = Some(plan.clone());
        plan
    }

    /// Hold a live sample until the outstanding backfill completes
    pub fn enqueue(&mut self, sample: Sample) {
        if self.queue.len() >= self.max_queue.max(1) {
            self.queue.pop_front();
            self.evicted += 1;
        }
        self.queue.push_back(sample);
    }

    /// Finish the outstanding backfill; returns queued samples in replay order
    pub fn complete(&mut self) -> Vec<Sample> {
        self.pending = None;
        self.queue_session = None;
        let mut replay: Vec<Sample> = self.queue.drain(..).collect();
        crate::merge::sort_samples(&mut replay);
        replay
    }

    /// Abandon the outstanding backfill, keeping queued samples for a retry
    pub fn fail(&mut self) {
        self.pending = None;
    }

    pub fn clear(&mut self) {
        let max_queue = self.max_queue;
        *self = Self::new(max_queue);
    }
}

/// History fetched for a plan
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedHistory {
    /// Ascending, unique by key
    pub samples: Vec<Sample>,
    /// Older records were skipped to stay within the record cap
    pub truncated: bool,
}

impl From<Vec<Sample>> for FetchedHistory {
    fn from(samples: Vec<Sample>) -> Self {
        Self {
            samples,
            truncated: false,
        }
    }
}

/// Page through the store and return the history a plan asks for
///
/// Returns an empty history when the store holds nothing newer than the plan's
/// cursor. Only the newest `max_records` records are kept.
pub async fn fetch_history(
    store: &dyn SampleStore,
    plan: &BackfillPlan,
    page_size: usize,
    max_records: usize,
) -> Result<FetchedHistory, StoreError> {
    let latest = store.latest_timestamp(&plan.session_id).await?;
    let mut cursor = plan.fetch_after();

    match (latest.timestamp, cursor) {
        (None, _) => {
            debug!(backfill_id = %plan.id, "store has no records for session");
            return Ok(FetchedHistory::default());
        }
        (Some(newest), Some(after)) if newest <= after => {
            return Ok(FetchedHistory::default())
        }
        _ => {}
    }

    let page_size = page_size.max(1);
    let max_records = max_records.max(1);
    let mut kept: VecDeque<Sample> = VecDeque::with_capacity(latest.count.min(max_records));
    let mut seen: HashSet<SampleKey> = HashSet::new();
    let mut truncated = false;
    let mut limit = page_size;

    loop {
        let page = store
            .records_in_range(&plan.session_id, cursor, limit)
            .await?;
        let full = page.len() >= limit;
        let last = page.last().map(|s| s.timestamp);
        for sample in page {
            if seen.insert(sample.key()) {
                kept.push_back(sample);
            }
        }
        if kept.len() > max_records {
            let excess = kept.len() - max_records;
            kept.drain(..excess);
            truncated = true;
        }

        let Some(last) = last else { break };
        if !full {
            break;
        }
        // Records sharing the last timestamp may continue on the next page,
        // so the next page starts just before it and overlaps by key.
        let next = Some(last - Duration::nanoseconds(1));
        if next <= cursor {
            // A single timestamp filled the page.
            limit = limit.saturating_mul(2);
        } else {
            cursor = next;
            limit = page_size;
        }
    }

    if truncated {
        warn!(
            backfill_id = %plan.id,
            max_records,
            "backfill kept only the newest records"
        );
    }
    debug!(backfill_id = %plan.id, records = kept.len(), "history fetched");
    Ok(FetchedHistory {
        samples: kept.into(),
        truncated,
    })
}
