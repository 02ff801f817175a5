//! Stream processing orchestration
//!
//! [`StreamProcessor`] owns everything stateful about the active session: the
//! ordered buffer, the derived-signal filter state, the backfill coordinator
//! and the stream counters. It is synchronous; the processing host drives it
//! from a single task and performs store I/O on its behalf.
//!
//! Stages for a live record:
//! 1. Normalizer - canonical sample (malformed records are counted and dropped)
//! 2. BackfillCoordinator - accept, queue, or request history
//! 3. OutlierDetector - annotate samples that arrive without outlier info
//! 4. DerivedSignalPipeline - orientation, g-force, km/h, motion
//! 5. merge - dedup, sort, sliding window
//!
//! Batches and history spans are collapsed by key before stage 3, so a
//! repeated record never advances detector or filter state.

use crate::backfill::{BackfillCoordinator, BackfillPlan, FetchedHistory};
use crate::config::EngineConfig;
use crate::derived::{DerivedSignalPipeline, FilterState};
use crate::downsample::downsample;
use crate::error::{EngineError, StoreError};
use crate::merge::{contains_observed, dedup_batch, merge, MergeOutcome};
use crate::normalizer::Normalizer;
use crate::outlier::OutlierDetector;
use crate::summary::{compute_kpis, summarize, Kpis, Summary};
use crate::types::{DerivedFields, Sample, SampleKey, SessionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Running counters since the last reset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamCounters {
    pub ingested: u64,
    pub decode_errors: u64,
    pub duplicates: u64,
    pub late_dropped: u64,
    pub ordering_violations: u64,
    /// Samples for a session that is neither active nor being backfilled
    pub cross_session: u64,
    /// Live samples pushed out of a full backfill queue
    pub queue_evicted: u64,
    /// Backfills that hit the record cap
    pub truncated_backfills: u64,
}

/// What happened to a single live record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Applied,
    Duplicate,
    Queued,
    Dropped,
}

/// Outcome of offering a live sample to the processor
#[derive(Debug, Clone, PartialEq)]
pub enum LiveDecision {
    Applied(DerivedFields),
    Duplicate,
    /// Held until the outstanding backfill completes
    Queued,
    /// Malformed, or for a session this processor is not tracking
    Dropped,
    /// History must be fetched before this sample can be merged
    BackfillRequired(BackfillPlan),
}

/// Result of applying fetched history
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillOutcome {
    /// What became of the live sample that triggered the backfill
    pub trigger: Disposition,
    /// Derived fields of the newest buffered sample
    pub latest_derived: Option<DerivedFields>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReply {
    pub disposition: Disposition,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_derived: Option<DerivedFields>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kpis: Option<Kpis>,
    pub total_count: usize,
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReply {
    pub downsampled: Vec<Sample>,
    pub kpis: Kpis,
    pub count: usize,
    /// Records from the batch that entered the buffer
    pub accepted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotReply {
    pub series: Vec<Sample>,
    pub count: usize,
}

pub struct StreamProcessor {
    config: EngineConfig,
    session_id: Option<String>,
    status: SessionStatus,
    buffer: Vec<Sample>,
    pipeline: DerivedSignalPipeline,
    detector: OutlierDetector,
    coordinator: BackfillCoordinator,
    /// Key of the live sample that started the pending backfill
    trigger: Option<SampleKey>,
    counters: StreamCounters,
    /// Sessions switched away from; their stragglers must not switch back
    retired: HashSet<String>,
}

impl Default for StreamProcessor {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl StreamProcessor {
    pub fn new(config: EngineConfig) -> Self {
        let coordinator = BackfillCoordinator::new(config.max_points);
        let detector = OutlierDetector::new(config.outliers.clone());
        Self {
            config,
            session_id: None,
            status: SessionStatus::Idle,
            buffer: Vec::new(),
            pipeline: DerivedSignalPipeline::new(),
            detector,
            coordinator,
            trigger: None,
            counters: StreamCounters::default(),
            retired: HashSet::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn buffer(&self) -> &[Sample] {
        &self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn counters(&self) -> StreamCounters {
        self.counters
    }

    pub fn filter_state(&self) -> FilterState {
        self.pipeline.state()
    }

    pub fn pending_backfill(&self) -> Option<&BackfillPlan> {
        self.coordinator.pending()
    }

    pub fn detector(&self) -> &OutlierDetector {
        &self.detector
    }

    fn tail(&self) -> Option<DateTime<Utc>> {
        self.buffer.last().map(|s| s.timestamp)
    }

    /// Discard all state; the configuration is kept
    pub fn reset(&mut self) {
        info!(session = ?self.session_id, "resetting stream processor");
        *self = Self::new(self.config.clone());
    }

    /// Replace the configuration and start from a clean state
    pub fn reconfigure(&mut self, config: EngineConfig) -> Result<(), EngineError> {
        config.validate()?;
        *self = Self::new(config);
        Ok(())
    }

    /// Normalize a raw record, counting and dropping malformed ones
    pub fn normalize(&mut self, raw: &Value) -> Option<Sample> {
        match Normalizer::normalize(raw, self.session_id.as_deref()) {
            Ok(sample) => Some(sample),
            Err(err) => {
                self.counters.decode_errors += 1;
                warn!(error = %err, "dropping malformed record");
                None
            }
        }
    }

    /// Normalize and offer one live record
    pub fn ingest_live(&mut self, raw: &Value) -> LiveDecision {
        match self.normalize(raw) {
            Some(sample) => self.accept_live(sample),
            None => LiveDecision::Dropped,
        }
    }

    /// Offer a normalized live sample
    pub fn accept_live(&mut self, sample: Sample) -> LiveDecision {
        if let Some(plan) = self.coordinator.pending() {
            if plan.session_id == sample.session_id {
                self.hold(sample);
                return LiveDecision::Queued;
            }
            self.counters.cross_session += 1;
            debug!(session = %sample.session_id, "dropping sample while another session backfills");
            return LiveDecision::Dropped;
        }

        if self.retired.contains(&sample.session_id) {
            self.counters.cross_session += 1;
            debug!(session = %sample.session_id, "dropping sample for retired session");
            return LiveDecision::Dropped;
        }

        let reason = self.coordinator.detect(
            self.session_id.as_deref(),
            self.tail(),
            &sample,
            self.config.gap_threshold_ms,
        );
        if let Some(reason) = reason {
            let plan = self.coordinator.begin(&sample.session_id, reason);
            self.trigger = Some(sample.key());
            self.hold(sample);
            self.status = SessionStatus::Backfilling;
            return LiveDecision::BackfillRequired(plan);
        }

        self.apply_live(sample)
    }

    fn apply_live(&mut self, mut sample: Sample) -> LiveDecision {
        if contains_observed(&self.buffer, &sample.key()) {
            self.counters.duplicates += 1;
            return LiveDecision::Duplicate;
        }
        self.check_order(sample.timestamp);
        let derived = self.derive(&mut sample);
        self.merge_in(vec![sample]);
        self.counters.ingested += 1;
        LiveDecision::Applied(derived)
    }

    fn hold(&mut self, sample: Sample) {
        let before = self.coordinator.evicted();
        self.coordinator.enqueue(sample);
        let evicted = self.coordinator.evicted() - before;
        if evicted > 0 {
            self.counters.queue_evicted += evicted;
            let queued = self.coordinator.queued();
            debug!(queued, "backfill queue full; evicted oldest sample");
        }
    }

    /// Annotate outliers (unless already annotated) and derive signals
    fn derive(&mut self, sample: &mut Sample) -> DerivedFields {
        let annotation = self.detector.inspect(sample);
        if sample.outliers.is_none() {
            sample.outliers = annotation;
        }
        self.pipeline.process(sample)
    }

    /// Same as [`Self::derive`] over a slice sorted by timestamp
    fn derive_ordered(&mut self, samples: &mut [Sample]) {
        for sample in samples.iter_mut() {
            self.derive(sample);
        }
    }

    fn reset_filters(&mut self) {
        self.pipeline.reset();
        self.detector.reset();
    }

    /// Ask for a resynchronization of `session_id` on its next live sample
    pub fn request_resync(&mut self, session_id: &str) {
        self.retired.remove(session_id);
        self.coordinator.request_resync(session_id);
    }

    /// Apply fetched history for `plan`, then replay queued live samples
    ///
    /// History that hit the record cap leaves the session `Partial` rather
    /// than `Ready`.
    pub fn complete_backfill(
        &mut self,
        plan: &BackfillPlan,
        history: impl Into<FetchedHistory>,
    ) -> BackfillOutcome {
        if self.coordinator.pending() != Some(plan) {
            warn!(backfill_id = %plan.id, "ignoring result of a stale backfill");
            return BackfillOutcome {
                trigger: Disposition::Dropped,
                latest_derived: None,
            };
        }

        let FetchedHistory {
            mut samples,
            truncated,
        } = history.into();
        samples.retain(|s| s.session_id == plan.session_id);
        let (mut history, _) = dedup_batch(samples);
        let fetched = history.len();

        if plan.is_full_reload() {
            if let Some(previous) = self.session_id.take() {
                if previous != plan.session_id {
                    self.retired.insert(previous);
                }
            }
            self.reset_filters();
            self.derive_ordered(&mut history);
            let outcome = merge(Vec::new(), history, self.config.max_points);
            self.buffer = outcome.buffer;
            self.session_id = Some(plan.session_id.clone());
        } else {
            if let Some(first) = history.first() {
                self.check_order(first.timestamp);
            }
            self.derive_ordered(&mut history);
            self.merge_in(history);
        }

        let trigger_key = self.trigger.take();
        let mut trigger = Disposition::Dropped;
        let replay = self.coordinator.complete();
        let replayed = replay.len();
        for sample in replay {
            let key = sample.key();
            let decision = self.apply_live(sample);
            if trigger == Disposition::Dropped && trigger_key == Some(key) {
                trigger = match decision {
                    LiveDecision::Applied(_) => Disposition::Applied,
                    LiveDecision::Duplicate => Disposition::Duplicate,
                    _ => Disposition::Dropped,
                };
            }
        }

        if truncated {
            self.counters.truncated_backfills += 1;
            self.status = SessionStatus::Partial;
            warn!(
                backfill_id = %plan.id,
                session = %plan.session_id,
                kept = fetched,
                "history exceeded the record cap; session is partial"
            );
        } else {
            self.status = SessionStatus::Ready;
        }

        info!(
            backfill_id = %plan.id,
            session = %plan.session_id,
            fetched,
            replayed,
            ?trigger,
            buffered = self.buffer.len(),
            "backfill applied"
        );
        BackfillOutcome {
            trigger,
            latest_derived: self.buffer.last().and_then(|s| s.derived),
        }
    }

    /// Abandon `plan`; the buffer keeps its last good state
    pub fn fail_backfill(&mut self, plan: &BackfillPlan, source: StoreError) -> EngineError {
        self.coordinator.fail();
        self.status = SessionStatus::NotReady;
        warn!(
            backfill_id = %plan.id,
            session = %plan.session_id,
            error = %source,
            "backfill failed; keeping last good buffer"
        );
        EngineError::Backfill {
            session: plan.session_id.clone(),
            backfill_id: plan.id,
            source,
        }
    }

    /// Merge a historical or bulk batch
    ///
    /// The batch belongs to the session of its first valid record; a batch for
    /// another session than the active one starts that session afresh.
    pub fn ingest_batch(&mut self, raws: &[Value]) -> BatchReply {
        let mut samples: Vec<Sample> = raws.iter().filter_map(|raw| self.normalize(raw)).collect();

        let accepted = match samples.first().map(|s| s.session_id.clone()) {
            Some(target) => {
                if self.session_id.as_deref() != Some(target.as_str()) {
                    self.switch_session(&target);
                }
                let before = samples.len();
                samples.retain(|s| s.session_id == target);
                self.counters.cross_session += (before - samples.len()) as u64;
                self.apply_batch(samples)
            }
            None => 0,
        };

        debug!(records = raws.len(), accepted, buffered = self.buffer.len(), "batch ingested");
        BatchReply {
            downsampled: self.chart_series(),
            kpis: compute_kpis(&self.buffer),
            count: self.buffer.len(),
            accepted,
        }
    }

    fn switch_session(&mut self, session_id: &str) {
        if let Some(previous) = self.session_id.take() {
            info!(from = %previous, to = %session_id, "switching session");
            self.retired.insert(previous);
        }
        self.retired.remove(session_id);
        self.buffer.clear();
        self.reset_filters();
        self.coordinator.clear();
        self.trigger = None;
        self.session_id = Some(session_id.to_string());
        self.status = SessionStatus::Ready;
    }

    fn apply_batch(&mut self, samples: Vec<Sample>) -> usize {
        let (mut samples, repeated) = dedup_batch(samples);
        let before = samples.len();
        samples.retain(|s| !contains_observed(&self.buffer, &s.key()));
        self.counters.duplicates += (repeated + before - samples.len()) as u64;

        if let Some(first) = samples.first() {
            self.check_order(first.timestamp);
        }
        self.derive_ordered(&mut samples);
        let outcome = self.merge_in(samples);
        self.counters.ingested += (outcome.inserted + outcome.replaced) as u64;
        outcome.inserted + outcome.replaced - outcome.late_dropped
    }

    fn merge_in(&mut self, incoming: Vec<Sample>) -> MergeOutcome {
        let buffer = std::mem::take(&mut self.buffer);
        let mut outcome = merge(buffer, incoming, self.config.max_points);
        self.counters.duplicates += outcome.duplicates as u64;
        self.counters.late_dropped += outcome.late_dropped as u64;
        self.buffer = std::mem::take(&mut outcome.buffer);
        outcome
    }

    /// Count and log samples that would be derived behind the buffer tail
    fn check_order(&mut self, first: DateTime<Utc>) -> bool {
        match self.tail() {
            Some(tail) if first < tail => {
                self.counters.ordering_violations += 1;
                let err = EngineError::OrderingViolation { tail, first };
                warn!(error = %err, "derived values for this data are unreliable");
                false
            }
            _ => true,
        }
    }

    /// Reply for a live ingest; KPIs ride along every `kpi_interval` ingests
    pub fn ingest_reply(
        &self,
        disposition: Disposition,
        latest_derived: Option<DerivedFields>,
        force_kpis: bool,
    ) -> IngestReply {
        let interval = self.config.kpi_interval.max(1) as u64;
        let due = disposition == Disposition::Applied && self.counters.ingested % interval == 0;
        IngestReply {
            disposition,
            latest_derived,
            kpis: (force_kpis || due).then(|| compute_kpis(&self.buffer)),
            total_count: self.buffer.len(),
            status: self.status,
        }
    }

    /// Buffer downsampled to `chart_points` against speed
    pub fn chart_series(&self) -> Vec<Sample> {
        downsample(&self.buffer, self.config.chart_points, |s| s.speed_ms)
    }

    pub fn snapshot(&self) -> SnapshotReply {
        SnapshotReply {
            series: self.buffer.clone(),
            count: self.buffer.len(),
        }
    }

    /// KPIs and quality report, including stream counters
    pub fn summary(&self, now: DateTime<Utc>) -> Summary {
        let mut summary = summarize(&self.buffer, now, self.config.stale_after_ms);
        let quality = &mut summary.quality;
        quality.decode_errors = self.counters.decode_errors;
        quality.duplicates = self.counters.duplicates;
        quality.late_dropped = self.counters.late_dropped;
        quality.ordering_violations = self.counters.ordering_violations;
        quality.queue_evicted = self.counters.queue_evicted;
        quality.truncated_backfills = self.counters.truncated_backfills;
        summary
    }
}
