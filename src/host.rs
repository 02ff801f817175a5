//! Processing host
//!
//! Runs one [`StreamProcessor`] on its own tokio task behind a bounded mailbox.
//! Requests are handled strictly in arrival order. Backfill I/O is awaited
//! inside the task, so requests sent meanwhile wait their turn and never see a
//! half-applied buffer.

use crate::backfill::fetch_history;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::pipeline::{
    BatchReply, Disposition, IngestReply, LiveDecision, SnapshotReply, StreamProcessor,
};
use crate::store::SampleStore;
use crate::summary::Summary;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Reply<T> = oneshot::Sender<T>;

/// A request to the processing host, carrying its reply channel
#[derive(Debug)]
pub enum HostRequest {
    /// Replace the configuration; discards all state
    Init {
        config: EngineConfig,
        reply: Reply<Result<(), EngineError>>,
    },
    IngestOne {
        raw: Value,
        reply: Reply<Result<IngestReply, EngineError>>,
    },
    IngestBatch {
        raws: Vec<Value>,
        reply: Reply<BatchReply>,
    },
    Snapshot {
        reply: Reply<SnapshotReply>,
    },
    Summary {
        now: DateTime<Utc>,
        reply: Reply<Summary>,
    },
    Resync {
        session_id: String,
        reply: Reply<()>,
    },
    Reset {
        reply: Reply<()>,
    },
    Shutdown,
}

/// Owner of the processor and store inside the host task
pub struct ProcessingHost {
    processor: StreamProcessor,
    store: Arc<dyn SampleStore>,
    mailbox: mpsc::Receiver<HostRequest>,
}

impl ProcessingHost {
    pub fn new(
        store: Arc<dyn SampleStore>,
        config: EngineConfig,
        mailbox: mpsc::Receiver<HostRequest>,
    ) -> Self {
        Self {
            processor: StreamProcessor::new(config),
            store,
            mailbox,
        }
    }

    /// Serve requests until shutdown or until every handle is dropped
    pub async fn run(mut self) {
        info!("processing host started");
        while let Some(request) = self.mailbox.recv().await {
            if !self.handle(request).await {
                break;
            }
        }
        info!(buffered = self.processor.len(), "processing host stopped");
    }

    /// Handle one request; false means stop
    async fn handle(&mut self, request: HostRequest) -> bool {
        // A caller that stopped waiting is not an error for the host.
        match request {
            HostRequest::Init { config, reply } => {
                let _ = reply.send(self.processor.reconfigure(config));
            }
            HostRequest::IngestOne { raw, reply } => {
                let result = self.ingest_one(&raw).await;
                let _ = reply.send(result);
            }
            HostRequest::IngestBatch { raws, reply } => {
                let _ = reply.send(self.processor.ingest_batch(&raws));
            }
            HostRequest::Snapshot { reply } => {
                let _ = reply.send(self.processor.snapshot());
            }
            HostRequest::Summary { now, reply } => {
                let _ = reply.send(self.processor.summary(now));
            }
            HostRequest::Resync { session_id, reply } => {
                self.processor.request_resync(&session_id);
                let _ = reply.send(());
            }
            HostRequest::Reset { reply } => {
                self.processor.reset();
                let _ = reply.send(());
            }
            HostRequest::Shutdown => return false,
        }
        true
    }

    async fn ingest_one(&mut self, raw: &Value) -> Result<IngestReply, EngineError> {
        let (disposition, latest, after_backfill) = match self.processor.ingest_live(raw) {
            LiveDecision::Applied(derived) => (Disposition::Applied, Some(derived), false),
            LiveDecision::Duplicate => (Disposition::Duplicate, None, false),
            LiveDecision::Queued => (Disposition::Queued, None, false),
            LiveDecision::Dropped => (Disposition::Dropped, None, false),
            LiveDecision::BackfillRequired(plan) => {
                let config = self.processor.config();
                let (page_size, max_records) = (config.page_size, config.max_backfill_records);
                match fetch_history(self.store.as_ref(), &plan, page_size, max_records).await {
                    Ok(history) => {
                        let outcome = self.processor.complete_backfill(&plan, history);
                        (outcome.trigger, outcome.latest_derived, true)
                    }
                    Err(source) => return Err(self.processor.fail_backfill(&plan, source)),
                }
            }
        };
        debug!(?disposition, buffered = self.processor.len(), "live sample handled");
        Ok(self.processor.ingest_reply(disposition, latest, after_backfill))
    }
}

/// Cloneable sender side of the host mailbox
#[derive(Debug, Clone)]
pub struct HostHandle {
    sender: mpsc::Sender<HostRequest>,
}

impl HostHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> HostRequest,
    ) -> Result<T, EngineError> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(build(reply))
            .await
            .map_err(|_| EngineError::HostClosed)?;
        response.await.map_err(|_| EngineError::HostClosed)
    }

    pub async fn init(&self, config: EngineConfig) -> Result<(), EngineError> {
        self.request(|reply| HostRequest::Init { config, reply }).await?
    }

    pub async fn ingest(&self, raw: Value) -> Result<IngestReply, EngineError> {
        self.request(|reply| HostRequest::IngestOne { raw, reply }).await?
    }

    pub async fn ingest_batch(&self, raws: Vec<Value>) -> Result<BatchReply, EngineError> {
        self.request(|reply| HostRequest::IngestBatch { raws, reply }).await
    }

    pub async fn snapshot(&self) -> Result<SnapshotReply, EngineError> {
        self.request(|reply| HostRequest::Snapshot { reply }).await
    }

    pub async fn summary(&self, now: DateTime<Utc>) -> Result<Summary, EngineError> {
        self.request(|reply| HostRequest::Summary { now, reply }).await
    }

    /// Force a history reload for `session_id` on its next live sample
    pub async fn resync(&self, session_id: impl Into<String>) -> Result<(), EngineError> {
        let session_id = session_id.into();
        self.request(|reply| HostRequest::Resync { session_id, reply })
            .await
    }

    pub async fn reset(&self) -> Result<(), EngineError> {
        self.request(|reply| HostRequest::Reset { reply }).await
    }

    /// Ask the host to stop after the requests already queued
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.sender
            .send(HostRequest::Shutdown)
            .await
            .map_err(|_| EngineError::HostClosed)
    }
}

/// Start a processing host on the current tokio runtime
pub fn spawn(
    store: Arc<dyn SampleStore>,
    config: EngineConfig,
) -> Result<(HostHandle, JoinHandle<()>), EngineError> {
    config.validate()?;
    let (sender, mailbox) = mpsc::channel(config.mailbox_capacity);
    let host = ProcessingHost::new(store, config, mailbox);
    let task = tokio::spawn(host.run());
    Ok((HostHandle { sender }, task))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::store::{LatestInfo, MemoryStore};
    use crate::types::{Sample, SessionStatus};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn base() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()
    }

    fn raw(session: &str, millis: i64, speed: f64) -> Value {
        json!({
            "session_id": session,
            "timestamp": (base() + Duration::milliseconds(millis)).to_rfc3339(),
            "speed_ms": speed
        })
    }

    fn stored(session: &str, millis: i64) -> Sample {
        let mut sample = Sample::empty(session, base() + Duration::milliseconds(millis));
        sample.speed_ms = 2.0;
        sample
    }

    /// Store that can be switched offline
    struct FlakyStore {
        inner: MemoryStore,
        offline: AtomicBool,
    }

    impl FlakyStore {
        fn check(&self) -> Result<(), StoreError> {
            if self.offline.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SampleStore for FlakyStore {
        async fn latest_timestamp(&self, session_id: &str) -> Result<LatestInfo, StoreError> {
            self.check()?;
            self.inner.latest_timestamp(session_id).await
        }

        async fn records_in_range(
            &self,
            session_id: &str,
            after: Option<DateTime<Utc>>,
            limit: usize,
        ) -> Result<Vec<Sample>, StoreError> {
            self.check()?;
            self.inner.records_in_range(session_id, after, limit).await
        }

        async fn all_records(&self, session_id: &str) -> Result<Vec<Sample>, StoreError> {
            self.check()?;
            self.inner.all_records(session_id).await
        }

        async fn insert_batch(
            &self,
            session_id: &str,
            samples: Vec<Sample>,
        ) -> Result<usize, StoreError> {
            self.inner.insert_batch(session_id, samples).await
        }
    }

    #[tokio::test]
    async fn test_first_sample_with_empty_store() {
        let (handle, _task) = spawn(Arc::new(MemoryStore::new()), EngineConfig::default()).unwrap();

        let reply = handle.ingest(raw("s1", 0, 3.0)).await.unwrap();
        assert_eq!(reply.disposition, Disposition::Applied);
        assert_eq!(reply.total_count, 1);
        assert_eq!(reply.status, SessionStatus::Ready);
        assert!(reply.kpis.is_some());
        assert!((reply.latest_derived.unwrap().speed_kmh - 10.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_history_then_live() {
        let store = Arc::new(MemoryStore::new());
        let history: Vec<Sample> = (0..30).map(|i| stored("s1", i * 200)).collect();
        store.insert_batch("s1", history).await.unwrap();

        let config = EngineConfig::default().with_page_size(7);
        let (handle, _task) = spawn(store, config).unwrap();

        let reply = handle.ingest(raw("s1", 6_000, 4.0)).await.unwrap();
        assert_eq!(reply.total_count, 31);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.count, 31);
        assert!(snapshot.series.iter().all(|s| s.derived.is_some()));
        assert!(snapshot
            .series
            .windows(2)
            .all(|w| w[0].timestamp < w[1].timestamp));

        // Redelivery of a stored record is a duplicate.
        let reply = handle.ingest(raw("s1", 200, 2.0)).await.unwrap();
        assert_eq!(reply.disposition, Disposition::Duplicate);
        assert_eq!(reply.total_count, 31);
    }

    #[tokio::test]
    async fn test_backfill_failure_reaches_caller_and_retries() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            offline: AtomicBool::new(false),
        });
        store
            .inner
            .insert_batch("s2", (0..3).map(|i| stored("s2", i * 200)).collect())
            .await
            .unwrap();
        let (handle, _task) = spawn(store.clone(), EngineConfig::default()).unwrap();

        handle.ingest(raw("s1", 0, 1.0)).await.unwrap();
        let before = handle.snapshot().await.unwrap();

        store.offline.store(true, Ordering::SeqCst);
        let err = handle.ingest(raw("s2", 1_000, 1.0)).await.unwrap_err();
        assert!(err.is_backfill());
        assert_eq!(handle.snapshot().await.unwrap(), before);

        store.offline.store(false, Ordering::SeqCst);
        let reply = handle.ingest(raw("s2", 1_200, 1.0)).await.unwrap();
        assert_eq!(reply.status, SessionStatus::Ready);
        // Three stored, plus the held sample and the retry trigger.
        assert_eq!(reply.total_count, 5);
    }

    #[tokio::test]
    async fn test_capped_history_keeps_newest_records() {
        let store = Arc::new(MemoryStore::new());
        let history: Vec<Sample> = (0..50).map(|i| stored("s1", i * 1_000)).collect();
        store.insert_batch("s1", history).await.unwrap();

        let config = EngineConfig::default()
            .with_page_size(8)
            .with_max_backfill_records(20)
            .with_max_points(10);
        let (handle, _task) = spawn(store, config).unwrap();

        let reply = handle.ingest(raw("s1", 50_000, 2.0)).await.unwrap();
        assert_eq!(reply.disposition, Disposition::Applied);
        assert_eq!(reply.status, SessionStatus::Partial);

        let seconds: Vec<i64> = handle
            .snapshot()
            .await
            .unwrap()
            .series
            .iter()
            .map(|s| (s.timestamp - base()).num_seconds())
            .collect();
        assert_eq!(seconds, (41..=50).collect::<Vec<_>>());

        let summary = handle.summary(base()).await.unwrap();
        assert_eq!(summary.quality.truncated_backfills, 1);
    }

    #[tokio::test]
    async fn test_trigger_found_in_history_is_reported_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let history: Vec<Sample> = (0..5).map(|i| stored("s1", i * 200)).collect();
        store.insert_batch("s1", history).await.unwrap();
        let (handle, _task) = spawn(store, EngineConfig::default()).unwrap();

        let reply = handle.ingest(raw("s1", 400, 2.0)).await.unwrap();
        assert_eq!(reply.disposition, Disposition::Duplicate);
        assert_eq!(reply.total_count, 5);
        assert_eq!(reply.status, SessionStatus::Ready);
        assert!(reply.kpis.is_some());
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_serialized() {
        let (handle, _task) = spawn(Arc::new(MemoryStore::new()), EngineConfig::default()).unwrap();

        let mut pending = Vec::new();
        for i in 0..20 {
            let handle = handle.clone();
            pending.push(tokio::spawn(async move {
                handle.ingest(raw("s1", i * 100, 1.0)).await
            }));
        }
        for task in pending {
            task.await.unwrap().unwrap();
        }

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.count, 20);
    }

    #[tokio::test]
    async fn test_reset_and_batch() {
        let (handle, _task) = spawn(Arc::new(MemoryStore::new()), EngineConfig::default()).unwrap();
        let raws: Vec<Value> = (0..10).map(|i| raw("s1", i * 200, 2.0)).collect();

        let reply = handle.ingest_batch(raws).await.unwrap();
        assert_eq!(reply.count, 10);
        assert_eq!(reply.downsampled.len(), 10);

        handle.reset().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.count, 0);

        let summary = handle.summary(base()).await.unwrap();
        assert_eq!(summary.kpis.sample_count, 0);
    }

    #[tokio::test]
    async fn test_init_rejects_bad_config_and_shutdown_closes() {
        let (handle, task) = spawn(Arc::new(MemoryStore::new()), EngineConfig::default()).unwrap();

        let err = handle
            .init(EngineConfig::default().with_max_points(0))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));

        handle.shutdown().await.unwrap();
        task.await.unwrap();
        assert!(matches!(handle.snapshot().await, Err(EngineError::HostClosed)));
    }
}
