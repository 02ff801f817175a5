//! External sample store interface
//!
//! The engine never persists anything itself; it only reads history from a
//! document store indexed by `(session_id, timestamp)`. [`MemoryStore`] is an
//! in-process implementation used by tests and the CLI replay command.

use crate::error::StoreError;
use crate::merge::sort_samples;
use crate::types::{Sample, SampleKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Upper bound on records returned by [`SampleStore::all_records`]
pub const ALL_RECORDS_CAP: usize = 500_000;

/// Newest known timestamp and record count of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestInfo {
    pub timestamp: Option<DateTime<Utc>>,
    pub count: usize,
}

#[async_trait]
pub trait SampleStore: Send + Sync {
    async fn latest_timestamp(&self, session_id: &str) -> Result<LatestInfo, StoreError>;

    /// Up to `limit` records strictly after `after`, ascending by timestamp
    async fn records_in_range(
        &self,
        session_id: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Sample>, StoreError>;

    /// Every record of a session, ascending, capped at [`ALL_RECORDS_CAP`]
    async fn all_records(&self, session_id: &str) -> Result<Vec<Sample>, StoreError>;

    /// Insert a batch; returns how many records were new
    async fn insert_batch(&self, session_id: &str, samples: Vec<Sample>)
        -> Result<usize, StoreError>;
}

/// In-memory store keeping each session sorted by timestamp
#[derive(Debug, Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Vec<Sample>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SampleStore for MemoryStore {
    async fn latest_timestamp(&self, session_id: &str) -> Result<LatestInfo, StoreError> {
        let sessions = self.sessions.read().await;
        let records = sessions.get(session_id);
        Ok(LatestInfo {
            timestamp: records.and_then(|r| r.last()).map(|s| s.timestamp),
            count: records.map_or(0, Vec::len),
        })
    }

    async fn records_in_range(
        &self,
        session_id: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Result<Vec<Sample>, StoreError> {
        let sessions = self.sessions.read().await;
        let Some(records) = sessions.get(session_id) else {
            return Ok(Vec::new());
        };
        let start = match after {
            Some(after) => records.partition_point(|s| s.timestamp <= after),
            None => 0,
        };
        Ok(records[start..].iter().take(limit).cloned().collect())
    }

    async fn all_records(&self, session_id: &str) -> Result<Vec<Sample>, StoreError> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(session_id)
            .map(|r| r.iter().take(ALL_RECORDS_CAP).cloned().collect())
            .unwrap_or_default())
    }

    async fn insert_batch(
        &self,
        session_id: &str,
        samples: Vec<Sample>,
    ) -> Result<usize, StoreError> {
        if let Some(foreign) = samples.iter().find(|s| s.session_id != session_id) {
            return Err(StoreError::Query(format!(
                "sample for session {} inserted into {}",
                foreign.session_id, session_id
            )));
        }

        let mut sessions = self.sessions.write().await;
        let records = sessions.entry(session_id.to_string()).or_default();
        let mut seen: HashSet<SampleKey> = records.iter().map(Sample::key).collect();

        let mut inserted = 0;
        for mut sample in samples {
            if seen.insert(sample.key()) {
                // Derived values are engine state, not stored data.
                sample.derived = None;
                records.push(sample);
                inserted += 1;
            }
        }
        sort_samples(records);
        Ok(inserted)
    }
}
