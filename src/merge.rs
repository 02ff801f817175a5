//! Merge and deduplication of sample batches
//!
//! Combines an ordered buffer with an incoming batch. Identity is the
//! [`SampleKey`]; observed samples always win over provisional (gap-fill)
//! ones. The result is sorted and front-trimmed to a sliding window.

use crate::types::{Sample, SampleKey};
use std::collections::{HashMap, HashSet};

/// Result of a merge, with counters for the quality report
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    pub buffer: Vec<Sample>,
    /// Incoming samples stored under a new key
    pub inserted: usize,
    /// Provisional samples replaced by an observed one
    pub replaced: usize,
    /// Incoming samples discarded as duplicates
    pub duplicates: usize,
    /// Accepted incoming samples that fell outside the retained window
    pub late_dropped: usize,
}

/// Merge `incoming` into `buffer`, keeping at most `max_points` entries
pub fn merge(buffer: Vec<Sample>, incoming: Vec<Sample>, max_points: usize) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    let mut merged = buffer;
    let mut index: HashMap<SampleKey, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, s)| (s.key(), i))
        .collect();
    let mut accepted: HashSet<SampleKey> = HashSet::new();

    for sample in incoming {
        let key = sample.key();
        match index.get(&key) {
            None => {
                index.insert(key, merged.len());
                merged.push(sample);
                accepted.insert(key);
                outcome.inserted += 1;
            }
            Some(&slot) if merged[slot].provisional && !sample.provisional => {
                merged[slot] = sample;
                accepted.insert(key);
                outcome.replaced += 1;
            }
            Some(_) => outcome.duplicates += 1,
        }
    }

    sort_samples(&mut merged);

    if merged.len() > max_points {
        let excess = merged.len() - max_points;
        outcome.late_dropped = merged[..excess]
            .iter()
            .filter(|s| accepted.contains(&s.key()))
            .count();
        merged.drain(..excess);
    }

    outcome.buffer = merged;
    outcome
}

/// Collapse repeated keys within one batch, keeping observed over provisional
///
/// Returns the surviving samples sorted, and how many were discarded.
pub fn dedup_batch(samples: Vec<Sample>) -> (Vec<Sample>, usize) {
    let mut index: HashMap<SampleKey, usize> = HashMap::with_capacity(samples.len());
    let mut kept: Vec<Sample> = Vec::with_capacity(samples.len());
    let mut discarded = 0;

    for sample in samples {
        let key = sample.key();
        match index.get(&key) {
            None => {
                index.insert(key, kept.len());
                kept.push(sample);
            }
            Some(&slot) => {
                if kept[slot].provisional && !sample.provisional {
                    kept[slot] = sample;
                }
                discarded += 1;
            }
        }
    }

    sort_samples(&mut kept);
    (kept, discarded)
}

/// Sort ascending by timestamp, then by sequence number
pub fn sort_samples(samples: &mut [Sample]) {
    samples.sort_by(|a, b| {
        a.timestamp
            .cmp(&b.timestamp)
            .then_with(|| a.message_id.cmp(&b.message_id))
    });
}

/// True when `buffer` already holds an observed sample under `key`
///
/// A provisional entry under the same key does not count: an observed sample
/// arriving for it must still be merged.
pub fn contains_observed(buffer: &[Sample], key: &SampleKey) -> bool {
    let ts = key.timestamp_ms;
    let start = buffer.partition_point(|s| s.timestamp.timestamp_millis() < ts);
    buffer[start..]
        .iter()
        .take_while(|s| s.timestamp.timestamp_millis() == ts)
        .any(|s| s.message_id == key.message_id && !s.provisional)
}
