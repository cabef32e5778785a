//! Append-only execution log
//!
//! Every [`ExecutionRecord`] is committed with a monotonic sequence number
//! and chained to its predecessor by hash. Readers take a [`LogWindow`] under
//! a single read lock, so a window never straddles a concurrent append or a
//! rotation.

use guardrail_core::{ContentHash, ExecutionRecord, InputError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One committed record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub sequence: u64,
    pub record: ExecutionRecord,
    pub prev_hash: ContentHash,
    pub hash: ContentHash,
}

/// Consistent read of the most recent records
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogWindow {
    /// Oldest first
    pub records: Vec<ExecutionRecord>,
    /// Highest sequence included, `None` when empty
    pub through_sequence: Option<u64>,
}

impl LogWindow {
    /// Number of records
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the window holds no records
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Log errors
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The record was rejected before commit
    #[error("record rejected: {0}")]
    Rejected(#[from] InputError),

    /// The hash chain is broken
    #[error("log integrity violation at sequence {sequence}")]
    IntegrityViolation { sequence: u64 },
}

#[derive(Debug, Default)]
struct LogInner {
    entries: VecDeque<LogEntry>,
    next_sequence: u64,
    /// `prev_hash` expected on the oldest retained entry
    anchor: ContentHash,
}

/// Append-only, hash-chained execution log
#[derive(Debug, Default)]
pub struct ExecutionLog {
    inner: RwLock<LogInner>,
    /// Keep at most this many entries in memory
    retain: Option<usize>,
}

impl ExecutionLog {
    /// Unbounded log
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Log that rotates out entries beyond `retain`
    #[must_use]
    pub fn with_retention(retain: usize) -> Self {
        Self {
            inner: RwLock::default(),
            retain: Some(retain.max(1)),
        }
    }

    /// Commit a record, returning its sequence number
    ///
    /// # Errors
    /// Returns `LogError::Rejected` if the record fails validation.
    pub fn append(&self, record: ExecutionRecord) -> Result<u64, LogError> {
        record.validate()?;
        let mut inner = self.inner.write();
        let sequence = inner.next_sequence;
        let prev_hash = inner
            .entries
            .back()
            .map_or(inner.anchor, |entry| entry.hash);
        let hash = entry_hash(sequence, &record, prev_hash);
        inner.entries.push_back(LogEntry {
            sequence,
            record,
            prev_hash,
            hash,
        });
        inner.next_sequence += 1;

        if let Some(retain) = self.retain {
            while inner.entries.len() > retain {
                if let Some(evicted) = inner.entries.pop_front() {
                    inner.anchor = evicted.hash;
                }
            }
        }
        tracing::debug!(sequence, "execution record committed");
        Ok(sequence)
    }

    /// The `n` most recent records, read atomically
    #[must_use]
    pub fn window(&self, n: usize) -> LogWindow {
        let inner = self.inner.read();
        let skip = inner.entries.len().saturating_sub(n);
        let records: Vec<_> = inner
            .entries
            .iter()
            .skip(skip)
            .map(|e| e.record.clone())
            .collect();
        let through_sequence = if records.is_empty() {
            None
        } else {
            inner.entries.back().map(|e| e.sequence)
        };
        LogWindow {
            records,
            through_sequence,
        }
    }

    /// Retained entries, oldest first
    #[must_use]
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner.read().entries.iter().cloned().collect()
    }

    /// Retained entry count
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether nothing is retained
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Sequence of the newest entry
    #[must_use]
    pub fn latest_sequence(&self) -> Option<u64> {
        self.inner.read().entries.back().map(|e| e.sequence)
    }

    /// Re-walk the hash chain of the retained entries
    ///
    /// # Errors
    /// Returns the sequence of the first entry whose links do not match.
    pub fn verify_integrity(&self) -> Result<(), LogError> {
        let inner = self.inner.read();
        let mut prev = inner.anchor;
        for entry in &inner.entries {
            if entry.prev_hash != prev || entry.hash != entry_hash(entry.sequence, &entry.record, prev) {
                return Err(LogError::IntegrityViolation {
                    sequence: entry.sequence,
                });
            }
            prev = entry.hash;
        }
        Ok(())
    }

    #[cfg(test)]
    fn tamper(&self, index: usize, files_changed: u32) {
        self.inner.write().entries[index].record.files_changed = files_changed;
    }
}

fn entry_hash(sequence: u64, record: &ExecutionRecord, prev_hash: ContentHash) -> ContentHash {
    // A record that passed validation always serializes.
    let body = serde_json::to_vec(record).unwrap_or_default();
    ContentHash::compute_parts(&[&sequence.to_le_bytes(), &body, prev_hash.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use guardrail_core::{ExecutionMode, ExecutionStatus};
    use std::sync::Arc;

    fn record(files: u32) -> ExecutionRecord {
        let start = Utc::now();
        ExecutionRecord::new(
            ExecutionStatus::Completed,
            ExecutionMode::Test,
            start,
            start + Duration::seconds(5),
            files,
        )
    }

    #[test]
    fn sequences_are_monotonic() {
        let log = ExecutionLog::new();
        assert_eq!(log.append(record(1)).unwrap(), 0);
        assert_eq!(log.append(record(2)).unwrap(), 1);
        assert_eq!(log.latest_sequence(), Some(1));
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn window_returns_most_recent() {
        let log = ExecutionLog::new();
        for files in 0..5 {
            log.append(record(files)).unwrap();
        }
        let window = log.window(2);
        assert_eq!(window.len(), 2);
        assert_eq!(window.records[0].files_changed, 3);
        assert_eq!(window.records[1].files_changed, 4);
        assert_eq!(window.through_sequence, Some(4));
        assert!(ExecutionLog::new().window(3).through_sequence.is_none());
    }

    #[test]
    fn tampering_detected() {
        let log = ExecutionLog::new();
        for files in 0..3 {
            log.append(record(files)).unwrap();
        }
        log.tamper(1, 99);
        assert!(matches!(
            log.verify_integrity(),
            Err(LogError::IntegrityViolation { sequence: 1 })
        ));
    }

    #[test]
    fn rotation_keeps_chain_verifiable() {
        let log = ExecutionLog::with_retention(3);
        for files in 0..10 {
            log.append(record(files)).unwrap();
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.entries()[0].sequence, 7);
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn invalid_record_not_committed() {
        let log = ExecutionLog::new();
        let mut bad = record(1);
        bad.duration_s = -1.0;
        assert!(matches!(log.append(bad), Err(LogError::Rejected(_))));
        assert!(log.is_empty());
    }

    #[test]
    fn concurrent_appends_and_windows() {
        let log = Arc::new(ExecutionLog::with_retention(64));
        let writers: Vec<_> = (0..4)
            .map(|_| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for files in 0..50 {
                        log.append(record(files)).unwrap();
                    }
                })
            })
            .collect();
        let reader = {
            let log = Arc::clone(&log);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    let window = log.window(10);
                    assert!(window.len() <= 10);
                }
            })
        };
        for w in writers {
            w.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(log.latest_sequence(), Some(199));
        assert!(log.verify_integrity().is_ok());
    }
}
