//! Score report output
//!
//! A periodic document for external dashboards. It only implements
//! `Serialize`: reports flow out of the pipeline and are never parsed back
//! into scoring.

use crate::agii::AgiiScorecard;
use crate::engine::{ScoreSnapshot, TesWindowStats};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Report schema version
pub const REPORT_SCHEMA_VERSION: u16 = 1;

/// TES window statistics and the AGII scorecard
#[derive(Debug, Clone, Serialize)]
pub struct ScoreReport {
    pub schema_version: u16,
    pub generated_at: DateTime<Utc>,
    pub snapshot_sequence: u64,
    pub log_through: Option<u64>,
    pub tes: TesWindowStats,
    pub agii: AgiiScorecard,
    /// Snapshots recorded so far
    pub history_len: usize,
}

impl ScoreReport {
    /// Build from a snapshot
    #[must_use]
    pub fn from_snapshot(snapshot: &ScoreSnapshot, history_len: usize) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            generated_at: Utc::now(),
            snapshot_sequence: snapshot.sequence,
            log_through: snapshot.log_through,
            tes: snapshot.tes,
            agii: snapshot.agii,
            history_len,
        }
    }

    /// Pretty JSON
    ///
    /// # Errors
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
