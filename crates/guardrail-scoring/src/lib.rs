//! Guardrail Scoring
//!
//! The two scoring engines of the pipeline:
//! - [`tes`]: per-execution Task Execution Score
//! - [`agii`]: rolling Autonomy Guardrail Integrity Index
//!
//! plus the append-only [`ExecutionLog`] they read from, the snapshot
//! history, and the outbound [`ScoreReport`]. Everything here is a pure
//! function of committed inputs.

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod agii;
pub mod engine;
pub mod log;
pub mod report;
pub mod tes;

pub use agii::{AgiiCalculator, AgiiScorecard, BandStatus, LiveSignals, WatchdogMode};
pub use engine::{ScoreHistory, ScoreSnapshot, ScoringEngine, TesWindowStats};
pub use log::{ExecutionLog, LogEntry, LogError, LogWindow};
pub use report::{ScoreReport, REPORT_SCHEMA_VERSION};
pub use tes::{TesBreakdown, TesCalculator, TesComponent, TesScore};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
