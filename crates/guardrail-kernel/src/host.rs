//! Host-side adapters used by the `guardrail` binary
//!
//! - [`SystemProbe`] reads memory utilization from `/proc/meminfo`
//! - [`DryRunLauncher`] records a dry execution without doing any work
//! - [`FileHealthSource`] reads health samples that an external collector
//!   writes to a JSON file keyed by lease id

use crate::halt::{HealthSample, HealthSource};
use crate::scheduler::{LaunchTicket, ResourceProbe, WorkLauncher};
use async_trait::async_trait;
use chrono::Utc;
use guardrail_core::{ExecutionMode, ExecutionRecord, ExecutionStatus, LeaseId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Memory utilization of the host
#[derive(Debug, Clone)]
pub struct SystemProbe {
    meminfo: PathBuf,
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl SystemProbe {
    /// Read from a meminfo-formatted file other than `/proc/meminfo`
    #[must_use]
    pub fn with_meminfo(path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: path.into(),
        }
    }
}

impl ResourceProbe for SystemProbe {
    fn memory_utilization(&self) -> f64 {
        match std::fs::read_to_string(&self.meminfo) {
            Ok(text) => parse_meminfo(&text).unwrap_or(0.0),
            Err(e) => {
                tracing::debug!(path = %self.meminfo.display(), error = %e, "meminfo unavailable");
                0.0
            }
        }
    }
}

/// Used percentage from `MemTotal` and `MemAvailable`
fn parse_meminfo(text: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        text.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse::<f64>()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

/// Launcher that only records that a launch happened
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunLauncher;

#[async_trait]
impl WorkLauncher for DryRunLauncher {
    async fn launch(&self, ticket: LaunchTicket) -> ExecutionRecord {
        let started = Utc::now();
        tracing::info!(strategy = %ticket.strategy, "dry run");
        ExecutionRecord::new(ExecutionStatus::Completed, ExecutionMode::Dry, started, Utc::now(), 0)
    }
}

/// Health samples from a JSON file of `{ "<lease id>": HealthSample }`
#[derive(Debug, Clone)]
pub struct FileHealthSource {
    path: PathBuf,
}

impl FileHealthSource {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HealthSource for FileHealthSource {
    fn sample(&self, lease_id: LeaseId) -> Option<HealthSample> {
        let text = std::fs::read_to_string(&self.path).ok()?;
        match serde_json::from_str::<HashMap<String, HealthSample>>(&text) {
            Ok(mut samples) => samples.remove(&lease_id.to_string()),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable health file");
                None
            }
        }
    }
}
