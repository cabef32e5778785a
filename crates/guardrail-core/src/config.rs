//! Guardrail configuration
//!
//! Every threshold in the pipeline (TES breakpoints, AGII bands, scheduler
//! soft limits, auto-halt percentages) lives here. The defaults are the
//! commonly used values; deployments override them from a TOML file.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub canary: CanaryConfig,
    #[serde(default)]
    pub halt: HaltThresholds,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub loops: LoopConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

impl GuardrailConfig {
    /// Default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load and validate a TOML file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML string
    ///
    /// # Errors
    /// Returns an error if the TOML is invalid or fails [`Self::validate`].
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations whose thresholds contradict each other
    ///
    /// # Errors
    /// Returns `ConfigError::Validation` naming the first bad setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scoring.validate()?;
        self.scheduler.validate()?;
        self.halt.validate()?;
        if self.lease.default_ttl_secs == 0 || self.lease.default_ttl_secs > self.lease.max_ttl_secs {
            return Err(ConfigError::Validation(
                "lease.default_ttl_secs must be in 1..=max_ttl_secs".to_string(),
            ));
        }
        Ok(())
    }
}

fn weights_sum_to_one(weights: &[f64]) -> bool {
    (weights.iter().sum::<f64>() - 1.0).abs() < 1e-6 && weights.iter().all(|w| *w >= 0.0)
}

/// Scoring engine settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub tes: TesConfig,
    pub agii: AgiiConfig,
}

impl ScoringConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let tes = &self.tes;
        if !weights_sum_to_one(&[tes.stability_weight, tes.velocity_weight, tes.footprint_weight]) {
            return Err(ConfigError::Validation("scoring.tes weights must sum to 1".to_string()));
        }
        if tes.velocity_full_secs >= tes.velocity_zero_secs {
            return Err(ConfigError::Validation(
                "scoring.tes.velocity_full_secs must be below velocity_zero_secs".to_string(),
            ));
        }
        if tes.footprint_full_files >= tes.footprint_zero_files {
            return Err(ConfigError::Validation(
                "scoring.tes.footprint_full_files must be below footprint_zero_files".to_string(),
            ));
        }
        let agii = &self.agii;
        if !weights_sum_to_one(&[
            agii.reliability_weight,
            agii.observability_weight,
            agii.safeguards_weight,
        ]) {
            return Err(ConfigError::Validation("scoring.agii weights must sum to 1".to_string()));
        }
        if agii.amber_threshold >= agii.green_threshold || agii.window == 0 {
            return Err(ConfigError::Validation(
                "scoring.agii needs amber_threshold < green_threshold and a non-empty window"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Task Execution Score settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesConfig {
    pub stability_weight: f64,
    pub velocity_weight: f64,
    pub footprint_weight: f64,
    /// Duration at or below which velocity is 1.0
    pub velocity_full_secs: f64,
    /// Duration at or above which velocity is 0.0
    pub velocity_zero_secs: f64,
    pub footprint_full_files: u32,
    pub footprint_zero_files: u32,
}

impl Default for TesConfig {
    fn default() -> Self {
        Self {
            stability_weight: 0.5,
            velocity_weight: 0.3,
            footprint_weight: 0.2,
            velocity_full_secs: 90.0,
            velocity_zero_secs: 900.0,
            footprint_full_files: 1,
            footprint_zero_files: 10,
        }
    }
}

/// Autonomy Guardrail Integrity Index settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgiiConfig {
    /// Most-recent executions considered
    pub window: usize,
    pub reliability_weight: f64,
    pub observability_weight: f64,
    pub safeguards_weight: f64,
    pub green_threshold: f64,
    pub amber_threshold: f64,
    /// A dimension below this caps the overall status at amber
    pub dimension_floor: f64,
}

impl Default for AgiiConfig {
    fn default() -> Self {
        Self {
            window: 50,
            reliability_weight: 0.5,
            observability_weight: 0.25,
            safeguards_weight: 0.25,
            green_threshold: 90.0,
            amber_threshold: 70.0,
            dimension_floor: 70.0,
        }
    }
}

/// Adaptive scheduler settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Minimum time between launches
    pub base_interval_ms: u64,
    /// Backoff retries after a memory-limit skip
    pub retry_attempts: u32,
    /// First backoff delay; doubles on every retry
    pub retry_base_delay_ms: u64,
    /// TES mean above which the system counts as healthy
    pub healthy_tes_mean: f64,
    /// TES mean below which the system counts as struggling
    pub struggling_tes_mean: f64,
    /// Memory soft limit (%) when healthy
    pub healthy_memory_limit: f64,
    /// Memory soft limit (%) in the middle band
    pub steady_memory_limit: f64,
    /// Memory soft limit (%) when struggling
    pub struggling_memory_limit: f64,
    /// Launches this close (percentage points) to the soft limit are warning-flagged
    pub warning_margin: f64,
    /// Records considered for TES mean and strategy selection
    pub trend_window: usize,
    /// Every TES component at or above this selects the balanced strategy
    pub balanced_floor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 300_000,
            retry_attempts: 3,
            retry_base_delay_ms: 60_000,
            healthy_tes_mean: 80.0,
            struggling_tes_mean: 60.0,
            healthy_memory_limit: 70.0,
            steady_memory_limit: 75.0,
            struggling_memory_limit: 78.0,
            warning_margin: 5.0,
            trend_window: 10,
            balanced_floor: 0.8,
        }
    }
}

impl SchedulerConfig {
    /// Minimum time between launches
    #[inline]
    #[must_use]
    pub fn base_interval(&self) -> Duration {
        Duration::from_millis(self.base_interval_ms)
    }

    /// Delay before retry `attempt` (0-based)
    #[must_use]
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(factor))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.struggling_tes_mean > self.healthy_tes_mean {
            return Err(ConfigError::Validation(
                "scheduler.struggling_tes_mean must not exceed healthy_tes_mean".to_string(),
            ));
        }
        if self.trend_window == 0 {
            return Err(ConfigError::Validation("scheduler.trend_window must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Canary rollout settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Minimum observation at the 5% tier
    pub tier5_observation_secs: u64,
    /// Minimum observation at the 25% tier
    pub tier25_observation_secs: u64,
    /// Minimum observation at the 100% tier before completion
    pub tier100_observation_secs: u64,
    /// Let the health-check loop promote without an operator
    pub auto_promote: bool,
    /// Halt on threshold breaches; when off the monitor only reports
    pub auto_halt: bool,
}

impl CanaryConfig {
    /// Minimum observation time before leaving `tier`
    #[must_use]
    pub fn observation_for(&self, tier: crate::types::Tier) -> Duration {
        use crate::types::Tier;
        let secs = match tier {
            Tier::Tier5 => self.tier5_observation_secs,
            Tier::Tier25 => self.tier25_observation_secs,
            Tier::Tier100 => self.tier100_observation_secs,
            Tier::Pending | Tier::Complete | Tier::Halted | Tier::RolledBack => 0,
        };
        Duration::from_secs(secs)
    }
}

impl Default for CanaryConfig {
    fn default() -> Self {
        Self {
            tier5_observation_secs: 600,
            tier25_observation_secs: 900,
            tier100_observation_secs: 1_800,
            auto_promote: false,
            auto_halt: true,
        }
    }
}

/// Auto-halt thresholds (percent values)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaltThresholds {
    /// TES change vs baseline below which a warning is raised
    pub tes_delta_warn_pct: f64,
    /// TES change vs baseline below which the rollout halts
    pub tes_delta_halt_pct: f64,
    pub error_rate_warn_pct: f64,
    pub error_rate_halt_pct: f64,
    /// CPU load as a percentage of nominal
    pub cpu_warn_pct: f64,
    pub cpu_halt_pct: f64,
    pub memory_warn_pct: f64,
    pub memory_halt_pct: f64,
}

impl Default for HaltThresholds {
    fn default() -> Self {
        Self {
            tes_delta_warn_pct: -2.0,
            tes_delta_halt_pct: -5.0,
            error_rate_warn_pct: 1.0,
            error_rate_halt_pct: 2.0,
            cpu_warn_pct: 110.0,
            cpu_halt_pct: 120.0,
            memory_warn_pct: 90.0,
            memory_halt_pct: 95.0,
        }
    }
}

impl HaltThresholds {
    fn validate(&self) -> Result<(), ConfigError> {
        let ordered = self.tes_delta_halt_pct <= self.tes_delta_warn_pct
            && self.error_rate_warn_pct <= self.error_rate_halt_pct
            && self.cpu_warn_pct <= self.cpu_halt_pct
            && self.memory_warn_pct <= self.memory_halt_pct;
        if ordered {
            Ok(())
        } else {
            Err(ConfigError::Validation(
                "halt warning thresholds must be less severe than halt thresholds".to_string(),
            ))
        }
    }
}

/// Lease settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 3_600,
            max_ttl_secs: 86_400,
        }
    }
}

/// Control loop cadences
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub scheduler_tick_ms: u64,
    pub canary_check_ms: u64,
    pub halt_eval_ms: u64,
    /// A loop that has not beaten for this long is stale
    pub heartbeat_ttl_ms: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            scheduler_tick_ms: 60_000,
            canary_check_ms: 30_000,
            halt_eval_ms: 10_000,
            heartbeat_ttl_ms: 120_000,
        }
    }
}

/// Persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub state_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("guardrail-state"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(GuardrailConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = GuardrailConfig::from_toml(
            r#"
            [halt]
            memory_halt_pct = 97.0

            [scheduler]
            retry_attempts = 5
            "#,
        )
        .unwrap();
        assert!((config.halt.memory_halt_pct - 97.0).abs() < f64::EPSILON);
        assert!((config.halt.memory_warn_pct - 90.0).abs() < f64::EPSILON);
        assert_eq!(config.scheduler.retry_attempts, 5);
        assert_eq!(config.scoring.agii.window, 50);
    }

    #[test]
    fn inverted_halt_thresholds_rejected() {
        let result = GuardrailConfig::from_toml(
            r#"
            [halt]
            cpu_warn_pct = 130.0
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn bad_weights_rejected() {
        let result = GuardrailConfig::from_toml(
            r#"
            [scoring.agii]
            reliability_weight = 0.9
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn retry_delay_doubles() {
        let config = SchedulerConfig::default();
        assert_eq!(config.retry_delay(0), Duration::from_secs(60));
        assert_eq!(config.retry_delay(1), Duration::from_secs(120));
        assert_eq!(config.retry_delay(2), Duration::from_secs(240));
    }

    #[test]
    fn loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guardrail.toml");
        std::fs::write(&path, "[lease]\ndefault_ttl_secs = 60\n").unwrap();
        let config = GuardrailConfig::from_file(&path).unwrap();
        assert_eq!(config.lease.default_ttl_secs, 60);
    }
}
