//! Liveness tracking for control loops and other long-running components

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use guardrail_core::Clock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Last beat of one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub id: String,
    pub last_beat: DateTime<Utc>,
    pub beats: u64,
    pub stale: bool,
}

#[derive(Debug, Clone, Copy)]
struct Beat {
    at: DateTime<Utc>,
    count: u64,
}

/// Heartbeats keyed by component identity; a component is stale once its
/// last beat is older than the TTL
#[derive(Debug)]
pub struct HeartbeatRegistry {
    beats: DashMap<String, Beat>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl HeartbeatRegistry {
    #[must_use]
    pub fn new(ttl: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            beats: DashMap::new(),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::MAX),
            clock,
        }
    }

    /// Record that `id` is alive
    pub fn beat(&self, id: &str) {
        let now = self.clock.now();
        self.beats
            .entry(id.to_string())
            .and_modify(|b| {
                b.at = now;
                b.count += 1;
            })
            .or_insert(Beat { at: now, count: 1 });
    }

    /// Whether `id` missed its TTL. Unknown identities are stale.
    #[must_use]
    pub fn is_stale(&self, id: &str) -> bool {
        let now = self.clock.now();
        self.beats.get(id).map_or(true, |b| self.expired(b.at, now))
    }

    /// Identities whose last beat is older than the TTL
    #[must_use]
    pub fn stale(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut ids: Vec<String> = self
            .beats
            .iter()
            .filter(|e| self.expired(e.value().at, now))
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Every known heartbeat, sorted by identity
    #[must_use]
    pub fn snapshot(&self) -> Vec<Heartbeat> {
        let now = self.clock.now();
        let mut all: Vec<Heartbeat> = self
            .beats
            .iter()
            .map(|e| Heartbeat {
                id: e.key().clone(),
                last_beat: e.value().at,
                beats: e.value().count,
                stale: self.expired(e.value().at, now),
            })
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    fn expired(&self, at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(at) > self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use guardrail_core::ManualClock;

    #[test]
    fn beats_go_stale_after_ttl() {
        let clock = ManualClock::default();
        let registry = HeartbeatRegistry::new(std::time::Duration::from_secs(60), Arc::new(clock.clone()));

        assert!(registry.is_stale("scheduler"));
        registry.beat("scheduler");
        registry.beat("canary");
        assert!(!registry.is_stale("scheduler"));

        clock.advance(Duration::seconds(45));
        registry.beat("canary");
        clock.advance(Duration::seconds(30));

        assert!(registry.is_stale("scheduler"));
        assert!(!registry.is_stale("canary"));
        assert_eq!(registry.stale(), vec!["scheduler".to_string()]);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "canary");
        assert_eq!(snapshot[0].beats, 2);
        assert!(snapshot[1].stale);
    }
}
