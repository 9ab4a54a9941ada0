//! C4 — Health Tracker (§4.4). Passive signals are updated from every
//! completed forward attempt; an optional active probe loop updates the
//! same fields without itself toggling the circuit breaker (§9 open
//! question: active checks are informational only, not wired to C3).

use std::collections::HashMap;
use std::sync::Mutex;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::data::UpstreamId;

#[derive(Debug, Clone, Default)]
pub struct HealthEntry {
    pub is_healthy: bool,
    pub last_check_at: Option<OffsetDateTime>,
    pub last_success_at: Option<OffsetDateTime>,
    pub failure_count: u32,
    pub latency_ms: Option<u64>,
    pub error_message: Option<String>,
}

pub struct HealthTracker {
    entries: RwLock<HashMap<UpstreamId, Mutex<HealthEntry>>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn ensure(&self, upstream_id: UpstreamId) {
        let needs_insert = !self.entries.read().await.contains_key(&upstream_id);
        if needs_insert {
            let mut guard = self.entries.write().await;
            guard.entry(upstream_id).or_insert_with(|| {
                Mutex::new(HealthEntry {
                    is_healthy: true,
                    ..Default::default()
                })
            });
        }
    }

    /// Passive update from a completed C10 forward attempt.
    pub async fn record_outcome(
        &self,
        upstream_id: UpstreamId,
        success: bool,
        latency_ms: u64,
        now: OffsetDateTime,
        error_message: Option<String>,
    ) {
        let guard = self.entries.read().await;
        let Some(cell) = guard.get(&upstream_id) else {
            return;
        };
        let mut entry = cell.lock().expect("health mutex poisoned");
        entry.last_check_at = Some(now);
        entry.latency_ms = Some(latency_ms);
        if success {
            entry.is_healthy = true;
            entry.last_success_at = Some(now);
            entry.failure_count = 0;
            entry.error_message = None;
        } else {
            entry.failure_count += 1;
            entry.is_healthy = false;
            entry.error_message = error_message;
        }
    }

    /// Active probe outcome (§4.4): updates the same fields but never
    /// touches the circuit breaker.
    pub async fn record_active_probe(
        &self,
        upstream_id: UpstreamId,
        is_healthy: bool,
        latency_ms: u64,
        now: OffsetDateTime,
        error_message: Option<String>,
    ) {
        self.record_outcome(upstream_id, is_healthy, latency_ms, now, error_message)
            .await;
    }

    pub async fn is_healthy(&self, upstream_id: UpstreamId) -> bool {
        let guard = self.entries.read().await;
        guard
            .get(&upstream_id)
            .map(|cell| cell.lock().expect("health mutex poisoned").is_healthy)
            .unwrap_or(true)
    }

    pub async fn snapshot(&self, upstream_id: UpstreamId) -> Option<HealthEntry> {
        let guard = self.entries.read().await;
        guard
            .get(&upstream_id)
            .map(|cell| cell.lock().expect("health mutex poisoned").clone())
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[tokio::test]
    async fn marks_unhealthy_after_failure_and_recovers_on_success() {
        let tracker = HealthTracker::new();
        tracker.ensure(1).await;
        let t0 = datetime!(2026-01-01 00:00:00 UTC);
        tracker
            .record_outcome(1, false, 50, t0, Some("timeout".to_string()))
            .await;
        assert!(!tracker.is_healthy(1).await);
        tracker.record_outcome(1, true, 20, t0, None).await;
        assert!(tracker.is_healthy(1).await);
        let snap = tracker.snapshot(1).await.unwrap();
        assert_eq!(snap.failure_count, 0);
        assert!(snap.error_message.is_none());
    }

    #[tokio::test]
    async fn unknown_upstream_defaults_healthy() {
        let tracker = HealthTracker::new();
        assert!(tracker.is_healthy(999).await);
    }
}
