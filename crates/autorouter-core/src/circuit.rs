//! C3 — Circuit Breaker (§4.3). Per-upstream state machine, serialized by a
//! per-upstream mutex (§5: "no lock across any network I/O"). The probe
//! scheduling mirrors the teacher's credential `UnavailableQueue`
//! deadline-heap + `Notify` pattern, simplified to the breaker's own
//! closed/open/half_open shape (no background recover task is needed here:
//! `admit()` is itself the deadline check, evaluated lazily per request).

use std::collections::HashMap;
use std::sync::Mutex;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::data::{CircuitBreakerConfig, UpstreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<OffsetDateTime>,
    last_probe_at: Option<OffsetDateTime>,
    config: CircuitBreakerConfig,
}

impl BreakerEntry {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_probe_at: None,
            config,
        }
    }
}

/// Per-upstream state, guarded by a short-held std `Mutex` (§5: "operations
/// are short"). The outer map is an async `RwLock` since entries are only
/// added at registry reload, never on the request hot path.
pub struct CircuitBreakerRegistry {
    entries: RwLock<HashMap<UpstreamId, Mutex<BreakerEntry>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitDecision {
    Admit,
    AdmitProbe,
    Reject,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn ensure(&self, upstream_id: UpstreamId, config: CircuitBreakerConfig) {
        let needs_insert = !self.entries.read().await.contains_key(&upstream_id);
        if needs_insert {
            let mut guard = self.entries.write().await;
            guard
                .entry(upstream_id)
                .or_insert_with(|| Mutex::new(BreakerEntry::new(config)));
        }
    }

    /// `admit()` (§4.3): `open` rejects unless the probe interval elapsed,
    /// in which case exactly one probe is admitted and the state advances
    /// to `half_open`. `half_open` itself admits nothing further until the
    /// outstanding probe records (spec invariant 2).
    pub async fn admit(&self, upstream_id: UpstreamId, now: OffsetDateTime) -> AdmitDecision {
        let guard = self.entries.read().await;
        let Some(cell) = guard.get(&upstream_id) else {
            return AdmitDecision::Admit;
        };
        let mut entry = cell.lock().expect("circuit breaker mutex poisoned");
        match entry.state {
            BreakerState::Closed => AdmitDecision::Admit,
            BreakerState::HalfOpen => AdmitDecision::Reject,
            BreakerState::Open => {
                let probe_interval =
                    time::Duration::milliseconds(entry.config.probe_interval_ms as i64);
                let due = entry
                    .last_probe_at
                    .map(|t| now - t >= probe_interval)
                    .unwrap_or(true);
                if due {
                    entry.state = BreakerState::HalfOpen;
                    entry.last_probe_at = Some(now);
                    AdmitDecision::AdmitProbe
                } else {
                    AdmitDecision::Reject
                }
            }
        }
    }

    pub async fn record_success(&self, upstream_id: UpstreamId) {
        let guard = self.entries.read().await;
        let Some(cell) = guard.get(&upstream_id) else {
            return;
        };
        let mut entry = cell.lock().expect("circuit breaker mutex poisoned");
        match entry.state {
            BreakerState::Closed => {
                entry.failure_count = 0;
            }
            BreakerState::HalfOpen => {
                entry.success_count += 1;
                if entry.success_count >= entry.config.success_threshold {
                    entry.state = BreakerState::Closed;
                    entry.failure_count = 0;
                    entry.success_count = 0;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub async fn record_failure(&self, upstream_id: UpstreamId, now: OffsetDateTime) {
        let guard = self.entries.read().await;
        let Some(cell) = guard.get(&upstream_id) else {
            return;
        };
        let mut entry = cell.lock().expect("circuit breaker mutex poisoned");
        match entry.state {
            BreakerState::Closed => {
                entry.failure_count += 1;
                if entry.failure_count >= entry.config.failure_threshold {
                    entry.state = BreakerState::Open;
                    entry.opened_at = Some(now);
                }
            }
            BreakerState::HalfOpen => {
                entry.state = BreakerState::Open;
                entry.success_count = 0;
                entry.opened_at = Some(now);
            }
            BreakerState::Open => {
                entry.opened_at = Some(now);
            }
        }
    }

    pub async fn state(&self, upstream_id: UpstreamId) -> Option<BreakerState> {
        let guard = self.entries.read().await;
        let cell = guard.get(&upstream_id)?;
        Some(cell.lock().expect("circuit breaker mutex poisoned").state)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            open_duration_ms: 30_000,
            probe_interval_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn opens_after_failure_threshold_and_admits_one_probe_per_interval() {
        let reg = CircuitBreakerRegistry::new();
        reg.ensure(1, config()).await;
        let t0 = datetime!(2026-01-01 00:00:00 UTC);

        reg.record_failure(1, t0).await;
        reg.record_failure(1, t0).await;
        assert_eq!(reg.admit(1, t0).await, AdmitDecision::Admit);
        reg.record_failure(1, t0).await;
        assert_eq!(reg.state(1).await, Some(BreakerState::Open));

        // within probe interval: rejected
        assert_eq!(
            reg.admit(1, t0 + time::Duration::milliseconds(500)).await,
            AdmitDecision::Reject
        );
        // at/after probe interval: exactly one probe admitted
        let t1 = t0 + time::Duration::milliseconds(1000);
        assert_eq!(reg.admit(1, t1).await, AdmitDecision::AdmitProbe);
        assert_eq!(reg.state(1).await, Some(BreakerState::HalfOpen));
        // no further admission until probe resolves
        assert_eq!(reg.admit(1, t1).await, AdmitDecision::Reject);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold_consecutive_wins() {
        let reg = CircuitBreakerRegistry::new();
        reg.ensure(1, config()).await;
        let t0 = datetime!(2026-01-01 00:00:00 UTC);
        reg.record_failure(1, t0).await;
        reg.record_failure(1, t0).await;
        reg.record_failure(1, t0).await;
        let t1 = t0 + time::Duration::seconds(2);
        assert_eq!(reg.admit(1, t1).await, AdmitDecision::AdmitProbe);
        reg.record_success(1).await;
        assert_eq!(reg.state(1).await, Some(BreakerState::HalfOpen));
        reg.record_success(1).await;
        assert_eq!(reg.state(1).await, Some(BreakerState::Closed));
    }

    #[tokio::test]
    async fn half_open_failure_reopens_and_zeroes_success_count() {
        let reg = CircuitBreakerRegistry::new();
        reg.ensure(1, config()).await;
        let t0 = datetime!(2026-01-01 00:00:00 UTC);
        reg.record_failure(1, t0).await;
        reg.record_failure(1, t0).await;
        reg.record_failure(1, t0).await;
        let t1 = t0 + time::Duration::seconds(2);
        assert_eq!(reg.admit(1, t1).await, AdmitDecision::AdmitProbe);
        reg.record_failure(1, t1).await;
        assert_eq!(reg.state(1).await, Some(BreakerState::Open));
    }

    #[tokio::test]
    async fn success_in_closed_state_zeroes_failure_count() {
        let reg = CircuitBreakerRegistry::new();
        reg.ensure(1, config()).await;
        let t0 = datetime!(2026-01-01 00:00:00 UTC);
        reg.record_failure(1, t0).await;
        reg.record_failure(1, t0).await;
        reg.record_success(1).await;
        reg.record_failure(1, t0).await;
        reg.record_failure(1, t0).await;
        // Would have opened at 3 consecutive failures; success reset the count.
        assert_eq!(reg.state(1).await, Some(BreakerState::Closed));
    }
}
