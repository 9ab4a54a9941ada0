//! C5 — Quota Tracker (§4.5). A per-upstream mutex covers the rule map;
//! `record_spending` is non-blocking with respect to the reconciler, which
//! briefly locks to swap in a DB-derived baseline. The reconciler tick loop
//! is grounded in the same recover-task idiom as the credential
//! unavailable queue; the urgency threshold mirrors the teacher pack's
//! `QuotaState::is_near_limit` concept.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::data::{SpendingRule, UpstreamId};

#[derive(Debug, Clone, Copy)]
pub struct QuotaEntry {
    pub current_spending: f64,
    pub limit: f64,
    pub last_synced_at: Option<OffsetDateTime>,
}

impl QuotaEntry {
    pub fn percent_used(&self) -> f64 {
        if self.limit <= 0.0 {
            return 0.0;
        }
        (self.current_spending / self.limit) * 100.0
    }
}

struct UpstreamQuota {
    rules: HashMap<String, QuotaEntry>,
}

/// Aggregates billing history for quota reconciliation — implemented by
/// the storage layer against `request_billing_snapshots` (§4.5, §4.12).
#[async_trait::async_trait]
pub trait SpendingAggregator: Send + Sync {
    async fn sum_spending_since(
        &self,
        upstream_id: UpstreamId,
        since: OffsetDateTime,
    ) -> anyhow::Result<f64>;

    /// Hourly cost slices covering `[since, now]`, oldest first — used by
    /// the rolling-window recovery estimate (§4.5).
    async fn hourly_slices_since(
        &self,
        upstream_id: UpstreamId,
        since: OffsetDateTime,
    ) -> anyhow::Result<Vec<(OffsetDateTime, f64)>>;
}

pub struct QuotaTracker {
    by_upstream: RwLock<HashMap<UpstreamId, Mutex<UpstreamQuota>>>,
    urgent_threshold_percent: f64,
}

impl QuotaTracker {
    pub fn new(urgent_threshold_percent: f64) -> Self {
        Self {
            by_upstream: RwLock::new(HashMap::new()),
            urgent_threshold_percent,
        }
    }

    /// Registers `upstream_id`'s rule set if this is the first time it's
    /// been seen, mirroring `circuit.ensure`/`health.ensure`'s idempotent
    /// "insert if absent" pattern (engine.rs calls this on every attempt,
    /// same as those two). Existing rule entries are left untouched — only
    /// their `limit` is refreshed from `rules` — so `current_spending`
    /// accumulated by `record_spending` survives across calls; §4.5's
    /// "authoritative-plus-delta" invariant would otherwise be wiped every
    /// request. Rules no longer present in `rules` are dropped; rules newly
    /// added are inserted fresh at zero.
    pub async fn ensure(&self, upstream_id: UpstreamId, rules: &[SpendingRule]) {
        let guard = self.by_upstream.read().await;
        if let Some(cell) = guard.get(&upstream_id) {
            let mut quota = cell.lock().expect("quota mutex poisoned");
            let keys: std::collections::HashSet<String> =
                rules.iter().map(|r| r.rule_key()).collect();
            quota.rules.retain(|key, _| keys.contains(key));
            for rule in rules {
                quota
                    .rules
                    .entry(rule.rule_key())
                    .and_modify(|entry| entry.limit = rule.limit())
                    .or_insert(QuotaEntry {
                        current_spending: 0.0,
                        limit: rule.limit(),
                        last_synced_at: None,
                    });
            }
            return;
        }
        drop(guard);

        let mut rule_map = HashMap::new();
        for rule in rules {
            rule_map.insert(
                rule.rule_key(),
                QuotaEntry {
                    current_spending: 0.0,
                    limit: rule.limit(),
                    last_synced_at: None,
                },
            );
        }
        let mut guard = self.by_upstream.write().await;
        guard
            .entry(upstream_id)
            .or_insert_with(|| Mutex::new(UpstreamQuota { rules: rule_map }));
    }

    /// `isWithinQuota(id)` (§4.5): every rule must be under its limit;
    /// absent rules allow.
    pub async fn is_within_quota(&self, upstream_id: UpstreamId) -> bool {
        let guard = self.by_upstream.read().await;
        let Some(cell) = guard.get(&upstream_id) else {
            return true;
        };
        let quota = cell.lock().expect("quota mutex poisoned");
        quota
            .rules
            .values()
            .all(|entry| entry.current_spending < entry.limit)
    }

    /// `recordSpending(id, cost)` (§4.5): in-memory increment only.
    pub async fn record_spending(&self, upstream_id: UpstreamId, cost: f64) {
        let guard = self.by_upstream.read().await;
        let Some(cell) = guard.get(&upstream_id) else {
            return;
        };
        let mut quota = cell.lock().expect("quota mutex poisoned");
        for entry in quota.rules.values_mut() {
            entry.current_spending += cost;
        }
    }

    fn period_start(rule_key: &str, now: OffsetDateTime) -> OffsetDateTime {
        if rule_key == "daily" {
            now.replace_time(time::Time::MIDNIGHT)
        } else if rule_key == "monthly" {
            now.replace_day(1)
                .unwrap_or(now)
                .replace_time(time::Time::MIDNIGHT)
        } else if let Some(hours) = rule_key.strip_prefix("rolling:") {
            let hours: i64 = hours.parse().unwrap_or(24);
            now - time::Duration::hours(hours)
        } else {
            now
        }
    }

    /// Background reconciler (§4.5): every tick, rules past their sync
    /// interval (urgent at `urgent_interval`, else `normal_interval`) are
    /// re-aggregated from billing history and the cached value overwritten.
    /// Best-effort: a failed aggregation is retried next tick.
    pub fn spawn_reconciler(
        self: Arc<Self>,
        aggregator: Arc<dyn SpendingAggregator>,
        tick: std::time::Duration,
        urgent_interval: std::time::Duration,
        normal_interval: std::time::Duration,
    ) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                self.reconcile_once(&*aggregator, urgent_interval, normal_interval)
                    .await;
            }
        });
    }

    async fn reconcile_once(
        &self,
        aggregator: &dyn SpendingAggregator,
        urgent_interval: std::time::Duration,
        normal_interval: std::time::Duration,
    ) {
        let now = OffsetDateTime::now_utc();
        let ids: Vec<UpstreamId> = self.by_upstream.read().await.keys().copied().collect();
        for upstream_id in ids {
            let due_keys: Vec<String> = {
                let guard = self.by_upstream.read().await;
                let Some(cell) = guard.get(&upstream_id) else {
                    continue;
                };
                let quota = cell.lock().expect("quota mutex poisoned");
                quota
                    .rules
                    .iter()
                    .filter(|(_, entry)| {
                        let urgent = entry.percent_used() >= self.urgent_threshold_percent;
                        let interval = if urgent {
                            urgent_interval
                        } else {
                            normal_interval
                        };
                        entry
                            .last_synced_at
                            .map(|synced| {
                                (now - synced)
                                    >= time::Duration::try_from(interval)
                                        .unwrap_or(time::Duration::ZERO)
                            })
                            .unwrap_or(true)
                    })
                    .map(|(key, _)| key.clone())
                    .collect()
            };

            for rule_key in due_keys {
                let since = Self::period_start(&rule_key, now);
                match aggregator.sum_spending_since(upstream_id, since).await {
                    Ok(total) => {
                        let guard = self.by_upstream.read().await;
                        if let Some(cell) = guard.get(&upstream_id) {
                            let mut quota = cell.lock().expect("quota mutex poisoned");
                            if let Some(entry) = quota.rules.get_mut(&rule_key) {
                                entry.current_spending = total;
                                entry.last_synced_at = Some(now);
                            }
                        }
                    }
                    Err(err) => {
                        tracing::debug!(
                            event = "quota_reconcile_failed",
                            upstream_id,
                            rule = %rule_key,
                            error = %err,
                            "quota reconciliation failed, retrying next tick"
                        );
                    }
                }
            }
        }
    }

    /// `estimatedRecoveryAt` for a rolling-window rule (§4.5): scans oldest
    /// hour-slices forward until enough cost has slid out of the window to
    /// clear the overshoot.
    pub async fn estimated_recovery_at(
        &self,
        upstream_id: UpstreamId,
        period_hours: u32,
        aggregator: &dyn SpendingAggregator,
    ) -> anyhow::Result<Option<OffsetDateTime>> {
        let now = OffsetDateTime::now_utc();
        let rule_key = format!("rolling:{period_hours}");
        let overshoot = {
            let guard = self.by_upstream.read().await;
            let Some(cell) = guard.get(&upstream_id) else {
                return Ok(None);
            };
            let quota = cell.lock().expect("quota mutex poisoned");
            let Some(entry) = quota.rules.get(&rule_key) else {
                return Ok(None);
            };
            entry.current_spending - entry.limit
        };
        if overshoot <= 0.0 {
            return Ok(None);
        }

        let since = now - time::Duration::hours(period_hours as i64);
        let slices = aggregator.hourly_slices_since(upstream_id, since).await?;
        let mut cumulative = 0.0;
        for (slice_end, cost) in slices {
            cumulative += cost;
            if cumulative >= overshoot {
                return Ok(Some(slice_end + time::Duration::hours(period_hours as i64)));
            }
        }
        Ok(None)
    }
}
