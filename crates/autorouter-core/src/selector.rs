//! C8 — Selector (§4.8). Operates on the lowest non-empty priority group of
//! the candidate list; the failover loop in C11 removes exhausted members
//! and re-enters here. Round-robin state is grounded in the teacher's
//! atomic-counter-per-bucket pattern; weighted pick reuses a stable hash of
//! the request id rather than true RNG so a stubbed id is reproducible (§8 S1).

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::data::{Upstream, UpstreamId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionStrategy {
    Weighted,
    RoundRobin,
    LeastConnections,
}

/// Per-upstream in-flight counters, published by C10 (§5 "C10 in-flight
/// counter — atomic integer per upstream id").
#[derive(Default)]
pub struct InFlightCounters {
    counts: std::sync::RwLock<HashMap<UpstreamId, Arc<AtomicU64>>>,
}

impl InFlightCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, upstream_id: UpstreamId) -> Arc<AtomicU64> {
        if let Some(c) = self.counts.read().expect("in-flight lock poisoned").get(&upstream_id) {
            return c.clone();
        }
        let mut guard = self.counts.write().expect("in-flight lock poisoned");
        guard
            .entry(upstream_id)
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone()
    }

    pub fn enter(&self, upstream_id: UpstreamId) {
        self.counter(upstream_id).fetch_add(1, Ordering::SeqCst);
    }

    pub fn exit(&self, upstream_id: UpstreamId) {
        self.counter(upstream_id).fetch_sub(1, Ordering::SeqCst);
    }

    pub fn current(&self, upstream_id: UpstreamId) -> u64 {
        self.counter(upstream_id).load(Ordering::SeqCst)
    }
}

/// Rotating index keyed by `(priority, stable hash of the candidate-id
/// set)`, so a changing candidate set (post-exclusion) doesn't share state
/// with a prior round (§4.8, §5).
#[derive(Default)]
pub struct RoundRobinState {
    indices: std::sync::Mutex<HashMap<(i32, u64), usize>>,
}

impl RoundRobinState {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_index(&self, priority: i32, set_hash: u64, len: usize) -> usize {
        let mut guard = self.indices.lock().expect("round robin lock poisoned");
        let entry = guard.entry((priority, set_hash)).or_insert(0);
        let current = *entry % len;
        *entry = (*entry + 1) % len;
        current
    }
}

fn candidate_set_hash(candidates: &[Arc<Upstream>]) -> u64 {
    let mut ids: Vec<UpstreamId> = candidates.iter().map(|u| u.id).collect();
    ids.sort();
    let mut hasher = DefaultHasher::new();
    ids.hash(&mut hasher);
    hasher.finish()
}

fn stable_hash(request_id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    request_id.hash(&mut hasher);
    hasher.finish()
}

/// `select(candidates, strategy, requestId) -> upstream` (§4.8). Groups by
/// lowest `priority`; selection happens only within that group.
pub fn select(
    candidates: &[Arc<Upstream>],
    strategy: SelectionStrategy,
    request_id: &str,
    round_robin: &RoundRobinState,
    in_flight: &InFlightCounters,
) -> Option<Arc<Upstream>> {
    if candidates.is_empty() {
        return None;
    }
    let lowest_priority = candidates.iter().map(|u| u.priority).min()?;
    let mut group: Vec<Arc<Upstream>> = candidates
        .iter()
        .filter(|u| u.priority == lowest_priority)
        .cloned()
        .collect();
    group.sort_by_key(|u| u.id);

    match strategy {
        SelectionStrategy::Weighted => Some(select_weighted(&group, request_id)),
        SelectionStrategy::RoundRobin => {
            let set_hash = candidate_set_hash(&group);
            let idx = round_robin.next_index(lowest_priority, set_hash, group.len());
            Some(group[idx].clone())
        }
        SelectionStrategy::LeastConnections => {
            group
                .into_iter()
                .min_by_key(|u| (in_flight.current(u.id), u.id))
        }
    }
}

fn select_weighted(group: &[Arc<Upstream>], request_id: &str) -> Arc<Upstream> {
    let total_weight: u64 = group.iter().map(|u| u.weight as u64).sum();
    if total_weight == 0 {
        return group[0].clone();
    }
    let pick = stable_hash(request_id) % total_weight;
    let mut running = 0u64;
    for upstream in group {
        running += upstream.weight as u64;
        if pick < running {
            return upstream.clone();
        }
    }
    group.last().expect("group is non-empty").clone()
}
