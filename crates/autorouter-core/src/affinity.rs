//! C6 — Session Affinity Store (§4.6). Sharded concurrent map grounded in
//! the teacher's `CredentialPool`-style `RwLock<HashMap<...>>` state maps;
//! the background sweeper mirrors the same recover-task idiom as the
//! circuit breaker's deadline queue, but on a fixed tick instead of a
//! deadline heap since expiry here is sliding (recomputed per access) rather
//! than scheduled once.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::RwLock;

use autorouter_protocol::RouteCapability;

use crate::data::UpstreamId;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AffinityKey {
    pub api_key_id: i64,
    pub capability: RouteCapability,
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct AffinityEntry {
    pub upstream_id: UpstreamId,
    pub created_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
    pub content_length: u64,
    pub cumulative_tokens: u64,
}

fn shard_index(key: &AffinityKey) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

pub struct AffinityStore {
    shards: Vec<RwLock<HashMap<AffinityKey, AffinityEntry>>>,
    sliding_ttl: Duration,
    max_ttl: Duration,
}

impl AffinityStore {
    pub fn new(sliding_ttl: Duration, max_ttl: Duration) -> Self {
        let mut shards = Vec::with_capacity(SHARD_COUNT);
        for _ in 0..SHARD_COUNT {
            shards.push(RwLock::new(HashMap::new()));
        }
        Self {
            shards,
            sliding_ttl,
            max_ttl,
        }
    }

    fn is_expired(&self, entry: &AffinityEntry, now: OffsetDateTime) -> bool {
        let since_access = now - entry.last_accessed_at;
        let since_create = now - entry.created_at;
        since_access > self.sliding_ttl || since_create > self.max_ttl
    }

    /// `get(key)`: returns the entry if not expired, refreshing its sliding
    /// window (§4.6).
    pub async fn get(&self, key: &AffinityKey, now: OffsetDateTime) -> Option<AffinityEntry> {
        let shard = &self.shards[shard_index(key)];
        let mut guard = shard.write().await;
        let expired = match guard.get(key) {
            Some(entry) => self.is_expired(entry, now),
            None => return None,
        };
        if expired {
            guard.remove(key);
            return None;
        }
        let entry = guard.get_mut(key).expect("checked above");
        entry.last_accessed_at = now;
        Some(entry.clone())
    }

    /// `set(key, upstreamId, contentLength)`: preserves `cumulativeTokens`
    /// from an existing entry; resets `createdAt` only on insert (§4.6).
    pub async fn set(
        &self,
        key: AffinityKey,
        upstream_id: UpstreamId,
        content_length: u64,
        now: OffsetDateTime,
    ) {
        let shard = &self.shards[shard_index(&key)];
        let mut guard = shard.write().await;
        match guard.get_mut(&key) {
            Some(entry) => {
                entry.upstream_id = upstream_id;
                entry.content_length = content_length;
                entry.last_accessed_at = now;
            }
            None => {
                guard.insert(
                    key,
                    AffinityEntry {
                        upstream_id,
                        created_at: now,
                        last_accessed_at: now,
                        content_length,
                        cumulative_tokens: 0,
                    },
                );
            }
        }
    }

    pub async fn update_cumulative_tokens(&self, key: &AffinityKey, delta: u64, now: OffsetDateTime) {
        let shard = &self.shards[shard_index(key)];
        let mut guard = shard.write().await;
        if let Some(entry) = guard.get_mut(key) {
            entry.cumulative_tokens += delta;
            entry.last_accessed_at = now;
        }
    }

    pub async fn delete(&self, key: &AffinityKey) {
        let shard = &self.shards[shard_index(key)];
        shard.write().await.remove(key);
    }

    /// Total live entries across all shards. Exposed for operational
    /// introspection (and so the sweeper's reclamation can be observed
    /// independently of `get`'s own lazy-expiry check).
    pub async fn len(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().await.len();
        }
        total
    }

    async fn sweep_once(&self, now: OffsetDateTime) {
        for shard in &self.shards {
            let mut guard = shard.write().await;
            guard.retain(|_, entry| !self.is_expired(entry, now));
        }
    }

    /// Background sweeper removing entries past TTL (§4.6). Ticks every
    /// `tick` (the caller picks a cadence shorter than `sliding_ttl`).
    pub fn spawn_sweeper(self: Arc<Self>, tick: Duration) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                self.sweep_once(now_utc()).await;
            }
        });
    }
}

fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationCandidate {
    pub upstream_id: UpstreamId,
    pub priority: i32,
    pub migration_enabled: bool,
    pub metric_is_tokens: bool,
    pub threshold: u64,
}

/// `shouldMigrate(current, candidates, contentLength, cumulativeTokens) ->
/// upstream | null` (§4.6). A pure function of its inputs (§8 round-trip
/// law), intentionally independent of the store so it's trivially testable.
pub fn should_migrate(
    current_priority: i32,
    mut candidates: Vec<MigrationCandidate>,
    content_length: u64,
    cumulative_tokens: u64,
) -> Option<UpstreamId> {
    candidates.retain(|c| c.priority < current_priority);
    candidates.sort_by_key(|c| c.priority);

    for candidate in candidates {
        if !candidate.migration_enabled {
            continue;
        }
        let accepted = if candidate.metric_is_tokens {
            cumulative_tokens < candidate.threshold
        } else {
            content_length < candidate.threshold
        };
        if accepted {
            return Some(candidate.upstream_id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn key() -> AffinityKey {
        AffinityKey {
            api_key_id: 1,
            capability: RouteCapability::AnthropicMessages,
            session_id: "sess-a".to_string(),
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let store = AffinityStore::new(Duration::from_secs(300), Duration::from_secs(1800));
        let now = datetime!(2026-01-01 00:00:00 UTC);
        store.set(key(), 7, 2048, now).await;
        let entry = store.get(&key(), now).await.unwrap();
        assert_eq!(entry.upstream_id, 7);
        assert_eq!(entry.cumulative_tokens, 0);
    }

    #[tokio::test]
    async fn set_preserves_cumulative_tokens_across_upstream_change() {
        let store = AffinityStore::new(Duration::from_secs(300), Duration::from_secs(1800));
        let now = datetime!(2026-01-01 00:00:00 UTC);
        store.set(key(), 7, 2048, now).await;
        store.update_cumulative_tokens(&key(), 30_000, now).await;
        store.set(key(), 9, 4096, now).await;
        let entry = store.get(&key(), now).await.unwrap();
        assert_eq!(entry.upstream_id, 9);
        assert_eq!(entry.cumulative_tokens, 30_000);
    }

    #[tokio::test]
    async fn sliding_ttl_expires_entry_after_inactivity() {
        let store = AffinityStore::new(Duration::from_secs(300), Duration::from_secs(1800));
        let now = datetime!(2026-01-01 00:00:00 UTC);
        store.set(key(), 7, 2048, now).await;
        let later = now + time::Duration::seconds(301);
        assert!(store.get(&key(), later).await.is_none());
    }

    #[tokio::test]
    async fn absolute_max_ttl_expires_entry_even_if_recently_accessed() {
        let store = AffinityStore::new(Duration::from_secs(300), Duration::from_secs(1800));
        let now = datetime!(2026-01-01 00:00:00 UTC);
        store.set(key(), 7, 2048, now).await;
        let mut t = now;
        for _ in 0..10 {
            t += time::Duration::seconds(200);
            let _ = store.get(&key(), t).await;
        }
        // 10*200s = 2000s > 1800s max_ttl from creation.
        assert!(store.get(&key(), t).await.is_none());
    }

    #[test]
    fn migration_prefers_first_accepting_candidate_by_priority() {
        let candidates = vec![
            MigrationCandidate {
                upstream_id: 2,
                priority: 0,
                migration_enabled: true,
                metric_is_tokens: true,
                threshold: 50_000,
            },
            MigrationCandidate {
                upstream_id: 3,
                priority: -1,
                migration_enabled: false,
                metric_is_tokens: true,
                threshold: 10,
            },
        ];
        let result = should_migrate(1, candidates, 2048, 30_000);
        assert_eq!(result, Some(2));
    }

    #[test]
    fn migration_skips_candidates_with_equal_or_higher_priority() {
        let candidates = vec![MigrationCandidate {
            upstream_id: 2,
            priority: 1,
            migration_enabled: true,
            metric_is_tokens: true,
            threshold: 50_000,
        }];
        assert_eq!(should_migrate(1, candidates, 0, 0), None);
    }

    #[test]
    fn migration_returns_none_when_threshold_not_met() {
        let candidates = vec![MigrationCandidate {
            upstream_id: 2,
            priority: 0,
            migration_enabled: true,
            metric_is_tokens: false,
            threshold: 1024,
        }];
        assert_eq!(should_migrate(1, candidates, 2048, 0), None);
    }
}
