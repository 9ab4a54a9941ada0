//! Integration test for the background sweeper (§4.6), grounded in the
//! teacher's `gproxy-provider-core/tests/credential_pool.rs` style: a real
//! tokio runtime, real wall-clock sleeps, no mocked time.

use std::sync::Arc;
use std::time::Duration;

use autorouter_core::affinity::{AffinityKey, AffinityStore};
use autorouter_protocol::RouteCapability;
use time::OffsetDateTime;
use tokio::time::sleep;

fn key(session_id: &str) -> AffinityKey {
    AffinityKey {
        api_key_id: 1,
        capability: RouteCapability::AnthropicMessages,
        session_id: session_id.to_string(),
    }
}

#[tokio::test]
async fn sweeper_reclaims_entries_past_sliding_ttl_without_being_accessed() {
    let store = Arc::new(AffinityStore::new(
        Duration::from_millis(50),
        Duration::from_secs(30),
    ));
    store
        .set(key("sess-a"), 1, 1024, OffsetDateTime::now_utc())
        .await;
    store
        .set(key("sess-b"), 2, 1024, OffsetDateTime::now_utc())
        .await;
    assert_eq!(store.len().await, 2);

    store.clone().spawn_sweeper(Duration::from_millis(20));

    // Neither entry is ever re-accessed via `get`; only the background
    // sweeper's own ticks can reclaim them.
    sleep(Duration::from_millis(250)).await;

    assert_eq!(store.len().await, 0);
}

#[tokio::test]
async fn sweeper_leaves_freshly_touched_entries_alone() {
    let store = Arc::new(AffinityStore::new(
        Duration::from_millis(200),
        Duration::from_secs(30),
    ));
    store
        .set(key("sess-live"), 1, 1024, OffsetDateTime::now_utc())
        .await;
    store.clone().spawn_sweeper(Duration::from_millis(20));

    sleep(Duration::from_millis(80)).await;
    assert_eq!(
        store.len().await,
        1,
        "entry well within its sliding TTL must survive a sweep tick"
    );
}
