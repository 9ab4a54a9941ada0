//! Process-wide root struct (§9 "Global mutable state... maps to a single
//! process-wide root struct passed by reference into each task"), grounded
//! in the teacher's `AppState`.

use std::sync::Arc;
use std::time::Duration;

use autorouter_common::GlobalConfig;

use crate::affinity::AffinityStore;
use crate::circuit::CircuitBreakerRegistry;
use crate::health::HealthTracker;
use crate::quota::QuotaTracker;
use crate::registry::UpstreamRegistry;
use crate::selector::{InFlightCounters, RoundRobinState};

pub struct AppState {
    pub config: GlobalConfig,
    pub registry: UpstreamRegistry,
    pub circuit: CircuitBreakerRegistry,
    pub health: HealthTracker,
    pub quota: Arc<QuotaTracker>,
    pub affinity: Arc<AffinityStore>,
    pub round_robin: RoundRobinState,
    pub in_flight: InFlightCounters,
    pub client: wreq::Client,
}

impl AppState {
    pub fn new(config: GlobalConfig, registry: UpstreamRegistry, client: wreq::Client) -> Self {
        let affinity = Arc::new(AffinityStore::new(
            Duration::from_millis(config.affinity_sliding_ttl_ms),
            Duration::from_millis(config.affinity_max_ttl_ms),
        ));
        let quota = Arc::new(QuotaTracker::new(config.quota_urgent_threshold_percent));
        Self {
            config,
            registry,
            circuit: CircuitBreakerRegistry::new(),
            health: HealthTracker::new(),
            quota,
            affinity,
            round_robin: RoundRobinState::new(),
            in_flight: InFlightCounters::new(),
            client,
        }
    }

    /// Spawns the background sweeper/reconciler tasks (§4.5, §4.6). Called
    /// once at bootstrap after `AppState` is behind an `Arc`.
    pub fn spawn_background_tasks(self: &Arc<Self>, aggregator: Arc<dyn crate::quota::SpendingAggregator>) {
        self.affinity.clone().spawn_sweeper(Duration::from_secs(60));
        self.quota.clone().spawn_reconciler(
            aggregator,
            Duration::from_secs(60),
            Duration::from_millis(self.config.quota_urgent_sync_interval_ms),
            Duration::from_millis(self.config.quota_normal_sync_interval_ms),
        );
    }
}
