//! C2 — Upstream Registry: an immutable snapshot of upstream configs,
//! published atomically on admin reload (§4.2). Readers take one snapshot
//! reference per request; there are no per-request DB reads.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use autorouter_protocol::RouteCapability;

use crate::data::{ApiKey, ApiKeyId, Upstream, UpstreamId};

#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    pub upstreams: HashMap<UpstreamId, Arc<Upstream>>,
    pub by_capability: HashMap<RouteCapability, Vec<UpstreamId>>,
    pub api_keys_by_hash: HashMap<String, Arc<ApiKey>>,
    pub api_keys_by_id: HashMap<ApiKeyId, Arc<ApiKey>>,
}

impl RegistrySnapshot {
    pub fn build(upstreams: Vec<Upstream>, api_keys: Vec<ApiKey>) -> Self {
        let mut by_capability: HashMap<RouteCapability, Vec<UpstreamId>> = HashMap::new();
        let mut upstream_map = HashMap::new();
        for upstream in upstreams {
            let upstream = Arc::new(upstream);
            for capability in upstream.route_capabilities.iter().copied() {
                by_capability.entry(capability).or_default().push(upstream.id);
            }
            upstream_map.insert(upstream.id, upstream);
        }

        let mut api_keys_by_hash = HashMap::new();
        let mut api_keys_by_id = HashMap::new();
        for key in api_keys {
            let key = Arc::new(key);
            api_keys_by_hash.insert(key.key_hash.clone(), key.clone());
            api_keys_by_id.insert(key.id, key);
        }

        Self {
            upstreams: upstream_map,
            by_capability,
            api_keys_by_hash,
            api_keys_by_id,
        }
    }

    pub fn upstream(&self, id: UpstreamId) -> Option<&Arc<Upstream>> {
        self.upstreams.get(&id)
    }

    pub fn candidates_for(&self, capability: RouteCapability) -> Vec<Arc<Upstream>> {
        self.by_capability
            .get(&capability)
            .into_iter()
            .flatten()
            .filter_map(|id| self.upstreams.get(id))
            .cloned()
            .collect()
    }
}

/// Copy-on-write holder, grounded in `AppState.snapshot: ArcSwap<...>`
/// (load -> clone -> mutate -> store).
pub struct UpstreamRegistry {
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl UpstreamRegistry {
    pub fn new(snapshot: RegistrySnapshot) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(snapshot),
        }
    }

    pub fn load(&self) -> Arc<RegistrySnapshot> {
        self.snapshot.load_full()
    }

    pub fn replace(&self, snapshot: RegistrySnapshot) {
        self.snapshot.store(Arc::new(snapshot));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BillingMultipliers, CircuitBreakerConfig, ProviderType};
    use std::collections::{HashMap as Map, HashSet};

    fn upstream(id: UpstreamId, caps: &[RouteCapability]) -> Upstream {
        Upstream {
            id,
            name: format!("u{id}"),
            provider_type: ProviderType::Anthropic,
            base_url: "https://example.invalid".to_string(),
            api_key_encrypted: vec![],
            timeout_ms: 30_000,
            is_active: true,
            weight: 1,
            priority: 0,
            route_capabilities: caps.iter().copied().collect(),
            allowed_models: None,
            model_redirects: Map::new(),
            circuit_breaker_config: CircuitBreakerConfig::default(),
            affinity_migration_config: None,
            billing_multipliers: BillingMultipliers::default(),
            spending_rules: vec![],
        }
    }

    #[test]
    fn empty_route_capabilities_match_nothing() {
        let u = upstream(1, &[]);
        assert!(!u.supports(RouteCapability::AnthropicMessages));
        let snap = RegistrySnapshot::build(vec![u], vec![]);
        assert!(snap.candidates_for(RouteCapability::AnthropicMessages).is_empty());
    }

    #[test]
    fn candidates_for_indexes_by_capability() {
        let u1 = upstream(1, &[RouteCapability::AnthropicMessages]);
        let u2 = upstream(2, &[RouteCapability::AnthropicMessages, RouteCapability::OpenaiExtended]);
        let snap = RegistrySnapshot::build(vec![u1, u2], vec![]);
        let mut ids: Vec<_> = snap
            .candidates_for(RouteCapability::AnthropicMessages)
            .iter()
            .map(|u| u.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(snap.candidates_for(RouteCapability::GeminiNativeGenerate).len(), 0);
        let _ = HashSet::<UpstreamId>::new();
    }
}
