use crate::entities::{
    api_key_upstreams, api_keys, billing_manual_price_overrides, billing_model_prices,
    compensation_rules, upstreams,
};
use autorouter_common::GlobalConfig;

#[derive(Debug, Clone)]
pub struct GlobalConfigRow {
    pub id: i64,
    pub config: GlobalConfig,
}

/// Everything the engine warms C2/C1/C6 from at boot (§6.4). Loaded once,
/// then held behind an `ArcSwap` by the caller; never read per-request.
#[derive(Debug, Clone, Default)]
pub struct StorageSnapshot {
    pub global_config: Option<GlobalConfigRow>,
    pub api_keys: Vec<api_keys::Model>,
    pub api_key_upstreams: Vec<api_key_upstreams::Model>,
    pub upstreams: Vec<upstreams::Model>,
    pub billing_model_prices: Vec<billing_model_prices::Model>,
    pub billing_manual_price_overrides: Vec<billing_manual_price_overrides::Model>,
    pub compensation_rules: Vec<compensation_rules::Model>,
}

impl StorageSnapshot {
    /// `allowedUpstreamIds` for a given key id, derived from the join table.
    pub fn allowed_upstream_ids(&self, api_key_id: i64) -> Vec<i64> {
        self.api_key_upstreams
            .iter()
            .filter(|row| row.api_key_id == api_key_id)
            .map(|row| row.upstream_id)
            .collect()
    }
}
