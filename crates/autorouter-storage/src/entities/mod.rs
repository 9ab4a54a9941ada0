pub mod api_keys;
pub mod api_key_upstreams;
pub mod billing_manual_price_overrides;
pub mod billing_model_prices;
pub mod billing_price_sync_history;
pub mod circuit_breaker_states;
pub mod compensation_rules;
pub mod global_config;
pub mod request_billing_snapshots;
pub mod request_logs;
pub mod upstream_health;
pub mod upstreams;

pub use api_keys::Entity as ApiKeys;
pub use api_key_upstreams::Entity as ApiKeyUpstreams;
pub use billing_manual_price_overrides::Entity as BillingManualPriceOverrides;
pub use billing_model_prices::Entity as BillingModelPrices;
pub use billing_price_sync_history::Entity as BillingPriceSyncHistory;
pub use circuit_breaker_states::Entity as CircuitBreakerStates;
pub use compensation_rules::Entity as CompensationRules;
pub use global_config::Entity as GlobalConfig;
pub use request_billing_snapshots::Entity as RequestBillingSnapshots;
pub use request_logs::Entity as RequestLogs;
pub use upstream_health::Entity as UpstreamHealth;
pub use upstreams::Entity as Upstreams;
