//! Converts `autorouter_storage::StorageSnapshot` rows into the in-memory
//! domain model (§6.4 "On startup the engine warms C2/C5/C6 from these").
//! Everything here runs once per registry reload, never per-request.

use std::collections::{HashMap, HashSet};

use autorouter_protocol::RouteCapability;
use autorouter_storage::entities::{api_keys, compensation_rules, upstreams};
use autorouter_storage::StorageSnapshot;

use crate::billing::ModelPrice;
use crate::data::{
    AffinityMigrationConfig, ApiKey, BillingMultipliers, CircuitBreakerConfig, ProviderType,
    SpendingRule, Upstream,
};
use crate::headers::{CompensationMode, CompensationRule};
use crate::registry::RegistrySnapshot;

/// Deserializes one `upstreams` row, including its JSON columns, into the
/// engine's `Upstream`. An upstream whose JSON columns don't parse is
/// dropped rather than poisoning the whole registry reload; the caller logs
/// this per `upstream_id`.
fn convert_upstream(row: upstreams::Model) -> anyhow::Result<Upstream> {
    let route_capabilities: HashSet<RouteCapability> =
        serde_json::from_value(row.route_capabilities)?;
    let allowed_models: Option<HashSet<String>> = row
        .allowed_models
        .map(serde_json::from_value)
        .transpose()?;
    let model_redirects: HashMap<String, String> = row
        .model_redirects
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();
    let circuit_breaker_config: CircuitBreakerConfig =
        serde_json::from_value(row.circuit_breaker_config)?;
    let affinity_migration_config: Option<AffinityMigrationConfig> = row
        .affinity_migration_config
        .map(serde_json::from_value)
        .transpose()?;
    let billing_multipliers: BillingMultipliers = serde_json::from_value(row.billing_multipliers)?;
    let spending_rules: Vec<SpendingRule> = serde_json::from_value(row.spending_rules)?;

    Ok(Upstream {
        id: row.id,
        name: row.name,
        provider_type: ProviderType::parse(&row.provider_type),
        base_url: row.base_url,
        api_key_encrypted: row.api_key_encrypted,
        timeout_ms: row.timeout_ms.max(0) as u64,
        is_active: row.is_active,
        weight: row.weight.max(0) as u32,
        priority: row.priority,
        route_capabilities,
        allowed_models,
        model_redirects,
        circuit_breaker_config,
        affinity_migration_config,
        billing_multipliers,
        spending_rules,
    })
}

fn convert_api_key(row: api_keys::Model, allowed_upstream_ids: HashSet<i64>) -> ApiKey {
    ApiKey {
        id: row.id,
        key_hash: row.key_hash,
        key_prefix: row.key_prefix,
        name: row.name,
        is_active: row.is_active,
        expires_at: row.expires_at,
        allowed_upstream_ids,
    }
}

fn convert_compensation_mode(mode: &str) -> CompensationMode {
    match mode {
        "always" => CompensationMode::Always,
        _ => CompensationMode::MissingOnly,
    }
}

fn convert_compensation_rule(row: compensation_rules::Model) -> anyhow::Result<CompensationRule> {
    let capabilities: Vec<RouteCapability> = serde_json::from_value(row.capabilities)?;
    let sources: Vec<String> = serde_json::from_value(row.sources)?;
    Ok(CompensationRule {
        capabilities,
        target_header: row.target_header,
        sources,
        mode: convert_compensation_mode(&row.mode),
    })
}

/// Builds the C2 registry snapshot from storage rows. Upstreams with
/// unparseable JSON columns are skipped (logged by the caller); everything
/// else is an infallible conversion.
pub fn build_registry_snapshot(
    snapshot: &StorageSnapshot,
) -> (RegistrySnapshot, Vec<(i64, anyhow::Error)>) {
    let mut upstreams = Vec::with_capacity(snapshot.upstreams.len());
    let mut skipped = Vec::new();
    for row in snapshot.upstreams.clone() {
        let id = row.id;
        match convert_upstream(row) {
            Ok(upstream) => upstreams.push(upstream),
            Err(err) => skipped.push((id, err)),
        }
    }

    let api_keys = snapshot
        .api_keys
        .iter()
        .cloned()
        .map(|row| {
            let allowed = snapshot
                .allowed_upstream_ids(row.id)
                .into_iter()
                .collect::<HashSet<_>>();
            convert_api_key(row, allowed)
        })
        .collect();

    (RegistrySnapshot::build(upstreams, api_keys), skipped)
}

/// Builds the compensation rule list consumed by C9. A rule whose JSON
/// columns don't parse is dropped and reported to the caller.
pub fn build_compensation_rules(
    snapshot: &StorageSnapshot,
) -> (Vec<CompensationRule>, Vec<(i64, anyhow::Error)>) {
    let mut rules = Vec::with_capacity(snapshot.compensation_rules.len());
    let mut skipped = Vec::new();
    for row in snapshot.compensation_rules.clone() {
        let id = row.id;
        match convert_compensation_rule(row) {
            Ok(rule) => rules.push(rule),
            Err(err) => skipped.push((id, err)),
        }
    }
    (rules, skipped)
}

/// Builds the `price_for_model` lookup used by `DispatchContext` (§4.12 step
/// 2: manual override wins over synced price). Both tables are small and
/// reloaded wholesale on each registry refresh, so this closure owns plain
/// `HashMap`s rather than borrowing the snapshot.
pub fn build_price_lookup(
    snapshot: &StorageSnapshot,
) -> Box<dyn Fn(&str) -> Option<ModelPrice> + Send + Sync> {
    let manual: HashMap<String, ModelPrice> = snapshot
        .billing_manual_price_overrides
        .iter()
        .map(|row| {
            (
                row.model.clone(),
                ModelPrice {
                    input_price_per_million: row.input_price_per_million,
                    output_price_per_million: row.output_price_per_million,
                    cache_read_price_per_million: row.cache_read_price_per_million,
                    cache_write_price_per_million: row.cache_write_price_per_million,
                },
            )
        })
        .collect();

    let synced: HashMap<String, ModelPrice> = snapshot
        .billing_model_prices
        .iter()
        .map(|row| {
            (
                row.model.clone(),
                ModelPrice {
                    input_price_per_million: row.input_price_per_million,
                    output_price_per_million: row.output_price_per_million,
                    cache_read_price_per_million: row.cache_read_price_per_million,
                    cache_write_price_per_million: row.cache_write_price_per_million,
                },
            )
        })
        .collect();

    Box::new(move |model: &str| {
        crate::billing::resolve_price(crate::billing::PriceResolution {
            manual_override: manual.get(model),
            synced_price: synced.get(model),
        })
        .copied()
    })
}

/// Builds the `decrypt_secret` closure bound to the process `encryption_key`
/// (§6.5, §9 design notes). The key never leaves this closure's capture.
pub fn build_decrypt_secret(
    encryption_key: String,
) -> Box<dyn Fn(&[u8]) -> anyhow::Result<String> + Send + Sync> {
    Box::new(move |stored: &[u8]| {
        autorouter_common::crypto::decrypt(&encryption_key, stored).map_err(anyhow::Error::from)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use autorouter_storage::entities::{billing_manual_price_overrides, billing_model_prices};
    use time::OffsetDateTime;

    fn upstream_row(id: i64, caps: serde_json::Value) -> upstreams::Model {
        upstreams::Model {
            id,
            name: format!("u{id}"),
            provider_type: "anthropic".to_string(),
            base_url: "https://example.invalid".to_string(),
            api_key_encrypted: vec![],
            timeout_ms: 30_000,
            is_active: true,
            weight: 1,
            priority: 0,
            route_capabilities: caps,
            allowed_models: None,
            model_redirects: None,
            circuit_breaker_config: serde_json::json!({
                "failure_threshold": 5,
                "success_threshold": 2,
                "open_duration_ms": 30000,
                "probe_interval_ms": 5000
            }),
            affinity_migration_config: None,
            billing_multipliers: serde_json::json!({}),
            spending_rules: serde_json::json!([]),
        }
    }

    #[test]
    fn converts_valid_upstream_row() {
        let row = upstream_row(1, serde_json::json!(["anthropic_messages"]));
        let upstream = convert_upstream(row).unwrap();
        assert!(upstream.supports(RouteCapability::AnthropicMessages));
        assert_eq!(upstream.billing_multipliers.input_multiplier, 1.0);
    }

    #[test]
    fn skips_upstream_with_malformed_json_column() {
        let row = upstream_row(1, serde_json::json!("not-an-array"));
        assert!(convert_upstream(row).is_err());
    }

    #[test]
    fn build_registry_snapshot_skips_bad_rows_but_keeps_good_ones() {
        let good = upstream_row(1, serde_json::json!(["anthropic_messages"]));
        let bad = upstream_row(2, serde_json::json!("garbage"));
        let snapshot = StorageSnapshot {
            upstreams: vec![good, bad],
            ..Default::default()
        };
        let (registry, skipped) = build_registry_snapshot(&snapshot);
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].0, 2);
        assert!(registry.upstream(1).is_some());
        assert!(registry.upstream(2).is_none());
    }

    #[test]
    fn manual_override_wins_in_price_lookup() {
        let snapshot = StorageSnapshot {
            billing_model_prices: vec![billing_model_prices::Model {
                id: 1,
                model: "gpt-4o".to_string(),
                input_price_per_million: 5.0,
                output_price_per_million: 15.0,
                cache_read_price_per_million: None,
                cache_write_price_per_million: None,
                synced_at: OffsetDateTime::UNIX_EPOCH,
            }],
            billing_manual_price_overrides: vec![billing_manual_price_overrides::Model {
                model: "gpt-4o".to_string(),
                input_price_per_million: 1.0,
                output_price_per_million: 2.0,
                cache_read_price_per_million: None,
                cache_write_price_per_million: None,
            }],
            ..Default::default()
        };
        let lookup = build_price_lookup(&snapshot);
        assert_eq!(lookup("gpt-4o").unwrap().input_price_per_million, 1.0);
        assert!(lookup("unknown-model").is_none());
    }

    #[test]
    fn decrypt_secret_round_trips_through_closure() {
        let stored = autorouter_common::crypto::encrypt("k", "sk-upstream");
        let decrypt = build_decrypt_secret("k".to_string());
        assert_eq!(decrypt(&stored).unwrap(), "sk-upstream");
    }
}
