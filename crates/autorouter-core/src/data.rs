//! In-memory domain model (spec §3), decoded once per registry reload from
//! the `autorouter-storage` row shapes rather than re-parsed per request.

use std::collections::{HashMap, HashSet};

use autorouter_protocol::RouteCapability;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

pub type UpstreamId = i64;
pub type ApiKeyId = i64;

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: ApiKeyId,
    pub key_hash: String,
    pub key_prefix: String,
    pub name: String,
    pub is_active: bool,
    pub expires_at: Option<OffsetDateTime>,
    pub allowed_upstream_ids: HashSet<UpstreamId>,
}

impl ApiKey {
    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|exp| exp < now)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    Anthropic,
    Openai,
    Google,
    Custom,
}

impl ProviderType {
    pub fn parse(value: &str) -> Self {
        match value {
            "anthropic" => ProviderType::Anthropic,
            "openai" => ProviderType::Openai,
            "google" => ProviderType::Google,
            _ => ProviderType::Custom,
        }
    }
}

/// `SpendingRule` (§3). `period_hours` is only meaningful for `Rolling`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "period_type")]
pub enum SpendingRule {
    Daily { limit: f64 },
    Monthly { limit: f64 },
    Rolling { period_hours: u32, limit: f64 },
}

impl SpendingRule {
    pub fn limit(&self) -> f64 {
        match self {
            SpendingRule::Daily { limit }
            | SpendingRule::Monthly { limit }
            | SpendingRule::Rolling { limit, .. } => *limit,
        }
    }

    /// `ruleKey` from §4.5: `"daily"|"monthly"|"rolling:<hours>"`.
    pub fn rule_key(&self) -> String {
        match self {
            SpendingRule::Daily { .. } => "daily".to_string(),
            SpendingRule::Monthly { .. } => "monthly".to_string(),
            SpendingRule::Rolling { period_hours, .. } => format!("rolling:{period_hours}"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_ms: u64,
    pub probe_interval_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffinityMigrationMetric {
    Tokens,
    Length,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AffinityMigrationConfig {
    #[serde(default)]
    pub enabled: bool,
    pub metric: AffinityMigrationMetric,
    pub threshold: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BillingMultipliers {
    #[serde(default = "one")]
    pub input_multiplier: f64,
    #[serde(default = "one")]
    pub output_multiplier: f64,
}

fn one() -> f64 {
    1.0
}

/// `Upstream` (§3). `api_key_encrypted` is only decrypted at forward time
/// (§9 design notes / §4.9).
#[derive(Debug, Clone)]
pub struct Upstream {
    pub id: UpstreamId,
    pub name: String,
    pub provider_type: ProviderType,
    pub base_url: String,
    pub api_key_encrypted: Vec<u8>,
    pub timeout_ms: u64,
    pub is_active: bool,
    pub weight: u32,
    pub priority: i32,
    pub route_capabilities: HashSet<RouteCapability>,
    pub allowed_models: Option<HashSet<String>>,
    pub model_redirects: HashMap<String, String>,
    pub circuit_breaker_config: CircuitBreakerConfig,
    pub affinity_migration_config: Option<AffinityMigrationConfig>,
    pub billing_multipliers: BillingMultipliers,
    pub spending_rules: Vec<SpendingRule>,
}

impl Upstream {
    pub fn supports(&self, capability: RouteCapability) -> bool {
        // Open question resolved in DESIGN.md: empty route_capabilities
        // matches nothing, never "all" (explicit-only per spec §4.7 point 3).
        self.route_capabilities.contains(&capability)
    }

    pub fn redirect_for(&self, model: &str) -> Option<&str> {
        self.model_redirects.get(model).map(String::as_str)
    }
}
