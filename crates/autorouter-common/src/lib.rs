pub mod crypto;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Failover continuation policy (§4.11 config).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverStrategy {
    ExhaustAll,
    MaxAttempts,
}

/// C8 selection strategy applied once C7 has filtered the candidate set
/// down to the lowest-priority group (§4.8). Not named by a spec §6.5 key,
/// so this is a process-wide choice rather than per-upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorStrategy {
    Weighted,
    RoundRobin,
    LeastConnections,
}

impl Default for SelectorStrategy {
    fn default() -> Self {
        Self::Weighted
    }
}

/// Default circuit-breaker thresholds (§3 `CircuitBreakerState.config`), used
/// when an upstream doesn't carry its own `circuitBreakerConfig`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CircuitDefaults {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub open_duration_ms: u64,
    pub probe_interval_ms: u64,
}

impl Default for CircuitDefaults {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration_ms: 30_000,
            probe_interval_ms: 5_000,
        }
    }
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
/// Field set covers spec §6.5's recognized configuration keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
    /// Symmetric key used to decrypt `upstreams.api_key_encrypted` at
    /// forward time. Never logged.
    pub encryption_key: String,
    /// Per-chunk read deadline on the downstream side of the stream loop.
    pub downstream_read_timeout_ms: u64,
    /// Per-chunk read deadline on the upstream side of the stream loop
    /// (§5 "Timeouts": default 60s).
    pub upstream_read_timeout_ms: u64,
    pub failover_strategy: FailoverStrategy,
    pub failover_max_attempts: Option<u32>,
    pub failover_exclude_status_codes: Vec<u16>,
    /// C8 pick strategy over the filtered candidate set (default weighted).
    pub selector_strategy: SelectorStrategy,
    /// Sliding TTL for session affinity entries (default 5 min).
    pub affinity_sliding_ttl_ms: u64,
    /// Absolute max TTL for session affinity entries (default 30 min).
    pub affinity_max_ttl_ms: u64,
    pub circuit_defaults: CircuitDefaults,
    pub quota_urgent_threshold_percent: f64,
    pub quota_urgent_sync_interval_ms: u64,
    pub quota_normal_sync_interval_ms: u64,
    /// Cap on the in-memory replay buffer used when a streamed request body
    /// must be re-sent to the next failover candidate (default 8 MiB).
    pub replay_buffer_max_bytes: usize,
    pub active_health_check_interval_ms: u64,
    pub active_health_check_enabled: bool,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub encryption_key: Option<String>,
    pub downstream_read_timeout_ms: Option<u64>,
    pub upstream_read_timeout_ms: Option<u64>,
    pub failover_strategy: Option<FailoverStrategy>,
    pub failover_max_attempts: Option<u32>,
    pub failover_exclude_status_codes: Option<Vec<u16>>,
    pub selector_strategy: Option<SelectorStrategy>,
    pub affinity_sliding_ttl_ms: Option<u64>,
    pub affinity_max_ttl_ms: Option<u64>,
    pub circuit_defaults: Option<CircuitDefaults>,
    pub quota_urgent_threshold_percent: Option<f64>,
    pub quota_urgent_sync_interval_ms: Option<u64>,
    pub quota_normal_sync_interval_ms: Option<u64>,
    pub replay_buffer_max_bytes: Option<usize>,
    pub active_health_check_interval_ms: Option<u64>,
    pub active_health_check_enabled: Option<bool>,
}

macro_rules! overlay_field {
    ($self:ident, $other:ident, $field:ident) => {
        if $other.$field.is_some() {
            $self.$field = $other.$field;
        }
    };
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        overlay_field!(self, other, host);
        overlay_field!(self, other, port);
        overlay_field!(self, other, admin_key_hash);
        overlay_field!(self, other, proxy);
        overlay_field!(self, other, dsn);
        overlay_field!(self, other, event_redact_sensitive);
        overlay_field!(self, other, encryption_key);
        overlay_field!(self, other, downstream_read_timeout_ms);
        overlay_field!(self, other, upstream_read_timeout_ms);
        overlay_field!(self, other, failover_strategy);
        overlay_field!(self, other, failover_max_attempts);
        overlay_field!(self, other, failover_exclude_status_codes);
        overlay_field!(self, other, selector_strategy);
        overlay_field!(self, other, affinity_sliding_ttl_ms);
        overlay_field!(self, other, affinity_max_ttl_ms);
        overlay_field!(self, other, circuit_defaults);
        overlay_field!(self, other, quota_urgent_threshold_percent);
        overlay_field!(self, other, quota_urgent_sync_interval_ms);
        overlay_field!(self, other, quota_normal_sync_interval_ms);
        overlay_field!(self, other, replay_buffer_max_bytes);
        overlay_field!(self, other, active_health_check_interval_ms);
        overlay_field!(self, other, active_health_check_enabled);
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            proxy: self.proxy,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            encryption_key: self
                .encryption_key
                .ok_or(GlobalConfigError::MissingField("encryption_key"))?,
            downstream_read_timeout_ms: self.downstream_read_timeout_ms.unwrap_or(60_000),
            upstream_read_timeout_ms: self.upstream_read_timeout_ms.unwrap_or(60_000),
            failover_strategy: self
                .failover_strategy
                .unwrap_or(FailoverStrategy::ExhaustAll),
            failover_max_attempts: self.failover_max_attempts,
            failover_exclude_status_codes: self
                .failover_exclude_status_codes
                .unwrap_or_else(|| vec![400]),
            selector_strategy: self.selector_strategy.unwrap_or_default(),
            affinity_sliding_ttl_ms: self.affinity_sliding_ttl_ms.unwrap_or(5 * 60_000),
            affinity_max_ttl_ms: self.affinity_max_ttl_ms.unwrap_or(30 * 60_000),
            circuit_defaults: self.circuit_defaults.unwrap_or_default(),
            quota_urgent_threshold_percent: self
                .quota_urgent_threshold_percent
                .unwrap_or(80.0),
            quota_urgent_sync_interval_ms: self
                .quota_urgent_sync_interval_ms
                .unwrap_or(60_000),
            quota_normal_sync_interval_ms: self
                .quota_normal_sync_interval_ms
                .unwrap_or(5 * 60_000),
            replay_buffer_max_bytes: self
                .replay_buffer_max_bytes
                .unwrap_or(8 * 1024 * 1024),
            active_health_check_interval_ms: self
                .active_health_check_interval_ms
                .unwrap_or(30_000),
            active_health_check_enabled: self.active_health_check_enabled.unwrap_or(false),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            dsn: Some(value.dsn),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            encryption_key: Some(value.encryption_key),
            downstream_read_timeout_ms: Some(value.downstream_read_timeout_ms),
            upstream_read_timeout_ms: Some(value.upstream_read_timeout_ms),
            failover_strategy: Some(value.failover_strategy),
            failover_max_attempts: value.failover_max_attempts,
            failover_exclude_status_codes: Some(value.failover_exclude_status_codes),
            selector_strategy: Some(value.selector_strategy),
            affinity_sliding_ttl_ms: Some(value.affinity_sliding_ttl_ms),
            affinity_max_ttl_ms: Some(value.affinity_max_ttl_ms),
            circuit_defaults: Some(value.circuit_defaults),
            quota_urgent_threshold_percent: Some(value.quota_urgent_threshold_percent),
            quota_urgent_sync_interval_ms: Some(value.quota_urgent_sync_interval_ms),
            quota_normal_sync_interval_ms: Some(value.quota_normal_sync_interval_ms),
            replay_buffer_max_bytes: Some(value.replay_buffer_max_bytes),
            active_health_check_interval_ms: Some(value.active_health_check_interval_ms),
            active_health_check_enabled: Some(value.active_health_check_enabled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_only_touches_provided_fields() {
        let mut base = GlobalConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(8787),
            ..Default::default()
        };
        let patch = GlobalConfigPatch {
            port: Some(9000),
            ..Default::default()
        };
        base.overlay(patch);
        assert_eq!(base.host.as_deref(), Some("127.0.0.1"));
        assert_eq!(base.port, Some(9000));
    }

    #[test]
    fn into_config_fails_without_required_fields() {
        let patch = GlobalConfigPatch::default();
        assert!(matches!(
            patch.into_config(),
            Err(GlobalConfigError::MissingField("admin_key_hash"))
        ));
    }

    #[test]
    fn into_config_applies_spec_defaults() {
        let patch = GlobalConfigPatch {
            admin_key_hash: Some("hash".to_string()),
            dsn: Some("sqlite://x.db".to_string()),
            encryption_key: Some("k".to_string()),
            ..Default::default()
        };
        let cfg = patch.into_config().unwrap();
        assert_eq!(cfg.failover_exclude_status_codes, vec![400]);
        assert_eq!(cfg.affinity_sliding_ttl_ms, 300_000);
        assert_eq!(cfg.affinity_max_ttl_ms, 1_800_000);
        assert_eq!(cfg.circuit_defaults, CircuitDefaults::default());
    }
}
