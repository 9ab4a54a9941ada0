//! Read-only operational surface for the running process (current config,
//! configured upstreams, circuit/health snapshots). Full CRUD over
//! keys/upstreams/overrides is an explicit non-goal (§1) and lives in an
//! external collaborator; this module exists only so the process has
//! *something* to answer "what is this instance currently serving with",
//! guarded by the same admin credential the teacher's `gproxy-admin` gates
//! its surface with.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use sea_orm::EntityTrait;
use subtle::ConstantTimeEq;

use autorouter_core::auth::hash_presented_key;
use autorouter_core::state::AppState;
use autorouter_storage::{entities, Storage};

#[derive(Clone)]
pub struct AdminState {
    pub app: Arc<AppState>,
    pub storage: Storage,
}

pub fn admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/global_config", get(global_config))
        .route("/upstreams", get(upstreams))
        .route("/api_keys", get(api_keys))
        .route("/circuit", get(circuit_snapshot))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth))
        .with_state(state)
}

async fn admin_auth(
    State(state): State<AdminState>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = headers
        .get("x-admin-key")
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;
    let presented_hash = hash_presented_key(presented);
    let stored = state.app.config.admin_key_hash.as_bytes();
    if presented_hash.as_bytes().ct_eq(stored).unwrap_u8() != 1 {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(request).await)
}

/// Redacts secrets (`encryption_key`, `admin_key_hash`) before serializing.
async fn global_config(State(state): State<AdminState>) -> impl IntoResponse {
    let config = &state.app.config;
    Json(serde_json::json!({
        "host": config.host,
        "port": config.port,
        "proxy": config.proxy,
        "event_redact_sensitive": config.event_redact_sensitive,
        "downstream_read_timeout_ms": config.downstream_read_timeout_ms,
        "upstream_read_timeout_ms": config.upstream_read_timeout_ms,
        "failover_strategy": config.failover_strategy,
        "failover_max_attempts": config.failover_max_attempts,
        "failover_exclude_status_codes": config.failover_exclude_status_codes,
        "selector_strategy": config.selector_strategy,
        "affinity_sliding_ttl_ms": config.affinity_sliding_ttl_ms,
        "affinity_max_ttl_ms": config.affinity_max_ttl_ms,
        "circuit_defaults": config.circuit_defaults,
        "quota_urgent_threshold_percent": config.quota_urgent_threshold_percent,
        "quota_urgent_sync_interval_ms": config.quota_urgent_sync_interval_ms,
        "quota_normal_sync_interval_ms": config.quota_normal_sync_interval_ms,
        "replay_buffer_max_bytes": config.replay_buffer_max_bytes,
        "active_health_check_interval_ms": config.active_health_check_interval_ms,
        "active_health_check_enabled": config.active_health_check_enabled,
    }))
}

/// Never serializes `api_key_encrypted`.
async fn upstreams(State(state): State<AdminState>) -> Result<Response, StatusCode> {
    let rows = entities::Upstreams::find()
        .all(state.storage.connection())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let out: Vec<_> = rows
        .into_iter()
        .map(|row| {
            serde_json::json!({
                "id": row.id,
                "name": row.name,
                "provider_type": row.provider_type,
                "base_url": row.base_url,
                "timeout_ms": row.timeout_ms,
                "is_active": row.is_active,
                "weight": row.weight,
                "priority": row.priority,
                "route_capabilities": row.route_capabilities,
                "allowed_models": row.allowed_models,
                "model_redirects": row.model_redirects,
                "circuit_breaker_config": row.circuit_breaker_config,
                "affinity_migration_config": row.affinity_migration_config,
                "billing_multipliers": row.billing_multipliers,
                "spending_rules": row.spending_rules,
            })
        })
        .collect();
    Ok(Json(out).into_response())
}

/// Never serializes `key_hash`.
async fn api_keys(State(state): State<AdminState>) -> Result<Response, StatusCode> {
    let rows = entities::ApiKeys::find()
        .all(state.storage.connection())
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    let out: Vec<_> = rows
        .into_iter()
        .map(|row| {
            serde_json::json!({
                "id": row.id,
                "key_prefix": row.key_prefix,
                "name": row.name,
                "is_active": row.is_active,
                "expires_at": row.expires_at,
                "created_at": row.created_at,
            })
        })
        .collect();
    Ok(Json(out).into_response())
}

async fn circuit_snapshot(State(state): State<AdminState>) -> impl IntoResponse {
    let snapshot = state.app.registry.load();
    let mut out = Vec::with_capacity(snapshot.upstreams.len());
    for id in snapshot.upstreams.keys() {
        let circuit_state = state
            .app
            .circuit
            .state(*id)
            .await
            .map(|s| format!("{s:?}"));
        out.push(serde_json::json!({
            "upstream_id": id,
            "circuit_state": circuit_state,
            "healthy": state.app.health.is_healthy(*id).await,
        }));
    }
    Json(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_key_hash_matches_presented_key_hash() {
        let presented = "sk-admin-xyz";
        let stored = hash_presented_key(presented);
        assert_eq!(hash_presented_key(presented), stored);
    }
}
