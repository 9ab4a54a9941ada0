//! The top-level dispatch orchestrator: C1 authorize -> C7 classify/filter
//! (using C2/C3/C4/C5) -> C6 affinity -> C8 select -> C11 attempt loop { C9
//! headers -> C10 forward; on failure update C3/C4; on success C6 update,
//! C12 emit } (§2 request flow). This is the only module that sequences all
//! twelve components; everything downstream of it (axum, routes) lives in
//! `autorouter-router`.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value as Json;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;

use autorouter_protocol::Body;
use autorouter_storage::{LogEmitter, RequestLogRecord};

use crate::affinity::{AffinityKey, MigrationCandidate};
use crate::auth::{self, AuthFailure};
use crate::billing::{self, BillingStatus, ModelPrice, Usage};
use crate::circuit::AdmitDecision;
use crate::classify::{self, ClassifyError};
use crate::data::{ProviderType, Upstream, UpstreamId};
use crate::error::{DispatchError, ErrorCategory};
use crate::failover::{self, AttemptRecord, FailoverStrategy};
use crate::forwarder::{self, ForwardOutcome, ForwardRequest, ResponseBody, UsageSignal};
use crate::headers::{self, CompensationRule};
use crate::selector::{self, SelectionStrategy};
use crate::state::AppState;

pub struct DispatchRequest {
    pub method: String,
    pub path: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub path_model_segment: Option<String>,
    pub request_id: String,
    pub cancel: CancellationToken,
}

pub struct DispatchResponse {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

/// Secret decryption and price/compensation lookups are supplied by the
/// caller, which owns storage access; the engine only orchestrates.
pub struct DispatchContext {
    pub app: Arc<AppState>,
    pub log_emitter: LogEmitter,
    pub decrypt_secret: Box<dyn Fn(&[u8]) -> anyhow::Result<String> + Send + Sync>,
    pub compensation_rules: Vec<CompensationRule>,
    pub header_deny_list: Vec<String>,
    pub price_for_model: Box<dyn Fn(&str) -> Option<ModelPrice> + Send + Sync>,
}

pub async fn dispatch(
    ctx: &Arc<DispatchContext>,
    req: DispatchRequest,
) -> Result<DispatchResponse, DispatchError> {
    let started_at = std::time::Instant::now();
    let now = OffsetDateTime::now_utc();

    let authorization = headers::find_header(&req.headers, "authorization");
    let x_api_key = headers::find_header(&req.headers, "x-api-key");
    let presented = auth::extract_presented_key(authorization, x_api_key);

    let snapshot = ctx.app.registry.load();
    let authorized = match presented {
        Some(key) => auth::authorize(&snapshot, &key, now),
        None => Err(AuthFailure::Unauthorized),
    };
    let authorized = authorized.map_err(|_| DispatchError::Unauthorized)?;

    let body_json: Body = if req.body.is_empty() {
        Json::Null
    } else {
        serde_json::from_slice(&req.body)
            .map_err(|e| DispatchError::ProtocolError(format!("malformed body: {e}")))?
    };

    let session_id_header = headers::find_header(&req.headers, "session_id");
    let classified = classify::classify(
        &req.path,
        &body_json,
        req.path_model_segment.as_deref(),
        session_id_header,
    )
    .map_err(|ClassifyError::UnmappedPath| {
        DispatchError::ProtocolError(format!("no capability mapped for path {}", req.path))
    })?;

    let filter = classify::filter_candidates(
        &snapshot,
        &authorized.allowed_upstream_ids,
        authorized.api_key_id,
        classified.capability,
        classified.model.as_deref(),
        &ctx.app.circuit,
        &ctx.app.health,
        &ctx.app.quota,
        false,
        now,
    )
    .await;

    if filter.candidates.is_empty() {
        let all_circuit_open = filter
            .exclusions
            .iter()
            .all(|e| e.reason == classify::ExclusionReason::CircuitOpen);
        if all_circuit_open && !filter.exclusions.is_empty() {
            return Err(DispatchError::CircuitOpen {
                upstream_ids: filter.exclusions.iter().map(|e| e.upstream_id).collect(),
            });
        }
        return Err(DispatchError::Forbidden);
    }

    let mut candidate_ids: Vec<UpstreamId> = filter.candidates.iter().map(|u| u.id).collect();
    let candidates_by_id: std::collections::HashMap<UpstreamId, Arc<Upstream>> = filter
        .candidates
        .iter()
        .map(|u| (u.id, u.clone()))
        .collect();

    let affinity_key = classified.session_id.clone().map(|session_id| AffinityKey {
        api_key_id: authorized.api_key_id,
        capability: classified.capability,
        session_id,
    });

    let content_length = req.body.len() as u64;
    let mut affinity_hit = false;
    let mut affinity_migrated = false;

    let mut chosen = None;
    if let Some(key) = &affinity_key {
        if let Some(entry) = ctx.app.affinity.get(key, now).await {
            if candidate_ids.contains(&entry.upstream_id) {
                affinity_hit = true;
                let current = candidates_by_id.get(&entry.upstream_id).expect("contains checked");

                let migration_candidates: Vec<MigrationCandidate> = filter
                    .candidates
                    .iter()
                    .filter_map(|u| {
                        u.affinity_migration_config.map(|cfg| MigrationCandidate {
                            upstream_id: u.id,
                            priority: u.priority,
                            migration_enabled: cfg.enabled,
                            metric_is_tokens: matches!(
                                cfg.metric,
                                crate::data::AffinityMigrationMetric::Tokens
                            ),
                            threshold: cfg.threshold,
                        })
                    })
                    .collect();

                let migration_target = crate::affinity::should_migrate(
                    current.priority,
                    migration_candidates,
                    content_length,
                    entry.cumulative_tokens,
                );

                if let Some(target_id) = migration_target {
                    chosen = candidates_by_id.get(&target_id).cloned();
                    affinity_migrated = true;
                    // No delete here: `affinity.set()` below (on success) updates
                    // `upstream_id` on the existing entry in place and preserves
                    // `cumulative_tokens`. Deleting first would force a fresh
                    // insert and zero it.
                } else {
                    chosen = Some(current.clone());
                }
            }
        }
    }

    let mut attempts: Vec<AttemptRecord> = Vec::new();
    let exclude_status_codes: HashSet<u16> = ctx
        .app
        .config
        .failover_exclude_status_codes
        .iter()
        .copied()
        .collect();
    let strategy = match ctx.app.config.failover_strategy {
        autorouter_common::FailoverStrategy::ExhaustAll => FailoverStrategy::ExhaustAll,
        autorouter_common::FailoverStrategy::MaxAttempts => FailoverStrategy::MaxAttempts {
            max_attempts: ctx.app.config.failover_max_attempts.unwrap_or(u32::MAX),
        },
    };
    let selection_strategy = match ctx.app.config.selector_strategy {
        autorouter_common::SelectorStrategy::Weighted => SelectionStrategy::Weighted,
        autorouter_common::SelectorStrategy::RoundRobin => SelectionStrategy::RoundRobin,
        autorouter_common::SelectorStrategy::LeastConnections => {
            SelectionStrategy::LeastConnections
        }
    };

    let mut routing_duration_ms: i64 = 0;
    let mut routing_measured = false;

    loop {
        let upstream = match chosen.take() {
            Some(u) => u,
            None => {
                let candidate_refs: Vec<Arc<Upstream>> = candidate_ids
                    .iter()
                    .filter_map(|id| candidates_by_id.get(id).cloned())
                    .collect();
                match selector::select(
                    &candidate_refs,
                    selection_strategy,
                    &req.request_id,
                    &ctx.app.round_robin,
                    &ctx.app.in_flight,
                ) {
                    Some(u) => u,
                    None => {
                        return Err(DispatchError::AllUpstreamsFailed {
                            attempts: attempts.len() as u32,
                            last_category: attempts.last().and_then(|a| a.error_type),
                        })
                    }
                }
            }
        };

        ctx.app.circuit.ensure(upstream.id, upstream.circuit_breaker_config).await;
        ctx.app.health.ensure(upstream.id).await;
        if let Some(rules) = Some(&upstream.spending_rules) {
            ctx.app.quota.ensure(upstream.id, rules).await;
        }

        if ctx.app.circuit.admit(upstream.id, now).await == AdmitDecision::Reject {
            failover::remove_attempted(&mut candidate_ids, upstream.id);
            if !failover::should_continue_failover(
                attempts.len() as u32,
                !candidate_ids.is_empty(),
                strategy,
                req.cancel.is_cancelled(),
            ) {
                return Err(DispatchError::AllUpstreamsFailed {
                    attempts: attempts.len() as u32,
                    last_category: Some(ErrorCategory::CircuitOpen),
                });
            }
            continue;
        }

        let secret = (ctx.decrypt_secret)(&upstream.api_key_encrypted)
            .map_err(|e| DispatchError::ProtocolError(format!("secret decryption failed: {e}")))?;

        let (outbound_headers, _diff) = headers::compensate(
            &req.headers,
            classified.capability,
            upstream.provider_type,
            &secret,
            &ctx.header_deny_list,
            &ctx.compensation_rules,
        );

        let mut outbound_body = body_json.clone();
        if let Some(model) = &classified.model {
            if let Some(redirect) = upstream.redirect_for(model) {
                if let Json::Object(map) = &mut outbound_body {
                    map.insert("model".to_string(), Json::String(redirect.to_string()));
                }
            }
        }
        let outbound_bytes = serde_json::to_vec(&outbound_body)
            .map(Bytes::from)
            .unwrap_or_else(|_| req.body.clone());

        let url = format!("{}{}", upstream.base_url.trim_end_matches('/'), req.path);
        let forward_req = ForwardRequest {
            method: &req.method,
            url,
            headers: outbound_headers,
            body: outbound_bytes,
            total_timeout: Duration::from_millis(upstream.timeout_ms),
            per_chunk_timeout: Duration::from_millis(ctx.app.config.upstream_read_timeout_ms),
        };

        if !routing_measured {
            routing_duration_ms = started_at.elapsed().as_millis() as i64;
            routing_measured = true;
        }

        ctx.app.in_flight.enter(upstream.id);
        let outcome = forwarder::forward(&ctx.app.client, forward_req, req.cancel.clone()).await;
        ctx.app.in_flight.exit(upstream.id);

        let is_stream = matches!(outcome.body, ResponseBody::Stream(_));

        if outcome.aborted {
            return Err(DispatchError::Aborted);
        }

        let ForwardOutcome {
            status_code,
            response_headers,
            body,
            ttft_ms,
            usage: header_time_usage,
            error_category,
            aborted: _,
            completion,
        } = outcome;

        attempts.push(AttemptRecord {
            upstream_id: upstream.id,
            attempted_at: now,
            error_type: error_category,
            status_code: Some(status_code),
        });

        let should_failover = failover::should_trigger_failover(status_code, &exclude_status_codes);

        if !should_failover {
            if (200..300).contains(&status_code) {
                // Buffered responses already carry their final usage/ttft;
                // streamed responses only resolve `completion` once the
                // upstream body has fully drained, so the bookkeeping that
                // depends on it (circuit/health/billing/affinity/quota/log)
                // runs in a spawned task instead of blocking the response
                // the client is waiting on (§4.12: "the client must receive
                // the response regardless of log persistence success").
                match completion {
                    None => {
                        finalize_success(
                            ctx.clone(),
                            upstream.clone(),
                            classified.clone(),
                            affinity_key.clone(),
                            content_length,
                            FinishedAttempt {
                                api_key_id: authorized.api_key_id,
                                method: req.method.clone(),
                                path: req.path.clone(),
                                status_code,
                                started_at,
                                routing_duration_ms,
                                ttft_ms,
                                is_stream,
                                attempts: attempts.clone(),
                                affinity_hit,
                                affinity_migrated,
                                usage: header_time_usage,
                            },
                        )
                        .await;
                    }
                    Some(completion_rx) => {
                        let ctx = ctx.clone();
                        let upstream = upstream.clone();
                        let classified = classified.clone();
                        let affinity_key = affinity_key.clone();
                        let attempts = attempts.clone();
                        let finished = FinishedAttempt {
                            api_key_id: authorized.api_key_id,
                            method: req.method.clone(),
                            path: req.path.clone(),
                            status_code,
                            started_at,
                            routing_duration_ms,
                            ttft_ms,
                            is_stream,
                            attempts,
                            affinity_hit,
                            affinity_migrated,
                            usage: header_time_usage,
                        };
                        tokio::spawn(async move {
                            let mut finished = finished;
                            if let Ok(completed) = completion_rx.await {
                                finished.ttft_ms = completed.ttft_ms;
                                finished.usage = completed.usage;
                            }
                            finalize_success(
                                ctx,
                                upstream,
                                classified,
                                affinity_key,
                                content_length,
                                finished,
                            )
                            .await;
                        });
                    }
                }
            } else {
                emit_log(
                    ctx,
                    &req.method,
                    &req.path,
                    &classified,
                    Some(authorized.api_key_id),
                    Some(upstream.id),
                    status_code,
                    started_at,
                    routing_duration_ms,
                    ttft_ms,
                    is_stream,
                    &attempts,
                    affinity_hit,
                    affinity_migrated,
                    BillingStatus::Unbilled,
                    None,
                    None,
                    None,
                );
            }

            return Ok(DispatchResponse {
                status_code,
                headers: response_headers,
                body,
            });
        }

        ctx.app.circuit.record_failure(upstream.id, now).await;
        ctx.app
            .health
            .record_outcome(
                upstream.id,
                false,
                ttft_ms.unwrap_or(0),
                now,
                Some(format!("status {}", status_code)),
            )
            .await;

        failover::remove_attempted(&mut candidate_ids, upstream.id);
        if !failover::should_continue_failover(
            attempts.len() as u32,
            !candidate_ids.is_empty(),
            strategy,
            req.cancel.is_cancelled(),
        ) {
            emit_log(
                ctx,
                &req.method,
                &req.path,
                &classified,
                Some(authorized.api_key_id),
                None,
                502,
                started_at,
                routing_duration_ms,
                None,
                false,
                &attempts,
                affinity_hit,
                affinity_migrated,
                BillingStatus::Unbilled,
                None,
                None,
                None,
            );
            return Err(DispatchError::AllUpstreamsFailed {
                attempts: attempts.len() as u32,
                last_category: attempts.last().and_then(|a| a.error_type),
            });
        }
    }
}

/// Everything about a committed 2xx attempt that `finalize_success` needs,
/// bundled so the streaming path can hand it to a spawned task without a
/// long parameter list crossing the `tokio::spawn` boundary twice.
struct FinishedAttempt {
    api_key_id: i64,
    method: String,
    path: String,
    status_code: u16,
    started_at: std::time::Instant,
    routing_duration_ms: i64,
    ttft_ms: Option<u64>,
    is_stream: bool,
    attempts: Vec<AttemptRecord>,
    affinity_hit: bool,
    affinity_migrated: bool,
    usage: UsageSignal,
}

/// Circuit/health/billing/quota/affinity bookkeeping plus log emission for
/// a committed 2xx attempt (§4.11 step 4). Called synchronously for
/// buffered responses (usage is already final) and from a spawned task
/// once a streamed response's `StreamCompletion` resolves, so the request
/// path never blocks the client on this work (§4.12).
#[allow(clippy::too_many_arguments)]
async fn finalize_success(
    ctx: Arc<DispatchContext>,
    upstream: Arc<Upstream>,
    classified: classify::Classified,
    affinity_key: Option<AffinityKey>,
    content_length: u64,
    finished: FinishedAttempt,
) {
    ctx.app.circuit.record_success(upstream.id).await;
    ctx.app
        .health
        .record_outcome(upstream.id, true, finished.ttft_ms.unwrap_or(0), OffsetDateTime::now_utc(), None)
        .await;

    let usage = Usage::from(&finished.usage);
    let price = classified
        .model
        .as_deref()
        .and_then(|m| (ctx.price_for_model)(m));
    let billing = billing::evaluate_billing(
        upstream.provider_type,
        classified.model.as_deref(),
        Some(&usage),
        price.as_ref(),
        upstream.billing_multipliers,
    );
    if let Some(cost) = billing.cost {
        if billing.status == BillingStatus::Billed {
            ctx.app.quota.record_spending(upstream.id, cost.final_cost).await;
        }
    }

    if let Some(key) = &affinity_key {
        let now = OffsetDateTime::now_utc();
        // `set` updates `upstream_id`/`content_length` in place and preserves
        // `cumulative_tokens` when the entry already exists (e.g. from a
        // migration earlier in this same dispatch) — only a brand new key
        // starts the counter at zero.
        ctx.app
            .affinity
            .set(key.clone(), upstream.id, content_length, now)
            .await;
        let new_tokens = usage.prompt_tokens + usage.completion_tokens;
        ctx.app
            .affinity
            .update_cumulative_tokens(key, new_tokens, now)
            .await;
    }

    emit_log(
        &ctx,
        &finished.method,
        &finished.path,
        &classified,
        Some(finished.api_key_id),
        Some(upstream.id),
        finished.status_code,
        finished.started_at,
        finished.routing_duration_ms,
        finished.ttft_ms,
        finished.is_stream,
        &finished.attempts,
        finished.affinity_hit,
        finished.affinity_migrated,
        billing.status,
        billing.unbillable_reason,
        Some(usage),
        billing.cost,
    );
}

#[allow(clippy::too_many_arguments)]
fn emit_log(
    ctx: &DispatchContext,
    method: &str,
    path: &str,
    classified: &classify::Classified,
    api_key_id: Option<i64>,
    upstream_id: Option<UpstreamId>,
    status_code: u16,
    started_at: std::time::Instant,
    routing_duration_ms: i64,
    ttft_ms: Option<u64>,
    is_stream: bool,
    attempts: &[AttemptRecord],
    affinity_hit: bool,
    affinity_migrated: bool,
    billing_status: BillingStatus,
    unbillable_reason: Option<billing::UnbillableReason>,
    usage: Option<Usage>,
    cost: Option<billing::CostBreakdown>,
) {
    let duration_ms = started_at.elapsed().as_millis() as i64;
    let failover_history: Vec<Json> = attempts
        .iter()
        .map(|a| {
            serde_json::json!({
                "upstream_id": a.upstream_id,
                "error_type": a.error_type.map(|e| format!("{e:?}")),
                "status_code": a.status_code,
            })
        })
        .collect();

    let record = RequestLogRecord {
        api_key_id,
        upstream_id,
        method: method.to_string(),
        path: path.to_string(),
        model: classified.model.clone(),
        prompt_tokens: usage.map(|u| u.prompt_tokens as i64),
        completion_tokens: usage.map(|u| u.completion_tokens as i64),
        total_tokens: usage.map(|u| (u.prompt_tokens + u.completion_tokens) as i64),
        cache_read_tokens: usage.map(|u| u.cache_read_tokens as i64),
        cache_write_tokens: usage.map(|u| u.cache_write_tokens as i64),
        status_code: status_code as i32,
        duration_ms,
        routing_duration_ms,
        ttft_ms: ttft_ms.map(|v| v as i64),
        is_stream,
        error_message: attempts.last().and_then(|a| a.error_type).map(|e| format!("{e:?}")),
        failover_attempts: attempts.len().saturating_sub(1).max(0) as i32,
        failover_history: Json::Array(failover_history),
        routing_decision: serde_json::json!({ "capability": classified.capability.as_str() }),
        session_id: classified.session_id.clone(),
        affinity_hit,
        affinity_migrated,
        billing_status: match billing_status {
            BillingStatus::Billed => "billed",
            BillingStatus::Unbilled => "unbilled",
        },
        unbillable_reason: unbillable_reason.map(|r| match r {
            billing::UnbillableReason::ModelMissing => "model_missing",
            billing::UnbillableReason::UsageMissing => "usage_missing",
            billing::UnbillableReason::PriceNotFound => "price_not_found",
        }),
        price_source: None,
        base_prices: Json::Null,
        multipliers: Json::Null,
        billed_input_tokens: cost.map(|c| c.billed_input_tokens as i64),
        final_cost: cost.map(|c| c.final_cost),
        currency: "usd".to_string(),
    };

    ctx.log_emitter.emit(record);
}
