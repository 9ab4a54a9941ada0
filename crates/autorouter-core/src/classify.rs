//! C7 — Capability Router (§4.7). Classification reads only the inbound
//! method/path/body; filtering reads the C2 snapshot plus C3/C4/C5 state.
//! Kept as plain functions over the domain types rather than a struct: there
//! is no state of its own to own.

use std::collections::HashSet;
use std::sync::Arc;

use autorouter_protocol::{extract_model_from_body, Body, RouteCapability};

use crate::circuit::{AdmitDecision, CircuitBreakerRegistry};
use crate::data::{ApiKeyId, Upstream, UpstreamId};
use crate::health::HealthTracker;
use crate::quota::QuotaTracker;
use crate::registry::RegistrySnapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    /// Path didn't match any capability's route prefix.
    UnmappedPath,
}

#[derive(Debug, Clone)]
pub struct Classified {
    pub capability: RouteCapability,
    pub model: Option<String>,
    pub original_model: Option<String>,
    pub session_id: Option<String>,
}

/// `classify(method, path, body) -> {capability, model, originalModel,
/// sessionId}` (§4.7). Gemini's model comes from the URL path segment
/// rather than the body; the caller passes it as `path_model_segment`.
pub fn classify(
    path: &str,
    body: &Body,
    path_model_segment: Option<&str>,
    session_id_header: Option<&str>,
) -> Result<Classified, ClassifyError> {
    let capability = capability_for_path(path).ok_or(ClassifyError::UnmappedPath)?;

    let model = match capability {
        RouteCapability::GeminiNativeGenerate | RouteCapability::GeminiCodeAssistInternal => {
            path_model_segment.map(str::to_string)
        }
        _ => extract_model_from_body(body),
    };

    let session_id = match capability {
        RouteCapability::AnthropicMessages => autorouter_protocol::extract_anthropic_session_id(body),
        RouteCapability::CodexResponses
        | RouteCapability::OpenaiChatCompatible
        | RouteCapability::OpenaiExtended => {
            autorouter_protocol::extract_header_session_id(session_id_header)
        }
        _ => None,
    };

    Ok(Classified {
        capability,
        original_model: model.clone(),
        model,
        session_id,
    })
}

/// Closed path → capability mapping (§4.7, §6.1). Unmatched paths are a
/// protocol error, never a new variant.
fn capability_for_path(path: &str) -> Option<RouteCapability> {
    if path.starts_with("/v1/messages") {
        Some(RouteCapability::AnthropicMessages)
    } else if path.starts_with("/v1/responses") {
        Some(RouteCapability::CodexResponses)
    } else if path.starts_with("/v1/chat/completions") {
        Some(RouteCapability::OpenaiChatCompatible)
    } else if path.starts_with("/v1/completions") || path.starts_with("/v1/embeddings") {
        Some(RouteCapability::OpenaiExtended)
    } else if path.contains(":generateContent") || path.contains(":streamGenerateContent") {
        Some(RouteCapability::GeminiNativeGenerate)
    } else if path.starts_with("/v1internal") {
        Some(RouteCapability::GeminiCodeAssistInternal)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExclusionReason {
    Inactive,
    NotAllowedForKey,
    CapabilityMismatch,
    ModelNotAllowed,
    CircuitOpen,
    Unhealthy,
    QuotaExceeded,
}

#[derive(Debug, Clone)]
pub struct Exclusion {
    pub upstream_id: UpstreamId,
    pub reason: ExclusionReason,
}

#[derive(Debug, Clone)]
pub struct FilterOutcome {
    pub candidates: Vec<Arc<Upstream>>,
    pub exclusions: Vec<Exclusion>,
}

/// Candidate filter (§4.7 points 1-7). `strict_health` controls whether an
/// unhealthy upstream is excluded outright or only deprioritized by the
/// selector (configurable per §4.4).
#[allow(clippy::too_many_arguments)]
pub async fn filter_candidates(
    snapshot: &RegistrySnapshot,
    allowed_upstream_ids: &HashSet<UpstreamId>,
    _api_key_id: ApiKeyId,
    capability: RouteCapability,
    resolved_model: Option<&str>,
    circuit: &CircuitBreakerRegistry,
    health: &HealthTracker,
    quota: &QuotaTracker,
    strict_health: bool,
    now: time::OffsetDateTime,
) -> FilterOutcome {
    let mut candidates = Vec::new();
    let mut exclusions = Vec::new();

    for upstream in snapshot.candidates_for(capability) {
        if !upstream.is_active {
            exclusions.push(Exclusion {
                upstream_id: upstream.id,
                reason: ExclusionReason::Inactive,
            });
            continue;
        }
        if !allowed_upstream_ids.contains(&upstream.id) {
            exclusions.push(Exclusion {
                upstream_id: upstream.id,
                reason: ExclusionReason::NotAllowedForKey,
            });
            continue;
        }
        if !upstream.supports(capability) {
            exclusions.push(Exclusion {
                upstream_id: upstream.id,
                reason: ExclusionReason::CapabilityMismatch,
            });
            continue;
        }
        if let Some(allowed_models) = &upstream.allowed_models {
            let model_ok = resolved_model
                .map(|m| allowed_models.contains(m))
                .unwrap_or(false);
            if !model_ok {
                exclusions.push(Exclusion {
                    upstream_id: upstream.id,
                    reason: ExclusionReason::ModelNotAllowed,
                });
                continue;
            }
        }
        if circuit.admit(upstream.id, now).await == AdmitDecision::Reject {
            exclusions.push(Exclusion {
                upstream_id: upstream.id,
                reason: ExclusionReason::CircuitOpen,
            });
            continue;
        }
        if strict_health && !health.is_healthy(upstream.id).await {
            exclusions.push(Exclusion {
                upstream_id: upstream.id,
                reason: ExclusionReason::Unhealthy,
            });
            continue;
        }
        if !quota.is_within_quota(upstream.id).await {
            exclusions.push(Exclusion {
                upstream_id: upstream.id,
                reason: ExclusionReason::QuotaExceeded,
            });
            continue;
        }
        candidates.push(upstream);
    }

    FilterOutcome {
        candidates,
        exclusions,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{BillingMultipliers, CircuitBreakerConfig, ProviderType};
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn maps_known_paths_to_capabilities() {
        assert_eq!(
            capability_for_path("/v1/messages"),
            Some(RouteCapability::AnthropicMessages)
        );
        assert_eq!(
            capability_for_path("/v1/chat/completions"),
            Some(RouteCapability::OpenaiChatCompatible)
        );
        assert_eq!(
            capability_for_path("/v1beta/models/gemini-pro:generateContent"),
            Some(RouteCapability::GeminiNativeGenerate)
        );
        assert_eq!(capability_for_path("/unmapped"), None);
    }

    #[test]
    fn classify_extracts_model_and_anthropic_session() {
        let body = json!({
            "model": "claude-3-5-sonnet",
            "metadata": {"user_id": "x_session_11111111-2222-3333-4444-555555555555"}
        });
        let result = classify("/v1/messages", &body, None, None).unwrap();
        assert_eq!(result.capability, RouteCapability::AnthropicMessages);
        assert_eq!(result.model.as_deref(), Some("claude-3-5-sonnet"));
        assert_eq!(
            result.session_id.as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }

    #[test]
    fn classify_uses_header_session_for_openai_capabilities() {
        let body = json!({"model": "gpt-4o"});
        let result = classify("/v1/chat/completions", &body, None, Some("abc")).unwrap();
        assert_eq!(result.session_id.as_deref(), Some("abc"));
    }

    #[test]
    fn classify_rejects_unmapped_path() {
        let body = json!({});
        assert_eq!(
            classify("/unmapped", &body, None, None).unwrap_err(),
            ClassifyError::UnmappedPath
        );
    }

    fn upstream(id: UpstreamId, is_active: bool) -> Upstream {
        Upstream {
            id,
            name: format!("u{id}"),
            provider_type: ProviderType::Anthropic,
            base_url: "https://a.invalid".to_string(),
            api_key_encrypted: vec![],
            timeout_ms: 1000,
            is_active,
            weight: 1,
            priority: 0,
            route_capabilities: HashSet::from([RouteCapability::AnthropicMessages]),
            allowed_models: None,
            model_redirects: HashMap::new(),
            circuit_breaker_config: CircuitBreakerConfig::default(),
            affinity_migration_config: None,
            billing_multipliers: BillingMultipliers::default(),
            spending_rules: vec![],
        }
    }

    #[tokio::test]
    async fn filter_excludes_inactive_and_out_of_scope_upstreams() {
        let active = upstream(1, true);
        let inactive = upstream(2, false);

        let snapshot = RegistrySnapshot::build(vec![active, inactive], vec![]);
        let circuit = CircuitBreakerRegistry::new();
        let health = HealthTracker::new();
        let quota = QuotaTracker::new(80.0);
        let now = time::OffsetDateTime::now_utc();

        let outcome = filter_candidates(
            &snapshot,
            &HashSet::from([1]),
            1,
            RouteCapability::AnthropicMessages,
            None,
            &circuit,
            &health,
            &quota,
            false,
            now,
        )
        .await;

        assert_eq!(outcome.candidates.len(), 1);
        assert_eq!(outcome.candidates[0].id, 1);
        assert_eq!(outcome.exclusions.len(), 1);
        assert_eq!(outcome.exclusions[0].upstream_id, 2);
    }

    #[tokio::test]
    async fn filter_excludes_upstream_not_in_allowed_set() {
        let upstream_in_scope = upstream(1, true);
        let snapshot = RegistrySnapshot::build(vec![upstream_in_scope], vec![]);
        let circuit = CircuitBreakerRegistry::new();
        let health = HealthTracker::new();
        let quota = QuotaTracker::new(80.0);
        let now = time::OffsetDateTime::now_utc();

        let outcome = filter_candidates(
            &snapshot,
            &HashSet::new(),
            1,
            RouteCapability::AnthropicMessages,
            None,
            &circuit,
            &health,
            &quota,
            false,
            now,
        )
        .await;

        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.exclusions[0].reason, ExclusionReason::NotAllowedForKey);
    }
}
