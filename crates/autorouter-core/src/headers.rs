//! C9 — Header Compensator (§4.9). Pure transform from inbound headers to
//! outbound headers + a redaction-safe diff record. Never holds the
//! decrypted secret any longer than building the single auth header value.

use std::collections::BTreeMap;

use autorouter_protocol::RouteCapability;

use crate::data::ProviderType;

/// Headers always stripped before forwarding (§4.9 "Drop").
const ALWAYS_DROPPED: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "proxy-authorization",
    "host",
    "content-length",
];

/// Header names redacted in any diagnostic surface (§8 invariant 9), a
/// superset of `ALWAYS_DROPPED` including response-facing names.
pub const REDACTED_HEADER_NAMES: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "proxy-authorization",
    "set-cookie",
    "x-forwarded-authorization",
    "session_id",
    "x-codex-turn-metadata",
    "x-codex-beta-features",
];

pub fn is_redacted_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    REDACTED_HEADER_NAMES.iter().any(|h| *h == lower)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationMode {
    MissingOnly,
    Always,
}

/// `{capabilities, targetHeader, sources[], mode}` (§4.9 "Compensate missing").
#[derive(Debug, Clone)]
pub struct CompensationRule {
    pub capabilities: Vec<RouteCapability>,
    pub target_header: String,
    pub sources: Vec<String>,
    pub mode: CompensationMode,
}

#[derive(Debug, Clone, Default)]
pub struct HeaderDiff {
    pub dropped: Vec<String>,
    pub auth_replaced: bool,
    pub compensated: Vec<String>,
}

/// `compensate(inboundHeaders, targetUpstream, capability) -> (outboundHeaders,
/// headerDiff)` (§4.9). `deny_list` is the operator-configured extra drop
/// set; `decrypted_secret` is the upstream's plaintext credential, held only
/// for the duration of this call.
pub fn compensate(
    inbound: &BTreeMap<String, String>,
    capability: RouteCapability,
    provider_type: ProviderType,
    decrypted_secret: &str,
    deny_list: &[String],
    rules: &[CompensationRule],
) -> (BTreeMap<String, String>, HeaderDiff) {
    let mut outbound = BTreeMap::new();
    let mut diff = HeaderDiff::default();

    for (name, value) in inbound {
        let lower = name.to_ascii_lowercase();
        let denied = ALWAYS_DROPPED.contains(&lower.as_str())
            || deny_list.iter().any(|d| d.eq_ignore_ascii_case(&lower));
        if denied {
            diff.dropped.push(name.clone());
            continue;
        }
        outbound.insert(name.clone(), value.clone());
    }

    inject_auth(&mut outbound, provider_type, decrypted_secret);
    diff.auth_replaced = true;

    for rule in rules {
        if !rule.capabilities.contains(&capability) {
            continue;
        }
        let present = outbound.contains_key(&rule.target_header)
            || outbound
                .keys()
                .any(|k| k.eq_ignore_ascii_case(&rule.target_header));
        let should_apply = match rule.mode {
            CompensationMode::MissingOnly => !present,
            CompensationMode::Always => true,
        };
        if !should_apply {
            continue;
        }
        for source in &rule.sources {
            if let Some(value) = find_header(inbound, source) {
                outbound.insert(rule.target_header.clone(), value.to_string());
                diff.compensated.push(rule.target_header.clone());
                break;
            }
        }
    }

    (outbound, diff)
}

pub(crate) fn find_header<'a>(headers: &'a BTreeMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn inject_auth(outbound: &mut BTreeMap<String, String>, provider_type: ProviderType, secret: &str) {
    match provider_type {
        ProviderType::Anthropic => {
            outbound.insert("x-api-key".to_string(), secret.to_string());
        }
        ProviderType::Openai | ProviderType::Custom => {
            outbound.insert("authorization".to_string(), format!("Bearer {secret}"));
        }
        ProviderType::Google => {
            outbound.insert("authorization".to_string(), format!("Bearer {secret}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn drops_authorization_and_hop_by_hop_headers() {
        let inbound = headers(&[
            ("authorization", "Bearer secret"),
            ("x-api-key", "secret2"),
            ("cookie", "a=b"),
            ("content-length", "42"),
            ("host", "example.invalid"),
            ("x-trace-id", "abc"),
        ]);
        let (outbound, diff) = compensate(
            &inbound,
            RouteCapability::AnthropicMessages,
            ProviderType::Anthropic,
            "sk-upstream",
            &[],
            &[],
        );
        assert!(!outbound.contains_key("authorization"));
        assert!(!outbound.contains_key("cookie"));
        assert_eq!(outbound.get("x-trace-id").map(String::as_str), Some("abc"));
        assert_eq!(diff.dropped.len(), 5);
    }

    #[test]
    fn injects_provider_appropriate_auth() {
        let inbound = headers(&[]);
        let (outbound, diff) = compensate(
            &inbound,
            RouteCapability::AnthropicMessages,
            ProviderType::Anthropic,
            "sk-up",
            &[],
            &[],
        );
        assert_eq!(outbound.get("x-api-key").map(String::as_str), Some("sk-up"));
        assert!(diff.auth_replaced);

        let (outbound2, _) = compensate(
            &inbound,
            RouteCapability::OpenaiChatCompatible,
            ProviderType::Openai,
            "sk-up2",
            &[],
            &[],
        );
        assert_eq!(
            outbound2.get("authorization").map(String::as_str),
            Some("Bearer sk-up2")
        );
    }

    #[test]
    fn compensates_missing_header_from_first_present_source() {
        let inbound = headers(&[("x-fallback-org", "org-1")]);
        let rules = vec![CompensationRule {
            capabilities: vec![RouteCapability::OpenaiChatCompatible],
            target_header: "openai-organization".to_string(),
            sources: vec!["x-org".to_string(), "x-fallback-org".to_string()],
            mode: CompensationMode::MissingOnly,
        }];
        let (outbound, diff) = compensate(
            &inbound,
            RouteCapability::OpenaiChatCompatible,
            ProviderType::Openai,
            "sk",
            &[],
            &rules,
        );
        assert_eq!(
            outbound.get("openai-organization").map(String::as_str),
            Some("org-1")
        );
        assert_eq!(diff.compensated, vec!["openai-organization".to_string()]);
    }

    #[test]
    fn missing_only_rule_skips_when_header_already_present() {
        let inbound = headers(&[("openai-organization", "org-existing"), ("x-org", "org-new")]);
        let rules = vec![CompensationRule {
            capabilities: vec![RouteCapability::OpenaiChatCompatible],
            target_header: "openai-organization".to_string(),
            sources: vec!["x-org".to_string()],
            mode: CompensationMode::MissingOnly,
        }];
        let (outbound, diff) = compensate(
            &inbound,
            RouteCapability::OpenaiChatCompatible,
            ProviderType::Openai,
            "sk",
            &[],
            &rules,
        );
        assert_eq!(
            outbound.get("openai-organization").map(String::as_str),
            Some("org-existing")
        );
        assert!(diff.compensated.is_empty());
    }

    #[test]
    fn redacted_header_names_are_case_insensitive() {
        assert!(is_redacted_header("Authorization"));
        assert!(is_redacted_header("X-API-KEY"));
        assert!(!is_redacted_header("x-trace-id"));
    }
}
