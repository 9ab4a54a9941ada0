//! Wire-level primitives shared by the dispatch engine: the closed set of
//! route capabilities, dynamic-JSON body accessors, and SSE framing.

pub mod sse;

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Closed set of provider-flavored wire contracts. Unmatched paths are a
/// protocol error, not a new variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteCapability {
    AnthropicMessages,
    CodexResponses,
    OpenaiChatCompatible,
    OpenaiExtended,
    GeminiNativeGenerate,
    GeminiCodeAssistInternal,
}

impl RouteCapability {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteCapability::AnthropicMessages => "anthropic_messages",
            RouteCapability::CodexResponses => "codex_responses",
            RouteCapability::OpenaiChatCompatible => "openai_chat_compatible",
            RouteCapability::OpenaiExtended => "openai_extended",
            RouteCapability::GeminiNativeGenerate => "gemini_native_generate",
            RouteCapability::GeminiCodeAssistInternal => "gemini_code_assist_internal",
        }
    }
}

impl std::fmt::Display for RouteCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed but still provider-opaque request body. The engine never needs
/// the full typed shape of a provider payload, only a handful of fields.
pub type Body = serde_json::Value;

/// Extract `model` from a body at the capability-appropriate location.
/// Anthropic/OpenAI chat+responses all carry it at the top-level `model`
/// field; Gemini's model instead comes from the URL path and is passed in
/// directly by the caller.
pub fn extract_model_from_body(body: &Body) -> Option<String> {
    body.get("model")?.as_str().map(str::to_string)
}

fn session_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"_session_([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12})",
        )
        .expect("static session id pattern is valid")
    })
}

/// `anthropic_messages` session id extraction: pulled out of
/// `metadata.user_id`, matched against the gateway's session-tagging
/// convention, lower-cased.
pub fn extract_anthropic_session_id(body: &Body) -> Option<String> {
    let user_id = body.get("metadata")?.get("user_id")?.as_str()?;
    let caps = session_regex().captures(user_id)?;
    Some(caps[1].to_ascii_lowercase())
}

/// `codex_responses` / `openai_chat_compatible` / `openai_extended` session
/// id extraction: a non-empty `session_id` header.
pub fn extract_header_session_id(session_id_header: Option<&str>) -> Option<String> {
    session_id_header
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_model_from_top_level_field() {
        let body = json!({"model": "claude-3-5-sonnet", "messages": []});
        assert_eq!(extract_model_from_body(&body).as_deref(), Some("claude-3-5-sonnet"));
    }

    #[test]
    fn extracts_and_lowercases_anthropic_session_id() {
        let body = json!({
            "metadata": {"user_id": "x_session_11111111-2222-3333-4444-555555555555"}
        });
        assert_eq!(
            extract_anthropic_session_id(&body).as_deref(),
            Some("11111111-2222-3333-4444-555555555555")
        );
    }

    #[test]
    fn rejects_malformed_session_tag() {
        let body = json!({"metadata": {"user_id": "not-a-session-tag"}});
        assert_eq!(extract_anthropic_session_id(&body), None);
    }

    #[test]
    fn header_session_id_trims_and_rejects_blank() {
        assert_eq!(extract_header_session_id(Some("  abc  ")).as_deref(), Some("abc"));
        assert_eq!(extract_header_session_id(Some("   ")), None);
        assert_eq!(extract_header_session_id(None), None);
    }
}
