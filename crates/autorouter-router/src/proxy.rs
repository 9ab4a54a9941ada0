//! Generic proxy surface (§2, §6.1): every inbound request is turned into a
//! `DispatchRequest` and handed to `autorouter_core::dispatch` verbatim —
//! there is no per-provider route table here, since C7 already owns the
//! path -> capability mapping. Response shaping (buffered vs. streamed body,
//! provider-facing error JSON) is the one thing this crate owns that the
//! engine doesn't, grounded in the teacher's `proxy_auth` downstream relay
//! (`gproxy-router::proxy`), which also turns an inner response body into a
//! channel-backed stream before handing it back to axum.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use autorouter_core::engine::{self, DispatchContext, DispatchRequest, DispatchResponse};
use autorouter_core::error::{DispatchError, ErrorCategory};
use autorouter_core::forwarder::ResponseBody;

#[derive(Clone)]
pub struct ProxyState {
    pub ctx: Arc<DispatchContext>,
}

pub fn proxy_router(ctx: Arc<DispatchContext>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .fallback(handle)
        .with_state(ProxyState { ctx })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(state): State<ProxyState>) -> impl IntoResponse {
    if state.ctx.app.registry.load().upstreams.is_empty() {
        (StatusCode::SERVICE_UNAVAILABLE, "no upstreams configured").into_response()
    } else {
        (StatusCode::OK, "ready").into_response()
    }
}

/// Every non-reserved path lands here regardless of method; C7 rejects what
/// it doesn't recognize with `DispatchError::ProtocolError`.
async fn handle(
    State(state): State<ProxyState>,
    method: axum::http::Method,
    uri: axum::http::Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let path_model_segment = extract_path_model_segment(&path);
    let request_id =
        headers_get(&headers, "x-request-id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let cancel = CancellationToken::new();

    let req = DispatchRequest {
        method: method.as_str().to_string(),
        path: path.clone(),
        headers: flatten_headers(&headers),
        body,
        path_model_segment,
        request_id,
        cancel,
    };

    match engine::dispatch(&state.ctx, req).await {
        Ok(resp) => into_axum_response(resp),
        Err(err) => error_response(&err, &path),
    }
}

fn flatten_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn headers_get(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

/// Gemini routes carry the model in the path rather than the body
/// (`/v1/models/{model}:generateContent`, `/v1beta/models/{name}:streamGenerateContent`).
fn extract_path_model_segment(path: &str) -> Option<String> {
    let idx = path.find("/models/")?;
    let rest = &path[(idx + "/models/".len())..];
    let rest = rest.split('?').next().unwrap_or(rest);
    let (model, action) = rest.rsplit_once(':')?;
    if model.is_empty() || action.is_empty() {
        return None;
    }
    Some(model.to_string())
}

fn into_axum_response(resp: DispatchResponse) -> Response {
    let mut builder = Response::builder().status(
        StatusCode::from_u16(resp.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );
    for (name, value) in &resp.headers {
        builder = builder.header(name, value);
    }

    match resp.body {
        ResponseBody::Buffered(bytes) => builder
            .body(Body::from(bytes))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
        ResponseBody::Stream(rx) => {
            let stream = tokio_stream::wrappers::ReceiverStream::new(rx).map(Ok::<_, Infallible>);
            builder
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// Maps `DispatchError` onto transport status + a minimal JSON error body
/// (§7: the engine owns the taxonomy, the router owns the wire shape).
fn error_response(err: &DispatchError, path: &str) -> Response {
    let (status, kind, message) = match err {
        DispatchError::Unauthorized => (
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid or missing credential".to_string(),
        ),
        DispatchError::Forbidden => (
            StatusCode::FORBIDDEN,
            "forbidden",
            "no upstream available for this key and capability".to_string(),
        ),
        DispatchError::ProtocolError(detail) => {
            (StatusCode::BAD_REQUEST, "protocol_error", detail.clone())
        }
        DispatchError::CircuitOpen { upstream_ids } => (
            StatusCode::SERVICE_UNAVAILABLE,
            "circuit_open",
            format!("all candidate upstreams are circuit-open: {upstream_ids:?}"),
        ),
        DispatchError::AllUpstreamsFailed {
            attempts,
            last_category,
        } => (
            StatusCode::BAD_GATEWAY,
            "upstream_exhausted",
            format!(
                "all candidate upstreams failed after {attempts} attempt(s){}",
                last_category
                    .map(|c| format!(": {}", category_label(c)))
                    .unwrap_or_default()
            ),
        ),
        DispatchError::Aborted => (
            StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
            "aborted",
            "downstream cancelled the request".to_string(),
        ),
    };

    tracing::warn!(path, status = status.as_u16(), kind, "dispatch failed");
    (
        status,
        Json(serde_json::json!({
            "error": {
                "type": kind,
                "message": message,
            }
        })),
    )
        .into_response()
}

fn category_label(category: ErrorCategory) -> &'static str {
    match category {
        ErrorCategory::Timeout => "timeout",
        ErrorCategory::ConnectionError => "connection_error",
        ErrorCategory::Http5xx => "http_5xx",
        ErrorCategory::Http4xx => "http_4xx",
        ErrorCategory::Http429 => "http_429",
        ErrorCategory::CircuitOpen => "circuit_open",
        ErrorCategory::Aborted => "aborted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_gemini_path_model_segment() {
        assert_eq!(
            extract_path_model_segment("/v1beta/models/gemini-1.5-pro:streamGenerateContent"),
            Some("gemini-1.5-pro".to_string())
        );
    }

    #[test]
    fn non_gemini_paths_have_no_model_segment() {
        assert_eq!(extract_path_model_segment("/v1/messages"), None);
    }

    #[test]
    fn malformed_model_segment_is_rejected() {
        assert_eq!(extract_path_model_segment("/v1/models/:generateContent"), None);
    }
}
