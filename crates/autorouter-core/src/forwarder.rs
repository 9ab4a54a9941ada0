//! C10 — Forwarder (§4.10). Single attempt, no internal retry; streaming vs
//! buffered response handling and the per-chunk stall timeout are grounded
//! in the teacher's `WreqUpstreamClient`. SSE event-boundary parsing reuses
//! `autorouter_protocol::sse::SseParser` verbatim.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use autorouter_protocol::sse::SseParser;

use crate::error::ErrorCategory;

#[derive(Debug, Clone, Default)]
pub struct UsageSignal {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub cache_read_tokens: Option<u64>,
    pub cache_write_tokens: Option<u64>,
}

/// Extracts incremental usage from SSE event payloads it recognizes
/// (`message_delta`, `response.completed`), leaving others untouched. Called
/// once per assembled event as the stream is relayed.
pub fn accumulate_usage_from_event(existing: &mut UsageSignal, event_name: Option<&str>, data: &str) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
        return;
    };
    let usage = match event_name {
        Some("message_delta") | Some("message_stop") => value.get("usage"),
        _ => value.get("response").and_then(|r| r.get("usage")).or(value.get("usage")),
    };
    let Some(usage) = usage else { return };
    if let Some(v) = usage.get("input_tokens").and_then(|v| v.as_u64()) {
        existing.prompt_tokens = Some(v);
    }
    if let Some(v) = usage.get("output_tokens").and_then(|v| v.as_u64()) {
        existing.completion_tokens = Some(v);
    }
    if let Some(v) = usage.get("prompt_tokens").and_then(|v| v.as_u64()) {
        existing.prompt_tokens = Some(v);
    }
    if let Some(v) = usage.get("completion_tokens").and_then(|v| v.as_u64()) {
        existing.completion_tokens = Some(v);
    }
    if let Some(v) = usage
        .get("cache_read_input_tokens")
        .and_then(|v| v.as_u64())
    {
        existing.cache_read_tokens = Some(v);
    }
    if let Some(v) = usage
        .get("cache_creation_input_tokens")
        .and_then(|v| v.as_u64())
    {
        existing.cache_write_tokens = Some(v);
    }
}

pub enum ResponseBody {
    Buffered(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

/// Final usage/timing/abort state for a streamed response, only knowable
/// once the upstream body has fully drained (§4.10, §4.12). Delivered
/// out-of-band from the `ForwardOutcome` returned at response-header time
/// so the caller can start relaying bytes to the downstream connection
/// immediately instead of blocking on the whole stream.
pub struct StreamCompletion {
    pub usage: UsageSignal,
    pub ttft_ms: Option<u64>,
    pub aborted: bool,
}

pub struct ForwardOutcome {
    pub status_code: u16,
    pub response_headers: BTreeMap<String, String>,
    pub body: ResponseBody,
    pub ttft_ms: Option<u64>,
    pub usage: UsageSignal,
    pub error_category: Option<ErrorCategory>,
    pub aborted: bool,
    /// `Some` only for `ResponseBody::Stream` — resolves once the relay
    /// task finishes draining the upstream body.
    pub completion: Option<oneshot::Receiver<StreamCompletion>>,
}

pub struct ForwardRequest<'a> {
    pub method: &'a str,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Bytes,
    pub total_timeout: Duration,
    pub per_chunk_timeout: Duration,
}

/// A single forward attempt (§4.10). Streaming responses are relayed over a
/// bounded channel so the caller (C11/router) can start writing to the
/// downstream connection before the upstream finishes.
pub async fn forward(
    client: &wreq::Client,
    request: ForwardRequest<'_>,
    cancel: CancellationToken,
) -> ForwardOutcome {
    let method = match request.method.to_ascii_uppercase().as_str() {
        "GET" => wreq::Method::GET,
        _ => wreq::Method::POST,
    };

    let mut builder = client.request(method, &request.url).body(request.body);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let send_fut = builder.send();
    let response = tokio::select! {
        _ = cancel.cancelled() => {
            return aborted_outcome();
        }
        result = tokio::time::timeout(request.total_timeout, send_fut) => {
            match result {
                Err(_) => return error_outcome(ErrorCategory::Timeout, 0),
                Ok(Err(_)) => return error_outcome(ErrorCategory::ConnectionError, 0),
                Ok(Ok(resp)) => resp,
            }
        }
    };

    let status_code = response.status().as_u16();
    let response_headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let is_sse = response_headers
        .get("content-type")
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    let category = status_category(status_code);

    if !is_sse {
        let body = match tokio::time::timeout(request.per_chunk_timeout, response.bytes()).await {
            Ok(Ok(bytes)) => bytes,
            _ => return error_outcome(ErrorCategory::Timeout, status_code),
        };
        return ForwardOutcome {
            status_code,
            response_headers,
            body: ResponseBody::Buffered(bytes::Bytes::from(body.to_vec())),
            ttft_ms: None,
            usage: UsageSignal::default(),
            error_category: category,
            aborted: false,
            completion: None,
        };
    }

    // The relay loop runs on its own task so the channel has a consumer
    // the moment this function returns: draining `rx` inline here (or
    // simply awaiting the relay before returning) would mean nothing
    // reads from the bounded channel until the caller gets the receiver
    // back, which deadlocks the moment the upstream emits more than the
    // channel's capacity before closing.
    let (tx, rx) = mpsc::channel::<Bytes>(64);
    let (completion_tx, completion_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (usage, ttft_ms, aborted) =
            relay_sse_stream(response, tx, request.per_chunk_timeout, cancel).await;
        let _ = completion_tx.send(StreamCompletion {
            usage,
            ttft_ms,
            aborted,
        });
    });

    ForwardOutcome {
        status_code,
        response_headers,
        body: ResponseBody::Stream(rx),
        ttft_ms: None,
        usage: UsageSignal::default(),
        error_category: category,
        aborted: false,
        completion: Some(completion_rx),
    }
}

async fn relay_sse_stream(
    response: wreq::Response,
    tx: mpsc::Sender<Bytes>,
    per_chunk_timeout: Duration,
    cancel: CancellationToken,
) -> (UsageSignal, Option<u64>, bool) {
    let started = std::time::Instant::now();
    let mut ttft_ms = None;
    let mut usage = UsageSignal::default();
    let mut parser = SseParser::new();
    let mut stream = response.bytes_stream();
    let mut aborted = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                aborted = true;
                break;
            }
            chunk = tokio::time::timeout(per_chunk_timeout, stream.next()) => {
                match chunk {
                    Err(_) => break,
                    Ok(None) => break,
                    Ok(Some(Err(_))) => break,
                    Ok(Some(Ok(bytes))) => {
                        let bytes = Bytes::from(bytes.to_vec());
                        if ttft_ms.is_none() && !bytes.is_empty() {
                            ttft_ms = Some(started.elapsed().as_millis() as u64);
                        }
                        for event in parser.push_bytes(&bytes) {
                            accumulate_usage_from_event(&mut usage, event.event.as_deref(), &event.data);
                        }
                        if tx.send(bytes).await.is_err() {
                            aborted = true;
                            break;
                        }
                    }
                }
            }
        }
    }

    for event in parser.finish() {
        accumulate_usage_from_event(&mut usage, event.event.as_deref(), &event.data);
    }

    (usage, ttft_ms, aborted)
}

fn status_category(status_code: u16) -> Option<ErrorCategory> {
    match status_code {
        200..=299 => None,
        429 => Some(ErrorCategory::Http429),
        500..=599 => Some(ErrorCategory::Http5xx),
        400..=499 => Some(ErrorCategory::Http4xx),
        _ => None,
    }
}

fn error_outcome(category: ErrorCategory, status_code: u16) -> ForwardOutcome {
    ForwardOutcome {
        status_code,
        response_headers: BTreeMap::new(),
        body: ResponseBody::Buffered(Bytes::new()),
        ttft_ms: None,
        usage: UsageSignal::default(),
        error_category: Some(category),
        aborted: false,
        completion: None,
    }
}

fn aborted_outcome() -> ForwardOutcome {
    ForwardOutcome {
        status_code: 0,
        response_headers: BTreeMap::new(),
        body: ResponseBody::Buffered(Bytes::new()),
        ttft_ms: None,
        usage: UsageSignal::default(),
        error_category: Some(ErrorCategory::Aborted),
        aborted: true,
        completion: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_category_classifies_ranges() {
        assert_eq!(status_category(200), None);
        assert_eq!(status_category(429), Some(ErrorCategory::Http429));
        assert_eq!(status_category(503), Some(ErrorCategory::Http5xx));
        assert_eq!(status_category(404), Some(ErrorCategory::Http4xx));
    }

    #[test]
    fn accumulate_usage_reads_message_delta_event() {
        let mut usage = UsageSignal::default();
        accumulate_usage_from_event(
            &mut usage,
            Some("message_delta"),
            r#"{"usage":{"output_tokens":42}}"#,
        );
        assert_eq!(usage.completion_tokens, Some(42));
    }

    #[test]
    fn accumulate_usage_ignores_unparseable_payload() {
        let mut usage = UsageSignal::default();
        accumulate_usage_from_event(&mut usage, Some("ping"), "not json");
        assert!(usage.completion_tokens.is_none());
    }
}
