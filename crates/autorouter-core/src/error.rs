//! Dispatch error taxonomy (§7). `DispatchError` is the engine's own type;
//! the HTTP-status/body mapping and provider-shaped error bodies live at the
//! router boundary, which is the only place that knows about `axum`.

use thiserror::Error;

use crate::data::UpstreamId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Timeout,
    ConnectionError,
    Http5xx,
    Http4xx,
    Http429,
    CircuitOpen,
    Aborted,
}

impl ErrorCategory {
    /// Whether this category drives the C11 attempt loop to try the next
    /// candidate (§7: all rows except excluded_status/unauthorized/etc.).
    pub fn triggers_failover(self) -> bool {
        !matches!(self, ErrorCategory::Aborted | ErrorCategory::CircuitOpen)
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("no candidate upstream available for this key and capability")]
    Forbidden,

    #[error("unrecognized route or malformed body: {0}")]
    ProtocolError(String),

    #[error("all candidate upstreams exhausted after {attempts} attempt(s)")]
    AllUpstreamsFailed {
        attempts: u32,
        last_category: Option<ErrorCategory>,
    },

    #[error("downstream cancelled the request")]
    Aborted,

    #[error("all candidates excluded by circuit breaker")]
    CircuitOpen { upstream_ids: Vec<UpstreamId> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aborted_and_circuit_open_do_not_trigger_failover() {
        assert!(!ErrorCategory::Aborted.triggers_failover());
        assert!(!ErrorCategory::CircuitOpen.triggers_failover());
        assert!(ErrorCategory::Http5xx.triggers_failover());
        assert!(ErrorCategory::Http429.triggers_failover());
    }
}
