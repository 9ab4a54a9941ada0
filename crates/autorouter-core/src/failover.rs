//! C11 — Failover Controller (§4.11). Orchestrates the C9+C10 attempt loop
//! over candidates selected by C6/C8, updating C3/C4 on each outcome. Error
//! classification shape is grounded in the teacher's status/transport-kind
//! → retry-duration mapping, generalized to the spec's richer error taxonomy.

use std::collections::HashSet;

use time::OffsetDateTime;

use crate::data::UpstreamId;
use crate::error::ErrorCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverStrategy {
    ExhaustAll,
    MaxAttempts { max_attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub upstream_id: UpstreamId,
    pub attempted_at: OffsetDateTime,
    pub error_type: Option<ErrorCategory>,
    pub status_code: Option<u16>,
}

/// `shouldTriggerFailover(statusCode, config)` (§4.11 step 4). A response
/// that isn't 2xx and isn't in `exclude_status_codes` is treated as a
/// failure worth retrying.
pub fn should_trigger_failover(status_code: u16, exclude_status_codes: &HashSet<u16>) -> bool {
    if (200..300).contains(&status_code) {
        return false;
    }
    !exclude_status_codes.contains(&status_code)
}

/// `shouldContinueFailover(attemptCount, hasMoreCandidates, config,
/// cancelled)` (§4.11 step 5).
pub fn should_continue_failover(
    attempt_count: u32,
    has_more_candidates: bool,
    strategy: FailoverStrategy,
    cancelled: bool,
) -> bool {
    if cancelled || !has_more_candidates {
        return false;
    }
    match strategy {
        FailoverStrategy::ExhaustAll => true,
        FailoverStrategy::MaxAttempts { max_attempts } => attempt_count < max_attempts,
    }
}

/// Removes the just-attempted upstream from the candidate pool so the next
/// selector call can't repeat it within the same priority group (§4.11 step 6).
pub fn remove_attempted(candidates: &mut Vec<UpstreamId>, attempted: UpstreamId) {
    candidates.retain(|id| *id != attempted);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_xx_never_triggers_failover() {
        assert!(!should_trigger_failover(200, &HashSet::new()));
        assert!(!should_trigger_failover(204, &HashSet::new()));
    }

    #[test]
    fn excluded_status_does_not_trigger_failover() {
        assert!(!should_trigger_failover(400, &HashSet::from([400])));
    }

    #[test]
    fn non_excluded_error_status_triggers_failover() {
        assert!(should_trigger_failover(503, &HashSet::from([400])));
        assert!(should_trigger_failover(429, &HashSet::from([400])));
    }

    #[test]
    fn exhaust_all_continues_while_candidates_remain() {
        assert!(should_continue_failover(
            1,
            true,
            FailoverStrategy::ExhaustAll,
            false
        ));
        assert!(!should_continue_failover(
            1,
            false,
            FailoverStrategy::ExhaustAll,
            false
        ));
    }

    #[test]
    fn max_attempts_stops_at_cap() {
        let strategy = FailoverStrategy::MaxAttempts { max_attempts: 2 };
        assert!(should_continue_failover(1, true, strategy, false));
        assert!(!should_continue_failover(2, true, strategy, false));
    }

    #[test]
    fn cancellation_always_stops() {
        assert!(!should_continue_failover(
            0,
            true,
            FailoverStrategy::ExhaustAll,
            true
        ));
    }

    #[test]
    fn remove_attempted_drops_only_matching_id() {
        let mut candidates = vec![1, 2, 3];
        remove_attempted(&mut candidates, 2);
        assert_eq!(candidates, vec![1, 3]);
    }
}
