use std::time::Duration;

use weblogic_operator_common::wait::backoff_full_jitter;

/// The cap fed into the full-jitter backoff calculation regardless of how
/// many attempts have accumulated, so a long-failing domain never waits
/// longer than five minutes between retries.
const BACKOFF_CAP: Duration = Duration::from_secs(300);

/// Outcome of consulting the Retry/Backoff Controller after an
/// `onThrowable` from a make-right fiber (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub should_retry: bool,
    pub delay: Duration,
}

/// Decides whether a make-right failure should be retried and after how
/// long. `failure_count` is the count *after* incrementing for this
/// failure; once it exceeds `max_failure_retries`, retries stop until a
/// spec change produces a fresh `decide()` run with `cached == None` or a
/// changed `spec`.
///
/// The base delay (`failureRetrySeconds`) seeds a full-jitter exponential
/// backoff keyed on the attempt number, rather than a fixed sleep on
/// every attempt, matching how the rest of the corpus backs off
/// (`weblogic_operator_common::wait::backoff_full_jitter`).
pub fn decide_retry(failure_count: u32, max_failure_retries: u32, base_delay: Duration) -> RetryDecision {
    if failure_count > max_failure_retries {
        return RetryDecision { should_retry: false, delay: Duration::ZERO };
    }
    let attempt = failure_count.saturating_sub(1) as usize;
    let delay = backoff_full_jitter(base_delay, BACKOFF_CAP, attempt);
    RetryDecision { should_retry: true, delay }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retries_while_failure_count_is_within_budget() {
        let decision = decide_retry(1, 5, Duration::from_secs(10));
        assert!(decision.should_retry);
        assert!(decision.delay <= Duration::from_secs(10));
    }

    #[test]
    fn stops_once_failure_count_exceeds_the_budget() {
        let decision = decide_retry(6, 5, Duration::from_secs(10));
        assert!(!decision.should_retry);
        assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn at_the_budget_boundary_a_retry_still_runs() {
        let decision = decide_retry(5, 5, Duration::from_secs(10));
        assert!(decision.should_retry);
    }

    #[test]
    fn backoff_grows_with_attempt_but_stays_under_the_cap() {
        let early = decide_retry(1, 10, Duration::from_secs(10));
        let late = decide_retry(8, 10, Duration::from_secs(10));
        assert!(late.delay <= BACKOFF_CAP);
        assert!(early.delay <= BACKOFF_CAP);
    }
}
