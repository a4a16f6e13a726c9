//! Retry with exponential backoff
//!
//! [`RetryPolicy::execute`] takes an operation, a predicate over its outcome,
//! and retries with a doubling delay until the predicate says stop or the
//! attempt budget is spent. Stage-specific rules live in the predicates.

use crate::client::ApiResponse;
use crate::config::PublisherOptions;
use apipub_common::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const CONFLICT: u16 = 409;

/// Backoff shape: `starting_delay * 2^(attempt - 1)`, at most `max_attempts` tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    starting_delay: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(starting_delay: Duration, max_attempts: u32) -> Self {
        Self {
            starting_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.starting_delay.saturating_mul(factor)
    }

    /// Whether another attempt is allowed after `attempt`.
    pub fn can_retry_after(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `operation` until `should_retry` rejects its outcome or attempts run out.
    ///
    /// The operation receives the 1-based attempt number. The last outcome is
    /// returned whether or not it succeeded.
    pub async fn execute<T, F, Fut, P>(&self, mut operation: F, should_retry: P) -> T
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = T>,
        P: Fn(&T) -> bool,
    {
        let mut attempt = 1;
        loop {
            let outcome = operation(attempt).await;

            if !self.can_retry_after(attempt) || !should_retry(&outcome) {
                return outcome;
            }

            let delay = self.delay_for(attempt);
            debug!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Retry policy plus the status codes treated as potentially transient.
#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub policy: RetryPolicy,
    transient_status_codes: Arc<[u16]>,
}

impl RetrySettings {
    pub fn new(policy: RetryPolicy, transient_status_codes: &[u16]) -> Self {
        Self {
            policy,
            transient_status_codes: transient_status_codes.into(),
        }
    }

    pub fn from_options(options: &PublisherOptions) -> Self {
        Self::new(
            RetryPolicy::new(options.retry_starting_delay(), options.max_retry_attempts),
            &options.transient_status_codes,
        )
    }

    pub fn is_transient(&self, status: u16) -> bool {
        self.transient_status_codes.contains(&status)
    }

    /// Retry transport errors and transient statuses, plus 409 when `retry_conflict`.
    pub fn should_retry_response(&self, outcome: &Result<ApiResponse>, retry_conflict: bool) -> bool {
        match outcome {
            Err(_) => true,
            Ok(response) => {
                let status = response.status_code();
                self.is_transient(status) || (retry_conflict && status == CONFLICT)
            },
        }
    }

    /// Execute an HTTP call under the shared retry shape.
    pub async fn send<F, Fut>(&self, operation: F, retry_conflict: bool) -> Result<ApiResponse>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<ApiResponse>>,
    {
        self.policy
            .execute(operation, |outcome| self.should_retry_response(outcome, retry_conflict))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delay_doubles_each_attempt() {
        let policy = RetryPolicy::new(Duration::from_millis(100), 5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::new(Duration::from_secs(1), 100);
        assert!(policy.delay_for(64) >= Duration::from_secs(u32::MAX as u64));
    }

    #[test]
    fn test_zero_attempts_still_tries_once() {
        assert_eq!(RetryPolicy::new(Duration::ZERO, 0).max_attempts(), 1);
    }

    #[tokio::test]
    async fn test_execute_stops_when_predicate_rejects() {
        let policy = RetryPolicy::new(Duration::from_millis(1), 5);
        let calls = AtomicU32::new(0);

        let result = policy
            .execute(
                |attempt| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { attempt }
                },
                |attempt| *attempt < 3,
            )
            .await;

        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_execute_respects_max_attempts() {
        let policy = RetryPolicy::new(Duration::from_millis(1), 4);
        let calls = AtomicU32::new(0);

        let result = policy
            .execute(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { "still failing" }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, "still failing");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_transient_classification() {
        let settings = RetrySettings::new(RetryPolicy::new(Duration::ZERO, 3), &[503, 429]);
        assert!(settings.is_transient(503));
        assert!(!settings.is_transient(400));
    }
}
