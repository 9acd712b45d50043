//! Reconciliation primitives.
//!
//! Helpers shared by the controller's provisioning steps and status writes:
//!
//! - **Bounded polling**: wait until an external condition holds, or give up
//!   after a deadline (`poll_until`).
//! - **Fixed-interval retry**: drive an operation that must eventually land,
//!   such as recording a failure on the resource (`FixedRetry`).
//! - **Errors**: the common vocabulary for reconciliation failures.
//!
//! # Invariants
//!
//! - A poll never runs its check more often than once per interval
//! - A poll that times out has checked at least once
//! - Conflicts are never terminal; callers re-read and retry

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Reconciliation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// Resource not found.
    #[error("resource not found: {0}")]
    NotFound(String),

    /// Write was based on a stale version of the resource.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ReconcileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

// =============================================================================
// Bounded Poller
// =============================================================================

/// Default interval between readiness checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Default upper bound on a single readiness wait.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Polling policy for a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay before each check.
    pub interval: Duration,

    /// Give up once this much time has elapsed.
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Why a bounded poll stopped without a value.
#[derive(Debug, Error)]
pub enum PollError<E> {
    /// The condition never held within the policy's timeout.
    #[error("timeout after {elapsed:?} ({attempts} checks) waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
        attempts: u32,
    },

    /// The check itself failed; polling stops immediately.
    #[error("check failed while waiting for {resource}: {error}")]
    Check { resource: String, error: E },
}

impl<E> PollError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

impl<E: Display> From<PollError<E>> for ReconcileError {
    fn from(err: PollError<E>) -> Self {
        match err {
            PollError::Timeout {
                resource, elapsed, ..
            } => ReconcileError::Timeout { resource, elapsed },
            PollError::Check { resource, error } => {
                ReconcileError::Internal(format!("{resource}: {error}"))
            }
        }
    }
}

/// Wait until `check` yields a value.
///
/// Each round sleeps for `policy.interval` and then runs `check`:
/// - `Ok(Some(v))` ends the poll with `v`;
/// - `Ok(None)` means "not yet";
/// - `Err(e)` aborts the poll with `PollError::Check`.
///
/// The poll times out once another interval would overrun `policy.timeout`.
pub async fn poll_until<T, E, F, Fut>(
    resource: &str,
    policy: &PollPolicy,
    mut check: F,
) -> Result<T, PollError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, E>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts = 0u32;

    loop {
        tokio::time::sleep(policy.interval).await;
        attempts += 1;

        match check().await {
            Ok(Some(value)) => {
                debug!(resource, attempts, "Condition satisfied");
                return Ok(value);
            }
            Ok(None) => {}
            Err(error) => {
                return Err(PollError::Check {
                    resource: resource.to_string(),
                    error,
                })
            }
        }

        if Instant::now() + policy.interval > deadline {
            return Err(PollError::Timeout {
                resource: resource.to_string(),
                elapsed: started.elapsed(),
                attempts,
            });
        }

        debug!(resource, attempts, "Condition not met yet");
    }
}

// =============================================================================
// Fixed-interval retry
// =============================================================================

/// Default delay between status write attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Default interval between periodic reconciliation ticks.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(8);

/// Unbounded retry at a fixed interval, no backoff.
///
/// The first attempt runs immediately; `wait()` sleeps before every later one.
#[derive(Debug, Clone)]
pub struct FixedRetry {
    interval: Duration,
    attempts: u32,
}

impl FixedRetry {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            attempts: 0,
        }
    }

    /// Number of attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Mark the start of an attempt, sleeping first unless it is the first.
    pub async fn next_attempt(&mut self) -> u32 {
        if self.attempts > 0 {
            tokio::time::sleep(self.interval).await;
        }
        self.attempts += 1;
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> PollPolicy {
        PollPolicy::new(Duration::from_millis(5), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_poll_returns_once_ready() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let value: Result<&str, PollError<String>> = poll_until("datastore", &fast_policy(), || {
            let c = Arc::clone(&c);
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(if n >= 3 { Some("ready") } else { None })
            }
        })
        .await;

        assert_eq!(value.unwrap(), "ready");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let policy = PollPolicy::new(Duration::from_millis(10), Duration::from_millis(35));
        let result: Result<(), PollError<String>> =
            poll_until("endpoint", &policy, || async { Ok(None) }).await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        match err {
            PollError::Timeout { attempts, .. } => assert!((1..=4).contains(&attempts)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_poll_check_error_aborts() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&calls);

        let result: Result<(), PollError<String>> = poll_until("datastore", &fast_policy(), || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            }
        })
        .await;

        assert!(matches!(result, Err(PollError::Check { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_poll_error_into_reconcile_error() {
        let err: ReconcileError = PollError::<String>::Timeout {
            resource: "db1-etcd".to_string(),
            elapsed: Duration::from_secs(1800),
            attempts: 360,
        }
        .into();
        assert_eq!(
            err,
            ReconcileError::Timeout {
                resource: "db1-etcd".to_string(),
                elapsed: Duration::from_secs(1800)
            }
        );
    }

    #[test]
    fn test_default_policy() {
        let policy = PollPolicy::default();
        assert_eq!(policy.interval, Duration::from_secs(5));
        assert_eq!(policy.timeout, Duration::from_secs(1800));
    }

    #[tokio::test]
    async fn test_fixed_retry_first_attempt_is_immediate() {
        let mut retry = FixedRetry::new(Duration::from_secs(60));
        let started = std::time::Instant::now();
        assert_eq!(retry.next_attempt().await, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_fixed_retry_sleeps_between_attempts() {
        let mut retry = FixedRetry::new(Duration::from_millis(20));
        retry.next_attempt().await;
        let started = std::time::Instant::now();
        retry.next_attempt().await;
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(retry.attempts(), 2);
    }
}
