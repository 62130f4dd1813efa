//! Reconciliation loop primitives.
//!
//! This library provides helpers shared by the scheduling engine and the
//! machine agent, both of which converge observed state towards desired state
//! stored in the registry. Key concepts:
//!
//! - **Desired state**: What the cluster should look like (target states, placements).
//! - **Observed state**: What the cluster actually looks like (agent reports).
//! - **Convergence**: The process of making observed match desired.
//!
//! # Invariants
//!
//! - Retries are bounded: every retry loop has an attempt cap and a delay cap
//! - Transient failures are retried; domain failures are returned immediately
//! - Backoff delays grow exponentially and never exceed the configured maximum

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Timeout waiting for convergence.
    #[error("timeout after {elapsed:?} waiting for {resource}")]
    Timeout {
        resource: String,
        elapsed: Duration,
    },

    /// Bounded retries exhausted.
    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
}

/// Convergence status for a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Resource has converged (observed matches desired).
    Converged,

    /// Resource is converging (observed is moving toward desired).
    Converging,

    /// Resource has diverged (requires intervention).
    Diverged,

    /// Status is unknown (insufficient data).
    Unknown,
}

impl ConvergenceStatus {
    /// Returns true if the resource has converged.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// Returns true if the resource is still converging.
    pub fn is_converging(&self) -> bool {
        matches!(self, Self::Converging)
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Backoff without jitter, useful for deterministic tests.
    pub fn fixed(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.0,
        }
    }

    /// Calculate delay for the given attempt number (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            (rand::random::<f64>() * 2.0 - 1.0) * jitter_range
        } else {
            0.0
        };

        let final_delay = (delay + jitter).clamp(0.0, self.max.as_millis() as f64);
        Duration::from_millis(final_delay as u64)
    }
}

/// Bounded retry configuration: a backoff curve plus an attempt cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay curve between attempts.
    pub backoff: BackoffPolicy,

    /// Total attempts, including the first one.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            backoff: BackoffPolicy::fixed(Duration::ZERO, Duration::ZERO),
            max_attempts: 1,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt cap is reached. The last error is returned on exhaustion.
pub async fn retry<T, E, F, Fut, P>(
    operation: &str,
    policy: &RetryPolicy,
    is_transient: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(&e) && attempt + 1 < max_attempts => {
                let delay = policy.backoff.delay(attempt);
                debug!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// =============================================================================
// Retry Tracker
// =============================================================================

/// Retry tracker for failed operations.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum retries per resource.
    max_retries: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true if retries are exhausted.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count += 1;
        *count > self.max_retries
    }

    /// Check if retries are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count > self.max_retries
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default full reconciliation sweep interval.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);

/// Default retry limit per resource within the retry window.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(10 * 60); // 10 minutes

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::default();

        let d0 = policy.delay(0);
        let d1 = policy.delay(1);
        let d2 = policy.delay(2);

        // Should increase exponentially (with some jitter variance)
        assert!(d0 < Duration::from_millis(200));
        assert!(d1 < Duration::from_millis(400));
        assert!(d2 < Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max() {
        let policy = BackoffPolicy::fixed(Duration::from_secs(1), Duration::from_secs(5));

        assert_eq!(policy.delay(0), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(5));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            backoff: BackoffPolicy::fixed(Duration::from_millis(10), Duration::from_millis(50)),
            max_attempts: 5,
        };

        let result: Result<u32, String> = retry(
            "flaky",
            &policy,
            |_| true,
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err("unavailable".to_string())
                } else {
                    Ok(n)
                }
            },
        )
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_at_cap() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            backoff: BackoffPolicy::fixed(Duration::from_millis(10), Duration::from_millis(50)),
            max_attempts: 3,
        };

        let result: Result<(), String> = retry(
            "down",
            &policy,
            |_| true,
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("unavailable".to_string())
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_does_not_retry_permanent_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), String> = retry(
            "permanent",
            &RetryPolicy::default(),
            |e: &String| e != "not found",
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("not found".to_string())
            },
        )
        .await;

        assert_eq!(result, Err("not found".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("resource-1")); // 1st
        assert!(!tracker.record_failure("resource-1")); // 2nd
        assert!(!tracker.record_failure("resource-1")); // 3rd
        assert!(tracker.record_failure("resource-1")); // 4th - exhausted

        assert!(tracker.is_exhausted("resource-1"));
        assert!(!tracker.is_exhausted("resource-2"));

        tracker.clear("resource-1");
        assert!(!tracker.is_exhausted("resource-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_tracker_window_resets() {
        let mut tracker = RetryTracker::new(1, Duration::from_secs(60));

        tracker.record_failure("unit");
        assert!(tracker.record_failure("unit"));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!tracker.is_exhausted("unit"));

        tracker.prune();
        assert!(!tracker.record_failure("unit"));
    }
}
