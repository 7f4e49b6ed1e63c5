//! Retry policy shared by every network caller.
//!
//! A `RetryPolicy` bundles the number of additional attempts with a backoff
//! function. Transfers use the linear schedule (`attempt × base`); the
//! exponential schedule with jitter is available for other callers.

use crate::config::TransferConfig;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// No delay between attempts.
    None,
    /// `attempt_number × base` where the first retry is attempt 1.
    Linear { base: Duration },
    /// `base × factor^(attempt - 1)`, capped at `max`, optionally jittered.
    Exponential {
        base: Duration,
        max: Duration,
        factor: f64,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Linear { base } => base.saturating_mul(attempt),
            Backoff::Exponential {
                base,
                max,
                factor,
                jitter,
            } => {
                let multiplier = factor.powi(attempt.saturating_sub(1) as i32);
                let capped_secs = (base.as_secs_f64() * multiplier).min(max.as_secs_f64());

                let final_secs = if *jitter {
                    // Scale by 0.5..1.5 so the mean stays put without near-zero delays
                    let mut rng = rand::rng();
                    let jitter_factor = rng.random_range(0.5..1.5);
                    (capped_secs * jitter_factor).min(max.as_secs_f64())
                } else {
                    capped_secs
                };

                Duration::from_secs_f64(final_secs)
            }
        }
    }
}

/// Retry configuration: how many additional attempts and how long to wait.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts made after the first one fails.
    pub max_retries: u32,
    /// Delay schedule.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: TransferConfig::DEFAULT_RETRY_LIMIT,
            backoff: Backoff::Linear {
                base: TransferConfig::RETRY_BASE_DELAY,
            },
        }
    }
}

impl RetryPolicy {
    /// Create a policy with the default transfer settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::None,
        }
    }

    /// Set the number of additional attempts.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the backoff schedule.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

/// Statistics about a retried operation.
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total delay accumulated.
    pub total_delay: Duration,
    /// Whether the operation ultimately succeeded.
    pub success: bool,
    /// Last error message if failed.
    pub last_error: Option<String>,
}

/// Retry an async operation according to `policy`.
///
/// `should_retry` decides whether a given error is worth another attempt;
/// non-retryable errors return immediately.
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let max_attempts = policy.max_attempts();
    let mut attempt = 1;

    loop {
        stats.attempts = attempt;

        match operation(attempt).await {
            Ok(value) => {
                stats.success = true;
                if attempt > 1 {
                    debug!("Operation succeeded after {} attempts", attempt);
                }
                return (Ok(value), stats);
            }
            Err(e) => {
                stats.last_error = Some(e.to_string());

                if !should_retry(&e) {
                    debug!("Error is not retryable: {}", e);
                    return (Err(e), stats);
                }

                if attempt >= max_attempts {
                    warn!(
                        "All {} attempts exhausted. Last error: {}",
                        max_attempts, e
                    );
                    return (Err(e), stats);
                }

                let delay = policy.backoff.delay(attempt);
                stats.total_delay += delay;

                warn!(
                    "Attempt {}/{} failed: {}. Retrying in {:?}",
                    attempt, max_attempts, e, delay
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_linear_delay() {
        let backoff = Backoff::Linear {
            base: Duration::from_secs(1),
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(1));
        assert_eq!(backoff.delay(2), Duration::from_secs(2));
        assert_eq!(backoff.delay(3), Duration::from_secs(3));
    }

    #[test]
    fn test_exponential_delay_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(10),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: false,
        };
        assert_eq!(backoff.delay(1), Duration::from_secs(10));
        assert_eq!(backoff.delay(2), Duration::from_secs(20));
        // 10 * 2^3 = 80s, capped at 30s
        assert_eq!(backoff.delay(4), Duration::from_secs(30));
    }

    #[test]
    fn test_exponential_delay_with_jitter() {
        let backoff = Backoff::Exponential {
            base: Duration::from_secs(2),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: true,
        };
        for _ in 0..20 {
            let delay = backoff.delay(1);
            assert!(
                delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3),
                "Delay {:?} should be between 1s and 3s",
                delay
            );
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 2);
        assert_eq!(policy.max_attempts(), 3);
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let policy = RetryPolicy::new();

        let (result, stats) =
            retry_async(&policy, |_| async { Ok::<_, String>(42) }, |_: &String| true).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 1);
        assert!(stats.success);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let policy = RetryPolicy::new().with_backoff(Backoff::Linear {
            base: Duration::from_millis(5),
        });

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, stats) = retry_async(
            &policy,
            |_| {
                let counter = counter_clone.clone();
                async move {
                    let count = counter.fetch_add(1, Ordering::SeqCst);
                    if count < 2 {
                        Err("temporary failure".to_string())
                    } else {
                        Ok(42)
                    }
                }
            },
            |_: &String| true,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 3);
        assert_eq!(stats.total_delay, Duration::from_millis(15));
    }

    #[tokio::test]
    async fn test_retry_exhausted_makes_limit_plus_one_attempts() {
        let policy = RetryPolicy::new()
            .with_max_retries(2)
            .with_backoff(Backoff::None);

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let (result, stats) = retry_async(
            &policy,
            |_| {
                counter_clone.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>("always fails".to_string()) }
            },
            |_: &String| true,
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(stats.attempts, 3);
        assert!(!stats.success);
        assert_eq!(stats.last_error, Some("always fails".to_string()));
    }

    #[tokio::test]
    async fn test_retry_non_retryable_error() {
        let policy = RetryPolicy::new();

        let (result, stats) = retry_async(
            &policy,
            |_| async { Err::<i32, _>("permanent failure".to_string()) },
            |e: &String| !e.contains("permanent"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(stats.attempts, 1);
    }
}
