use crate::metrics;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Delay schedule for repeated attempts against an unreliable remote.
#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    /// Exponential doubling from `min`, capped at `max`.
    Fixed { min: Duration, max: Duration },
    /// Exponential cap as in `Fixed`, then a uniform sample below the cap.
    /// Spreads concurrent retriers instead of synchronizing them.
    FullJitter { base: Duration, max: Duration },
}

impl Backoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed { min, max } => exponential(min, max, attempt),
            Backoff::FullJitter { base, max } => {
                let cap = exponential(base, max, attempt);
                if cap.is_zero() {
                    return cap;
                }
                let nanos = rand::rng().random_range(0..=cap.as_nanos() as u64);
                Duration::from_nanos(nanos)
            }
        }
    }
}

fn exponential(base: Duration, max: Duration, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << doublings).min(max)
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Policy with no delay between attempts. Test seam.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                min: Duration::ZERO,
                max: Duration::ZERO,
            },
        }
    }
}

/// Errors classify themselves: transient failures are worth another attempt,
/// anything else re-raises on the first occurrence.
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

/// Run `op` up to `policy.max_attempts` times, sleeping per the backoff between
/// transient failures. The last error is always surfaced to the caller; whether
/// to swallow it is the caller's decision, not ours.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, remote: &str, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_transient() || attempt >= attempts {
                    return Err(err);
                }
                warn!(
                    target = "mailroom.retry",
                    remote = remote,
                    attempt = attempt,
                    error = %err,
                    "remote_call_failed_backing_off"
                );
                metrics::retry_scheduled(remote, attempt);
                tokio::time::sleep(policy.backoff.delay(attempt)).await;
                attempt += 1;
            }
        }
    }
}
