use crate::core::error::ServiceError;
use anyhow::Result;
use log::warn;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: usize, delay_seconds: u64) -> Self {
        Self {
            max_attempts: retry_count.max(1),
            base_delay: Duration::from_secs(delay_seconds),
        }
    }

    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: Duration::ZERO,
        }
    }

    fn backoff(&self, attempt: usize) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(6))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 2)
    }
}

/// What to do with a failed attempt.
pub(crate) enum Verdict {
    GiveUp,
    RetryAfter(Duration),
}

pub(crate) fn judge(err: &anyhow::Error, policy: &RetryPolicy, attempt: usize) -> Verdict {
    match err.downcast_ref::<ServiceError>() {
        Some(ServiceError::Rejected(_)) => Verdict::GiveUp,
        Some(ServiceError::RateLimited {
            retry_after: Some(hint),
            ..
        }) => Verdict::RetryAfter((*hint).max(policy.backoff(attempt))),
        _ => Verdict::RetryAfter(policy.backoff(attempt)),
    }
}

/// Runs `op` until it succeeds, the error is a rejection, or the attempt
/// budget is spent. Returns the last error.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(e.context(format!("{} failed after {} attempts", label, attempt)));
                }
                match judge(&e, policy, attempt - 1) {
                    Verdict::GiveUp => return Err(e),
                    Verdict::RetryAfter(delay) => {
                        warn!(
                            "{} failed (attempt {}/{}): {:#}. Retrying in {:?}",
                            label, attempt, policy.max_attempts, e, delay
                        );
                        sleep(delay).await;
                    }
                }
            }
        }
    }
}
