use std::time::Duration;

use rand::Rng;

use crate::error::Error;

/// Policy for reconnecting with exponential backoff.
///
/// Every attempt is a brand-new connection and handshake; attestation state
/// is never carried between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (excludes the initial attempt).
    pub max_retries: u32,
    /// Initial delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied to the delay after each attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that performs no retries (single attempt only).
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Compute the delay for the given attempt number (0-indexed).
    ///
    /// Applies exponential backoff with random jitter in [0.5x, 1.0x] of the
    /// computed delay, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up.
///
/// Attestation, protocol, and cryptographic failures are returned at once;
/// only timeouts, cancellation, closed sessions, and I/O errors are retried.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    let mut attempt = 0;
    loop {
        let err = match f().await {
            Ok(val) => return Ok(val),
            Err(e) => e,
        };
        if !err.is_retryable() {
            tracing::warn!(kind = ?err.kind(), "connection attempt failed permanently");
            return Err(err);
        }
        if attempt >= policy.max_retries {
            tracing::warn!(
                attempt = attempt + 1,
                kind = ?err.kind(),
                "final connection attempt failed"
            );
            return Err(err);
        }
        let delay = policy.delay_for_attempt(attempt);
        tracing::warn!(
            attempt = attempt + 1,
            max = policy.max_retries + 1,
            delay_ms = delay.as_millis() as u64,
            kind = ?err.kind(),
            "connection attempt failed, retrying"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
