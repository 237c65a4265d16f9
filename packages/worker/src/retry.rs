//! Bounded retry with jittered exponential backoff.

use std::future::Future;
use std::time::Duration;

use chirps_cog_config::PipelineConfig;
use rand::Rng as _;

/// Result of a single attempt.
#[derive(Debug)]
pub enum AttemptOutcome<T, E> {
    /// The attempt succeeded.
    Ok(T),
    /// The attempt failed but a later one may succeed.
    Retryable(E),
    /// The attempt failed and retrying is pointless.
    Fatal(E),
}

impl<T, E> AttemptOutcome<T, E> {
    /// Tags a result, asking `is_retryable` about errors.
    pub fn classify(result: Result<T, E>, is_retryable: impl FnOnce(&E) -> bool) -> Self {
        match result {
            Ok(value) => Self::Ok(value),
            Err(e) if is_retryable(&e) => Self::Retryable(e),
            Err(e) => Self::Fatal(e),
        }
    }
}

/// The error of the last attempt, once retries are exhausted or a fatal
/// error was seen.
#[derive(Debug)]
pub struct RetryFailure<E> {
    /// Error of the final attempt.
    pub error: E,
    /// Attempts made, including the final one.
    pub attempts: u32,
}

/// How many attempts to make and how long to wait between them.
///
/// The wait after the attempt numbered `n` (starting at 0) is
/// `uniform[base_delay_min, base_delay_max) × 2^n`, capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Lower bound of the jittered base delay.
    pub base_delay_min: Duration,
    /// Upper bound of the jittered base delay.
    pub base_delay_max: Duration,
    /// Upper bound of any single wait.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Builds the policy from `max_retries` and the `[retry]` table.
    #[must_use]
    pub const fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            base_delay_min: Duration::from_millis(config.retry.base_delay_min_ms),
            base_delay_max: Duration::from_millis(config.retry.base_delay_max_ms),
            max_delay: Duration::from_secs(config.retry.max_delay_secs),
        }
    }

    /// A policy that retries without waiting.
    #[must_use]
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_min: Duration::ZERO,
            base_delay_max: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Wait before the attempt after `attempt` (0-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let min = self.base_delay_min.as_secs_f64();
        let max = self.base_delay_max.as_secs_f64();
        let base = if max > min {
            rand::thread_rng().gen_range(min..max)
        } else {
            min
        };

        let factor = f64::from(2u32.saturating_pow(attempt));
        let capped = (base * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Calls `attempt_fn` with the attempt number until it succeeds, fails
    /// fatally, or `max_attempts` attempts have been made.
    ///
    /// At least one attempt is always made.
    ///
    /// # Errors
    ///
    /// Returns [`RetryFailure`] carrying the last error.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut attempt_fn: F) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match attempt_fn(attempt).await {
                AttemptOutcome::Ok(value) => return Ok(value),
                AttemptOutcome::Fatal(error) => {
                    log::warn!("  {label}: {error} (not retrying)");
                    return Err(RetryFailure {
                        error,
                        attempts: attempt + 1,
                    });
                }
                AttemptOutcome::Retryable(error) => {
                    if attempt + 1 >= max_attempts {
                        log::warn!("  {label}: {error} (giving up after {max_attempts} attempts)");
                        return Err(RetryFailure {
                            error,
                            attempts: attempt + 1,
                        });
                    }

                    let delay = self.delay_after(attempt);
                    log::warn!(
                        "  {label}: attempt {}/{max_attempts} failed: {error}, retrying in {delay:.1?}",
                        attempt + 1
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }
}
