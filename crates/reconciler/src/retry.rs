use crate::clock::Clock;
use crate::error::{ApiError, Error};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Retry policy for control-plane calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the initial attempt (1 => no retries).
    pub maximum_attempts: u32,
    /// Initial backoff interval in milliseconds (before the first retry).
    pub initial_interval_ms: u64,
    /// Backoff multiplier (typically >= 1.0).
    pub backoff_coefficient: f64,
    /// Optional maximum interval between retries in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_interval_ms: Option<u64>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            maximum_attempts: 3,
            initial_interval_ms: 500,
            backoff_coefficient: 2.0,
            maximum_interval_ms: Some(5_000),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after a failed `attempt` (1-based) before the next one.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(30);
        let coeff = self.backoff_coefficient;
        if !coeff.is_finite() || coeff <= 0.0 {
            return Duration::ZERO;
        }
        let mult = coeff.powi(i32::try_from(exp).unwrap_or(30));
        if !mult.is_finite() || mult <= 0.0 {
            return Duration::ZERO;
        }

        let mut d = Duration::from_millis(self.initial_interval_ms).mul_f64(mult);
        if let Some(max_ms) = self.maximum_interval_ms {
            d = d.min(Duration::from_millis(max_ms));
        }
        d
    }
}

/// Runs control-plane calls under a [`RetryPolicy`], retrying only transient failures.
#[derive(Clone)]
pub struct Retrier {
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
}

impl Retrier {
    #[must_use]
    pub fn new(policy: RetryPolicy, clock: Arc<dyn Clock>, cancel: CancellationToken) -> Self {
        Self {
            policy,
            clock,
            cancel,
        }
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run `op` until it succeeds, fails permanently, or the attempt budget is spent.
    ///
    /// # Errors
    ///
    /// Returns the classified failure with `step` and `resource` attached, or
    /// `Error::Cancelled` if the cancellation token fires between attempts.
    pub async fn run<T, F, Fut>(
        &self,
        step: &'static str,
        resource: &str,
        mut op: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let max_attempts = self.policy.maximum_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled {
                    step,
                    resource: resource.to_string(),
                });
            }

            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= max_attempts {
                if err.is_transient() {
                    tracing::warn!(
                        step,
                        resource,
                        attempt,
                        error = %err,
                        "giving up after transient errors"
                    );
                }
                return Err(Error::from_api(step, resource, attempt, err));
            }

            let delay = self.policy.delay_after(attempt);
            tracing::debug!(
                step,
                resource,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "transient control-plane error, retrying"
            );
            tokio::select! {
                () = self.cancel.cancelled() => {
                    return Err(Error::Cancelled { step, resource: resource.to_string() });
                }
                () = self.clock.sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }
}
