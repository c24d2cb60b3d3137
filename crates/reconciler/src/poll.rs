use crate::clock::Clock;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Fixed-interval polling limits for status checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollSettings {
    pub interval_secs: u64,
    pub max_wait_secs: u64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            max_wait_secs: 300,
        }
    }
}

impl PollSettings {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

/// One polling loop's deadline, started at the first status check.
pub struct PollBudget {
    step: &'static str,
    resource: String,
    started: Instant,
    interval: Duration,
    max_wait: Duration,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    checks: u32,
}

impl PollBudget {
    #[must_use]
    pub fn start(
        step: &'static str,
        resource: &str,
        settings: PollSettings,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            step,
            resource: resource.to_string(),
            started: clock.now(),
            interval: settings.interval(),
            max_wait: settings.max_wait(),
            clock,
            cancel,
            checks: 0,
        }
    }

    /// Number of completed waits, i.e. the status checks so far minus one.
    #[must_use]
    pub fn waits(&self) -> u32 {
        self.checks
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.started)
    }

    /// Fail early if cancellation was requested, before issuing another status check.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` if the token has fired.
    pub fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancel.is_cancelled() {
            return Err(self.cancelled());
        }
        Ok(())
    }

    /// Sleep until the next status check is due.
    ///
    /// # Errors
    ///
    /// Returns `Error::Timeout` once the budget is spent (nothing is rolled back), or
    /// `Error::Cancelled` if the token fires while sleeping.
    pub async fn wait(&mut self) -> Result<(), Error> {
        let elapsed = self.elapsed();
        if elapsed >= self.max_wait {
            return Err(Error::Timeout {
                step: self.step,
                resource: self.resource.clone(),
                waited: elapsed,
            });
        }
        let remaining = self.max_wait - elapsed;
        let nap = self.interval.min(remaining);
        tracing::debug!(
            step = self.step,
            resource = %self.resource,
            elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            "waiting before next status check"
        );
        tokio::select! {
            () = self.cancel.cancelled() => return Err(self.cancelled()),
            () = self.clock.sleep(nap) => {}
        }
        self.checks = self.checks.saturating_add(1);
        Ok(())
    }

    fn cancelled(&self) -> Error {
        Error::Cancelled {
            step: self.step,
            resource: self.resource.clone(),
        }
    }
}
