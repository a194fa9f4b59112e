//! Task invocation substrate
//!
//! Every capability call the orchestrator makes runs as one task invocation
//! through [`TaskRunner::invoke`]: bounded by a timeout, retried with
//! exponential backoff while the error is recoverable, returned at once when
//! it is not, and abandoned as soon as the run is cancelled.

use crate::config::RetrySettings;
use sdk::errors::{ErrorExt, PipelineError};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Backoff and timeout policy for one class of task
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
    /// Budget for a single attempt
    pub timeout: Duration,
}

impl RetryPolicy {
    /// Capability calls: 1s initial, x2, 60s cap, 3 attempts, 3 min per attempt
    pub fn activity() -> Self {
        Self::from(&RetrySettings::activity())
    }

    /// Status-store writes: 1s initial, x2, 60s cap, 5 attempts, 15s per attempt
    pub fn local() -> Self {
        Self::from(&RetrySettings::local())
    }

    /// Delay before attempt `attempt + 1`, where `attempt` counts from 1
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.initial_interval.as_secs_f64() * self.backoff_coefficient.powi(exponent);
        let capped = scaled.min(self.maximum_interval.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            initial_interval: Duration::from_millis(settings.initial_interval_ms),
            backoff_coefficient: settings.backoff_coefficient.max(1.0),
            maximum_interval: Duration::from_millis(settings.maximum_interval_ms),
            maximum_attempts: settings.maximum_attempts.max(1),
            timeout: Duration::from_secs(settings.timeout_secs),
        }
    }
}

/// Runs task invocations for one orchestration
#[derive(Debug, Clone)]
pub struct TaskRunner {
    cancel: CancellationToken,
}

impl TaskRunner {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Runner that is never cancelled, for best-effort work after a run ends
    pub fn detached() -> Self {
        Self::new(CancellationToken::new())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run `op` under `policy`.
    ///
    /// # Errors
    ///
    /// - the first non-recoverable error `op` returns
    /// - the last error once `maximum_attempts` is exhausted
    /// - `PipelineError::Timeout` for an attempt that overran its budget (recoverable)
    /// - `PipelineError::Cancelled` when the run is cancelled
    pub async fn invoke<T, F, Fut>(
        &self,
        task: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<T, PipelineError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PipelineError>>,
    {
        let mut attempt = 1;
        loop {
            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
                outcome = tokio::time::timeout(policy.timeout, op()) => outcome,
            };

            let err = match outcome {
                Ok(Ok(value)) => {
                    if attempt > 1 {
                        debug!(task, attempt, "task succeeded after retry");
                    }
                    return Ok(value);
                }
                Ok(Err(err)) => err,
                Err(_) => PipelineError::Timeout {
                    task: task.to_string(),
                    secs: policy.timeout.as_secs(),
                },
            };

            if !err.is_recoverable() {
                debug!(task, kind = err.kind(), "non-retryable failure");
                return Err(err);
            }
            if attempt >= policy.maximum_attempts {
                warn!(task, attempts = attempt, error = %err, "retries exhausted");
                return Err(err);
            }

            let delay = policy.backoff(attempt);
            warn!(
                task,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "task failed, retrying"
            );

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}
