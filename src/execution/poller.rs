//! Blocking-with-timeout wait for executions.
//!
//! The poller sleeps a fixed interval between checks and never sleeps past
//! the deadline. In `Strict` mode any check error is returned immediately;
//! in `TolerateTransient` mode transient transport errors are logged and the
//! check is retried until the deadline.

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::manager::{Execution, ExecutionsApi};

/// Default interval between status checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How check errors are handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollMode {
    /// Every error aborts the wait.
    Strict,
    /// Transient errors are swallowed until the deadline.
    TolerateTransient,
}

/// Polls a condition until it holds or a deadline passes.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionPoller {
    interval: Duration,
    mode: PollMode,
}

impl Default for ExecutionPoller {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}

impl ExecutionPoller {
    /// Creates a strict poller.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            mode: PollMode::Strict,
        }
    }

    /// Creates a poller tolerating transient errors.
    #[must_use]
    pub const fn tolerant(interval: Duration) -> Self {
        Self {
            interval,
            mode: PollMode::TolerateTransient,
        }
    }

    /// Returns the interval between checks.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns the error-handling mode.
    #[must_use]
    pub const fn mode(&self) -> PollMode {
        self.mode
    }

    /// Runs `check` until it returns `true` or `timeout` elapses.
    ///
    /// The check runs at least once. Returns `Ok(false)` on deadline.
    ///
    /// # Errors
    ///
    /// Returns the first error of `check` that the mode does not tolerate.
    pub async fn poll_with_timeout<F, Fut>(&self, mut check: F, timeout: Duration) -> Result<bool>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        let deadline = Instant::now() + timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            trace!("Poll attempt {attempt}");

            match check().await {
                Ok(true) => {
                    debug!("Condition met after {attempt} attempt(s)");
                    return Ok(true);
                }
                Ok(false) => {}
                Err(e) if self.mode == PollMode::TolerateTransient && e.is_transient() => {
                    warn!("Transient error while polling (attempt {attempt}): {e}");
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            if now >= deadline {
                debug!("Poll deadline reached after {attempt} attempt(s)");
                return Ok(false);
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// Waits for an execution to reach a terminal status.
    ///
    /// Returns the terminal execution, or `None` if the deadline passed.
    ///
    /// # Errors
    ///
    /// Returns lookup errors not tolerated by the mode, including not-found.
    pub async fn wait_for_execution(
        &self,
        executions: &dyn ExecutionsApi,
        execution_id: &str,
        timeout: Duration,
    ) -> Result<Option<Execution>> {
        let last = Mutex::new(None);
        let slot = &last;

        let finished = self
            .poll_with_timeout(
                move || async move {
                    let execution = executions.get(execution_id).await?;
                    let terminal = execution.status.is_terminal();
                    debug!("Execution {} is {}", execution.id, execution.status);
                    if let Ok(mut guard) = slot.lock() {
                        *guard = Some(execution);
                    }
                    Ok(terminal)
                },
                timeout,
            )
            .await?;

        let last = last.into_inner().unwrap_or_else(PoisonError::into_inner);
        Ok(if finished { last } else { None })
    }
}
