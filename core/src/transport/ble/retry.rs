// Bounded retry for radio operations
//
// A fixed number of attempts separated by a fixed delay. The only way to
// cancel a running retry loop is the role's `started` flag, which is checked
// before every attempt.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Retry strategy for topic writes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Pause between attempts (milliseconds)
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay_ms: 1_000,
        }
    }
}

/// Why a retry loop gave up
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E: fmt::Display> {
    #[error("Gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
    #[error("Cancelled after {attempts} attempts")]
    Cancelled { attempts: u32 },
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Upper bound on how long a full retry loop can wait between attempts
    pub fn budget(&self) -> Duration {
        self.delay() * self.max_attempts.max(1)
    }

    /// Should we try again after `attempt` failed attempts?
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Run `op` until it succeeds, the attempts are used up, or `running`
    /// is cleared. `op` receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, running: &AtomicBool, mut op: F) -> Result<T, RetryError<E>>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            if !running.load(Ordering::SeqCst) {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;

            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if !self.should_retry(attempt) => {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    debug!(
                        "Attempt {}/{} failed: {}; retrying in {:?}",
                        attempt,
                        self.max_attempts,
                        e,
                        self.delay()
                    );
                    tokio::time::sleep(self.delay()).await;
                }
            }
        }
    }
}
