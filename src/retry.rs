//! Retry policy for per-object steps.
//!
//! Each remote step of an object's load runs under a [`RetryPolicy`].
//! Retryable errors are attempted again after an exponential backoff;
//! fatal errors stop immediately. Every try of one step sees the same
//! [`Attempt::request_id`], so a remote side that already applied a lost
//! request can recognize the resubmission instead of applying it twice.

use std::future::Future;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::config::LoadConfig;
use crate::error::LoadError;

/// One try of a retried step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Shared by every try of the same step.
    pub request_id: Uuid,
    /// 0 for the first try.
    pub number: u32,
}

impl Attempt {
    /// A standalone first try with its own request id.
    pub fn first() -> Self {
        Self {
            request_id: Uuid::new_v4(),
            number: 0,
        }
    }

    pub fn is_retry(&self) -> bool {
        self.number > 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LoadConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based): base, 2x, 4x, ... capped at 32x.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }

    /// Run `op` until it succeeds, fails fatally, or retries run out.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, LoadError>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = Result<T, LoadError>>,
    {
        let request_id = Uuid::new_v4();
        let mut attempt = 0;
        loop {
            match op(Attempt {
                request_id,
                number: attempt,
            })
            .await
            {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    warn!(
                        what,
                        attempt,
                        %request_id,
                        max_retries = self.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
