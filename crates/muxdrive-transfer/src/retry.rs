//! Exponential-backoff retry for upstream calls
//!
//! Only transient failures (network, 5xx, rate limiting, timeouts) are
//! retried; a definitive rejection aborts immediately.

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use muxdrive_core::config::TransferConfig;
use muxdrive_core::{EngineError, EngineResult};

/// Backoff parameters. Defaults: base 500 ms, cap 10 s, 5 attempts.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            cap_ms: 10_000,
            attempts: 5,
        }
    }
}

impl From<&TransferConfig> for RetryPolicy {
    fn from(cfg: &TransferConfig) -> Self {
        Self {
            base_ms: cfg.retry_base_ms,
            cap_ms: cfg.retry_cap_ms,
            attempts: cfg.retry_attempts,
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` (0-based) failures.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self.base_ms.saturating_mul(1u64 << attempt.min(20));
        Duration::from_millis(exp.min(self.cap_ms))
    }
}

/// Runs `f`, retrying transient errors with exponential backoff.
pub async fn with_retry<F, Fut, T>(
    operation: &str,
    policy: RetryPolicy,
    f: F,
) -> EngineResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut last: Option<EngineError> = None;
    for attempt in 0..=policy.attempts {
        match f().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                let delay = policy.delay(attempt);
                warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| EngineError::UpstreamTransient(format!("{operation}: retries exhausted"))))
}
