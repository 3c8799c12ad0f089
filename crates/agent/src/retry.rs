use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use nexus_core::config::RetryConfig;
use nexus_core::errors::ErrorKind;

use crate::llm::ProviderOutcome;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts: max_attempts.max(1), base_delay }
    }

    pub fn primary(config: &RetryConfig) -> Self {
        Self::new(config.primary_max_attempts, Duration::from_millis(config.base_delay_ms))
    }

    pub fn fallback(config: &RetryConfig) -> Self {
        Self::new(config.fallback_max_attempts, Duration::from_millis(config.base_delay_ms))
    }

    /// `base_delay * 2^(attempt - 1)` for the sleep after failed attempt number `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1_u32 << exponent)
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Cooperative cancellation flag shared between a run's owner and `cancel_run`.
#[derive(Clone, Debug, Default)]
pub struct CancellationSignal {
    inner: Arc<CancellationInner>,
}

#[derive(Debug, Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RetryResult {
    Finished { outcome: ProviderOutcome, attempts: u32 },
    Cancelled { attempts: u32 },
}

fn is_retryable(kind: ErrorKind, unknown_seen: bool) -> bool {
    match kind {
        ErrorKind::RateLimited | ErrorKind::Timeout => true,
        ErrorKind::Unknown => !unknown_seen,
        ErrorKind::AuthInvalid
        | ErrorKind::UserCancelled
        | ErrorKind::StaleClarification
        | ErrorKind::RegistryNotFound => false,
    }
}

/// Runs `operation` until it produces a non-failure outcome, a fatal failure, or the attempt
/// budget is spent. `Unknown` failures are retried once per call of `with_retry`. A failure
/// that reports tools but no checkpoint is fatal.
pub async fn with_retry<F, Fut>(
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationSignal,
    mut operation: F,
) -> RetryResult
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = ProviderOutcome>,
{
    let mut unknown_seen = false;
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return RetryResult::Cancelled { attempts: attempt };
        }

        attempt += 1;
        let outcome = operation(attempt).await;
        let Some(failure) = outcome.failure() else {
            return RetryResult::Finished { outcome, attempts: attempt };
        };

        let retryable = is_retryable(failure.kind, unknown_seen);
        if failure.kind == ErrorKind::Unknown {
            unknown_seen = true;
        }
        // Tools ran and there is nothing to continue from; another attempt would repeat them.
        let resumable = failure.tools_used.is_empty() || failure.checkpoint.is_some();
        if !retryable || !resumable || attempt >= policy.max_attempts {
            return RetryResult::Finished { outcome, attempts: attempt };
        }

        let delay = policy.delay_after(attempt);
        debug!(
            event_name = "retry.backoff",
            attempt,
            delay_ms = delay.as_millis() as u64,
            kind = failure.kind.as_str(),
            "retrying after backoff"
        );
        tokio::select! {
            _ = sleeper.sleep(delay) => {}
            _ = cancel.cancelled() => return RetryResult::Cancelled { attempts: attempt },
        }
    }
}
