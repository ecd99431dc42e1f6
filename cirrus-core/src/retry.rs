//! Retry - bounded retries with caller-side error classification
//!
//! The kernel retries an operation whose failures the caller has
//! marked retryable, sleeping with exponential backoff and full
//! jitter between attempts. Once cumulative elapsed time passes the
//! timeout the operation gets one final synchronous attempt (the
//! "last shot"); a retryable failure there converts into a deadline
//! error wrapping the last cause.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

use crate::context::OpContext;
use crate::error::{EngineError, EngineResult};

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// An operation failure plus the caller's verdict on retrying it
#[derive(Debug)]
pub struct RetryError {
    pub error: EngineError,
    pub retryable: bool,
}

/// Marker: this failure is worth retrying
pub fn retryable_error(error: EngineError) -> RetryError {
    RetryError {
        error,
        retryable: true,
    }
}

/// Marker: give up immediately
pub fn non_retryable_error(error: EngineError) -> RetryError {
    RetryError {
        error,
        retryable: false,
    }
}

impl From<EngineError> for RetryError {
    /// Default classification from the error kind itself
    fn from(error: EngineError) -> Self {
        let retryable = error.is_retryable();
        RetryError { error, retryable }
    }
}

/// Distinguish engine-induced timeouts from operation-induced errors
pub fn is_timeout_error(error: &EngineError) -> bool {
    error.is_timeout()
}

/// Retry `op` until it succeeds, fails terminally, or `timeout`
/// elapses. The caller's context bounds the whole exchange; its
/// max-retries setting, when present, caps total attempts.
pub async fn retry<T, F, Fut>(ctx: &OpContext, timeout: Duration, mut op: F) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    let start = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    let mut attempts: u32 = 0;

    let last_error = loop {
        ctx.check()?;
        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(RetryError {
                error,
                retryable: false,
            }) => return Err(error),
            Err(RetryError { error, .. }) => {
                if let Some(max) = ctx.max_retries()
                    && attempts > max
                {
                    debug!(attempts, "retry attempt cap reached");
                    return Err(error);
                }
                if start.elapsed() >= timeout {
                    break error;
                }
                let sleep_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64);
                debug!(
                    attempts,
                    sleep_ms,
                    error = %error,
                    "retryable failure, backing off"
                );
                ctx.sleep(Duration::from_millis(sleep_ms)).await?;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        }
    };

    // Last shot: one more synchronous attempt after the timeout. A
    // retryable failure here becomes terminal.
    debug!(attempts, error = %last_error, "retry timeout reached, final attempt");
    match op().await {
        Ok(value) => Ok(value),
        Err(RetryError {
            error,
            retryable: false,
        }) => Err(error),
        Err(RetryError { error, .. }) => Err(EngineError::Deadline {
            elapsed_ms: start.elapsed().as_millis() as u64,
            message: format!("still failing after retry timeout: {}", error),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn ctx(secs: u64) -> OpContext {
        OpContext::new(Duration::from_secs(secs))
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = Instant::now();

        let result = retry(&ctx(60), Duration::from_secs(60), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(retryable_error(EngineError::transient("throttled")))
                } else {
                    Ok("res-1")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "res-1");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn terminal_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: EngineResult<()> = retry(&ctx(60), Duration::from_secs(60), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(non_retryable_error(EngineError::api("bad request")))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn timeout_gets_one_last_shot() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let start = Instant::now();

        let result: EngineResult<()> = retry(&ctx(60), Duration::from_millis(50), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(retryable_error(EngineError::transient("not ready")))
            }
        })
        .await;

        let err = result.unwrap_err();
        assert!(is_timeout_error(&err));
        // Wall time stays within timeout plus the final attempt
        assert!(start.elapsed() < Duration::from_secs(35));
        assert!(calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn last_shot_can_still_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = retry(&ctx(60), Duration::from_millis(20), || {
            let counter = counter.clone();
            async move {
                // Fails until the post-timeout final attempt
                if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(retryable_error(EngineError::transient("slow")))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn cancellation_terminates_promptly() {
        let token = CancellationToken::new();
        let ctx = OpContext::with_cancel(Duration::from_secs(60), token.clone());
        let waker = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            waker.cancel();
        });

        let start = Instant::now();
        let result: EngineResult<()> = retry(&ctx, Duration::from_secs(60), || async {
            Err(retryable_error(EngineError::transient("never")))
        })
        .await;

        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn attempt_cap_is_honored() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let ctx = ctx(60).with_max_retries(Some(2));

        let result: EngineResult<()> = retry(&ctx, Duration::from_secs(60), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(retryable_error(EngineError::transient("throttled")))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
