//! Waiter - poll a resource until it reaches a target state
//!
//! Drives the eventual-consistency state machine: wait an initial
//! delay, poll at increasing intervals, and only accept success after
//! the configured number of consecutive target observations. A state
//! outside pending and target is an immediate terminal failure;
//! not-found is polled through for a bounded number of attempts to
//! absorb propagation lag after a create.

use std::future::Future;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::OpContext;
use crate::error::{EngineError, EngineResult};

const POLL_CEILING: Duration = Duration::from_secs(10);

/// Configuration for one wait
#[derive(Debug, Clone)]
pub struct WaitConf {
    /// States the resource may pass through
    pub pending: Vec<String>,
    /// States that complete the wait
    pub target: Vec<String>,
    pub timeout: Duration,
    /// Delay before the first poll
    pub delay: Duration,
    /// Starting poll interval; doubles up to a ceiling
    pub min_interval: Duration,
    /// Consecutive target observations required before success
    pub continuous_target_occurrence: u32,
    /// Not-found results tolerated before becoming terminal
    pub not_found_checks: u32,
}

impl Default for WaitConf {
    fn default() -> Self {
        Self {
            pending: Vec::new(),
            target: Vec::new(),
            timeout: Duration::from_secs(600),
            delay: Duration::ZERO,
            min_interval: Duration::from_millis(500),
            continuous_target_occurrence: 1,
            not_found_checks: 20,
        }
    }
}

impl WaitConf {
    pub fn new(
        pending: impl IntoIterator<Item = impl Into<String>>,
        target: impl IntoIterator<Item = impl Into<String>>,
        timeout: Duration,
    ) -> Self {
        Self {
            pending: pending.into_iter().map(Into::into).collect(),
            target: target.into_iter().map(Into::into).collect(),
            timeout,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_continuous_target_occurrence(mut self, n: u32) -> Self {
        self.continuous_target_occurrence = n;
        self
    }

    pub fn with_not_found_checks(mut self, n: u32) -> Self {
        self.not_found_checks = n;
        self
    }
}

/// Poll until a target state holds. `poll` yields
/// `Ok(Some((state, output)))` for an observation, `Ok(None)` for
/// not-found, or an error to terminate.
pub async fn wait_for_state<T, F, Fut>(
    ctx: &OpContext,
    conf: &WaitConf,
    mut poll: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<Option<(String, T)>>>,
{
    if conf.delay > Duration::ZERO {
        ctx.sleep(conf.delay).await?;
    }

    let start = Instant::now();
    let mut interval = conf.min_interval;
    let mut not_found: u32 = 0;
    let mut target_streak: u32 = 0;
    let required = conf.continuous_target_occurrence.max(1);

    loop {
        ctx.check()?;
        if start.elapsed() >= conf.timeout {
            return Err(EngineError::Deadline {
                elapsed_ms: start.elapsed().as_millis() as u64,
                message: format!(
                    "timeout waiting for state [{}]",
                    conf.target.join(", ")
                ),
            });
        }

        match poll().await? {
            None => {
                target_streak = 0;
                not_found += 1;
                if not_found > conf.not_found_checks {
                    return Err(EngineError::not_found(format!(
                        "resource vanished while waiting for state [{}]",
                        conf.target.join(", ")
                    )));
                }
                debug!(not_found, "not found yet, polling through");
            }
            Some((state, output)) => {
                not_found = 0;
                if conf.target.iter().any(|t| *t == state) {
                    target_streak += 1;
                    debug!(%state, target_streak, required, "target state observed");
                    if target_streak >= required {
                        return Ok(output);
                    }
                } else if conf.pending.iter().any(|p| *p == state) {
                    target_streak = 0;
                    debug!(%state, "pending state");
                } else {
                    return Err(EngineError::internal(format!(
                        "unexpected state '{}', wanted one of [{}]",
                        state,
                        conf.target.join(", ")
                    )));
                }
            }
        }

        ctx.sleep(interval).await?;
        interval = (interval * 2).min(POLL_CEILING);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn ctx() -> OpContext {
        OpContext::new(Duration::from_secs(60))
    }

    fn conf(timeout_ms: u64) -> WaitConf {
        WaitConf::new(
            ["creating"],
            ["available"],
            Duration::from_millis(timeout_ms),
        )
        .with_min_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn reaches_target_through_pending() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let out = wait_for_state(&ctx(), &conf(5_000), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Ok(Some(("creating".to_string(), n)))
                } else {
                    Ok(Some(("available".to_string(), n)))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, 2);
    }

    #[tokio::test]
    async fn requires_consecutive_target_observations() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let conf = conf(5_000).with_continuous_target_occurrence(3);

        // available, creating (streak resets), then three in a row
        let states = [
            "available",
            "creating",
            "available",
            "available",
            "available",
        ];
        let out = wait_for_state(&ctx(), &conf, || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
                Ok(Some((states[n.min(states.len() - 1)].to_string(), n)))
            }
        })
        .await
        .unwrap();

        // Success lands on the third consecutive observation
        assert_eq!(out, 4);
    }

    #[tokio::test]
    async fn unexpected_state_is_terminal() {
        let result: EngineResult<u32> = wait_for_state(&ctx(), &conf(5_000), || async {
            Ok(Some(("failed".to_string(), 0)))
        })
        .await;
        assert!(matches!(result, Err(EngineError::Internal(_))));
    }

    #[tokio::test]
    async fn not_found_polled_through_then_terminal() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let conf = conf(5_000).with_not_found_checks(3);

        let result: EngineResult<u32> = wait_for_state(&ctx(), &conf, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(None)
            }
        })
        .await;

        assert!(matches!(result, Err(EngineError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn not_found_then_found_recovers() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let out = wait_for_state(&ctx(), &conf(5_000), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Ok(None)
                } else {
                    Ok(Some(("available".to_string(), "vpc-1")))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(out, "vpc-1");
    }

    #[tokio::test]
    async fn times_out_when_stuck_pending() {
        let result: EngineResult<u32> = wait_for_state(&ctx(), &conf(50), || async {
            Ok(Some(("creating".to_string(), 0)))
        })
        .await;
        let err = result.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn cancellation_interrupts_polling() {
        let token = CancellationToken::new();
        let ctx = OpContext::with_cancel(Duration::from_secs(60), token.clone());
        let waker = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.cancel();
        });

        let result: EngineResult<u32> = wait_for_state(&ctx, &conf(50_000), || async {
            Ok(Some(("creating".to_string(), 0)))
        })
        .await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn initial_delay_is_respected() {
        let conf = conf(5_000).with_delay(Duration::from_millis(30));
        let start = Instant::now();
        let _ = wait_for_state(&ctx(), &conf, || async {
            Ok(Some(("available".to_string(), 0)))
        })
        .await
        .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(30));
    }
}
