//! OpContext - per-operation deadline and cancellation
//!
//! Every lifecycle operation runs under one of these. Suspension
//! points (retry sleeps, waiter polls, SDK calls made by resource
//! functions) observe the token and the deadline; when the host
//! cancels, partial side effects remain and reconciliation happens on
//! the next read.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct OpContext {
    cancel: CancellationToken,
    started: Instant,
    deadline: Instant,
    max_retries: Option<u32>,
}

impl OpContext {
    pub fn new(timeout: Duration) -> Self {
        Self::with_cancel(timeout, CancellationToken::new())
    }

    pub fn with_cancel(timeout: Duration, cancel: CancellationToken) -> Self {
        let started = Instant::now();
        Self {
            cancel,
            started,
            deadline: started + timeout,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, max_retries: Option<u32>) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Derived context sharing the token, deadline capped at
    /// min(parent deadline, now + timeout). Used for the post-create
    /// propagation window inside Read.
    pub fn child(&self, timeout: Duration) -> Self {
        let now = Instant::now();
        Self {
            cancel: self.cancel.clone(),
            started: now,
            deadline: self.deadline.min(now + timeout),
            max_retries: self.max_retries,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    fn deadline_error(&self, message: impl Into<String>) -> EngineError {
        EngineError::Deadline {
            elapsed_ms: self.elapsed().as_millis() as u64,
            message: message.into(),
        }
    }

    /// Fast checkpoint before issuing work
    pub fn check(&self) -> EngineResult<()> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(self.deadline_error("operation deadline reached"));
        }
        Ok(())
    }

    /// Sleep that returns early with `Cancelled` when the host cancels.
    /// The duration is capped at the remaining deadline budget.
    pub async fn sleep(&self, duration: Duration) -> EngineResult<()> {
        let duration = duration.min(self.remaining());
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
        }
    }

    /// Run a future under this context: whichever of completion,
    /// cancellation, or the deadline happens first wins
    pub async fn run<T, F>(&self, message: &str, fut: F) -> EngineResult<T>
    where
        F: std::future::Future<Output = EngineResult<T>>,
    {
        let deadline = tokio::time::Instant::from_std(self.deadline);
        tokio::select! {
            result = fut => result,
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => Err(self.deadline_error(message)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_passes_within_budget() {
        let ctx = OpContext::new(Duration::from_secs(10));
        assert!(ctx.check().is_ok());
    }

    #[tokio::test]
    async fn check_fails_after_deadline() {
        let ctx = OpContext::new(Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            ctx.check(),
            Err(EngineError::Deadline { .. })
        ));
    }

    #[tokio::test]
    async fn check_fails_when_cancelled() {
        let token = CancellationToken::new();
        let ctx = OpContext::with_cancel(Duration::from_secs(10), token.clone());
        token.cancel();
        assert!(matches!(ctx.check(), Err(EngineError::Cancelled)));
    }

    #[tokio::test]
    async fn sleep_wakes_on_cancel() {
        let token = CancellationToken::new();
        let ctx = OpContext::with_cancel(Duration::from_secs(10), token.clone());
        let waker = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waker.cancel();
        });
        let start = Instant::now();
        let result = ctx.sleep(Duration::from_secs(30)).await;
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn run_enforces_deadline() {
        let ctx = OpContext::new(Duration::from_millis(20));
        let result: EngineResult<()> = ctx
            .run("create timed out", async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(EngineError::Deadline { .. })));
    }

    #[tokio::test]
    async fn child_deadline_never_exceeds_parent() {
        let ctx = OpContext::new(Duration::from_millis(50));
        let child = ctx.child(Duration::from_secs(60));
        assert!(child.deadline() <= ctx.deadline());
    }
}
