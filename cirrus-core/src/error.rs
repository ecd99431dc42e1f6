//! Engine error kinds shared by the retry kernel, the waiter, the
//! dispatcher, and resource functions.
//!
//! Classification drives lifecycle behaviour: `NotFound` converts to
//! success on Read/Delete/Update of an existing resource, `Transient`
//! is retried, everything else is terminal for the current operation.

use thiserror::Error;

/// Error type flowing through every engine operation
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// The cloud reports the resource absent
    #[error("not found: {0}")]
    NotFound(String),

    /// Throttling, 5xx, or eventual-consistency noise; safe to retry
    #[error("transient: {0}")]
    Transient(String),

    /// Another actor mutated the resource; the host should re-plan
    #[error("conflict: {0}")]
    Conflict(String),

    /// Credentials lack permission; never retried
    #[error("permission denied: {0}")]
    Permission(String),

    /// The operation deadline elapsed
    #[error("deadline exceeded after {elapsed_ms}ms: {message}")]
    Deadline { elapsed_ms: u64, message: String },

    /// The host cancelled the operation
    #[error("operation cancelled")]
    Cancelled,

    /// Programmer error: schema contradiction, unknown waiter state
    #[error("internal error: {0}")]
    Internal(String),

    /// Any other cloud API failure
    #[error("{0}")]
    Api(String),
}

impl EngineError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn api(message: impl Into<String>) -> Self {
        Self::Api(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Retryable without further context. `NotFound` is handled
    /// separately by the dispatcher because its meaning depends on the
    /// lifecycle phase.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// True for engine-induced timeouts, as opposed to errors the
    /// operation itself produced.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Deadline { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_predicates() {
        assert!(EngineError::not_found("gone").is_not_found());
        assert!(EngineError::transient("throttled").is_retryable());
        assert!(!EngineError::Cancelled.is_retryable());
        assert!(
            EngineError::Deadline {
                elapsed_ms: 1000,
                message: "op".into()
            }
            .is_timeout()
        );
        assert!(!EngineError::api("boom").is_timeout());
    }
}
