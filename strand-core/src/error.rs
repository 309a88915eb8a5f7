//! Typed failures of the execution runtime.
//!
//! User-level fallibility travels as `anyhow::Error` through segments and
//! promise chains; the variants here are the runtime's own contract
//! violations and control-flow failures.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the runtime itself.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The current thread has no bound execution (called outside a segment).
    #[error("no execution is bound to the current thread")]
    UnmanagedThread,

    /// The execution processed its terminal marker; no further segments can
    /// be scheduled onto it.
    #[error("execution {0} has already completed")]
    ExecutionCompleted(u64),

    /// A downstream received a second terminal signal.
    #[error("downstream received a second terminal signal")]
    DoubleFire,

    /// A required registry entry was absent.
    #[error("no entry of type `{0}` in registry")]
    NotInRegistry(&'static str),

    /// A timed promise did not deliver in time.
    #[error("promise did not deliver within {0:?}")]
    Timeout(Duration),
}

/// An error outcome observed by more than one waiter.
///
/// Promise chains deliver errors as `Arc<anyhow::Error>` so that the caching
/// promise and fan-in can hand the same terminal outcome to every waiter.
/// When such a shared error re-enters a single consumer (a `then` consumer or
/// an execution error handler), it is wrapped in `SharedError` if the
/// original can no longer be reclaimed from the `Arc`.
#[derive(Debug, Clone)]
pub struct SharedError(pub Arc<anyhow::Error>);

impl fmt::Display for SharedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

impl std::error::Error for SharedError {}

/// Reclaim a shared error as a plain `anyhow::Error`.
///
/// Returns the original error when this was the last reference, otherwise a
/// `SharedError` wrapper that preserves the message chain.
pub(crate) fn unshare(err: Arc<anyhow::Error>) -> anyhow::Error {
    match Arc::try_unwrap(err) {
        Ok(original) => original,
        Err(shared) => anyhow::Error::new(SharedError(shared)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        assert_eq!(
            ExecError::UnmanagedThread.to_string(),
            "no execution is bound to the current thread"
        );
        assert_eq!(
            ExecError::ExecutionCompleted(7).to_string(),
            "execution 7 has already completed"
        );
        assert!(ExecError::Timeout(Duration::from_millis(50))
            .to_string()
            .contains("50ms"));
    }

    #[test]
    fn test_unshare_sole_owner_returns_original() {
        let err = Arc::new(anyhow::anyhow!("boom"));
        let back = unshare(err);
        assert_eq!(back.to_string(), "boom");
        assert!(back.downcast_ref::<SharedError>().is_none());
    }

    #[test]
    fn test_unshare_shared_wraps() {
        let err = Arc::new(anyhow::anyhow!("boom"));
        let _second = Arc::clone(&err);
        let back = unshare(err);
        assert!(back.downcast_ref::<SharedError>().is_some());
        assert!(back.to_string().contains("boom"));
    }
}
