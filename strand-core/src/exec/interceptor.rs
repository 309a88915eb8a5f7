//! Interceptors around user-code segments.
//!
//! Every user segment runs through an ordered chain of interceptors:
//! controller-wide ones first, then those found in the execution's registry
//! at start, then any registered ad-hoc while the execution runs.  An
//! interceptor wraps the segment with whatever context propagation it needs
//! (log fields, spans, scoped state) and must invoke the continuation
//! exactly once.
//!
//! The chain is walked with a slice cursor rather than nested closures, so
//! long chains cost a shallow, bounded stack.

use std::fmt;
use std::sync::Arc;
use tracing::debug_span;

use super::execution::Execution;

/// Whether a segment runs on an event-loop worker or on the blocking pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecType {
    Compute,
    Blocking,
}

impl fmt::Display for ExecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Compute => write!(f, "compute"),
            Self::Blocking => write!(f, "blocking"),
        }
    }
}

/// Wraps each user-code segment of an execution.
pub trait ExecInterceptor: Send + Sync {
    /// Run `continuation` exactly once, wrapping it as needed.
    ///
    /// Returning an error without having called
    /// [`Continuation::proceed`] abandons the segment; the error is routed
    /// like a segment failure.
    fn intercept(
        &self,
        execution: &Arc<Execution>,
        exec_type: ExecType,
        continuation: Continuation<'_>,
    ) -> anyhow::Result<()>;
}

/// The rest of the interceptor chain plus the segment body.
pub struct Continuation<'a> {
    chain: &'a [Arc<dyn ExecInterceptor>],
    execution: &'a Arc<Execution>,
    exec_type: ExecType,
    body: &'a mut dyn FnMut() -> anyhow::Result<()>,
}

impl<'a> Continuation<'a> {
    /// Invoke the next interceptor, or the segment body if none remain.
    pub fn proceed(self) -> anyhow::Result<()> {
        match self.chain.split_first() {
            Some((head, rest)) => head.intercept(
                self.execution,
                self.exec_type,
                Continuation {
                    chain: rest,
                    execution: self.execution,
                    exec_type: self.exec_type,
                    body: self.body,
                },
            ),
            None => (self.body)(),
        }
    }
}

/// Run `body` under the given interceptor chain.
pub(crate) fn run_intercepted<F>(
    chain: &[Arc<dyn ExecInterceptor>],
    execution: &Arc<Execution>,
    exec_type: ExecType,
    body: F,
) -> anyhow::Result<()>
where
    F: FnOnce() -> anyhow::Result<()>,
{
    let mut body = Some(body);
    let mut call = move || match body.take() {
        Some(f) => f(),
        // An interceptor invoked its continuation twice; the body already ran.
        None => Ok(()),
    };
    Continuation {
        chain,
        execution,
        exec_type,
        body: &mut call,
    }
    .proceed()
}

/// A stock interceptor that wraps every segment in a tracing span carrying
/// the execution id and segment kind, so log lines emitted by user code are
/// attributable without manual field plumbing.
pub struct SpanInterceptor;

impl ExecInterceptor for SpanInterceptor {
    fn intercept(
        &self,
        execution: &Arc<Execution>,
        exec_type: ExecType,
        continuation: Continuation<'_>,
    ) -> anyhow::Result<()> {
        let span = debug_span!("segment", execution = execution.id(), kind = %exec_type);
        let _guard = span.enter();
        continuation.proceed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tagging {
        tag: usize,
        seen: Arc<std::sync::Mutex<Vec<usize>>>,
    }

    impl ExecInterceptor for Tagging {
        fn intercept(
            &self,
            _execution: &Arc<Execution>,
            _exec_type: ExecType,
            continuation: Continuation<'_>,
        ) -> anyhow::Result<()> {
            self.seen.lock().unwrap().push(self.tag);
            continuation.proceed()
        }
    }

    #[test]
    fn test_chain_runs_in_order_around_body() {
        let controller = crate::ExecController::with_config(crate::ControllerConfig {
            compute_threads: 1,
            ..Default::default()
        })
        .unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let body_runs = Arc::new(AtomicUsize::new(0));

        let (tx, rx) = std::sync::mpsc::channel();
        let seen2 = Arc::clone(&seen);
        let body_runs2 = Arc::clone(&body_runs);
        controller
            .fork()
            .on_complete(move |_| {
                let _ = tx.send(());
            })
            .start(move |execution| {
                let chain: Vec<Arc<dyn ExecInterceptor>> = vec![
                    Arc::new(Tagging {
                        tag: 1,
                        seen: Arc::clone(&seen2),
                    }),
                    Arc::new(Tagging {
                        tag: 2,
                        seen: Arc::clone(&seen2),
                    }),
                ];
                run_intercepted(&chain, execution, ExecType::Compute, || {
                    body_runs2.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(body_runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exec_type_display() {
        assert_eq!(ExecType::Compute.to_string(), "compute");
        assert_eq!(ExecType::Blocking.to_string(), "blocking");
    }
}
