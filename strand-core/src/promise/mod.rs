//! Promise / Upstream / Downstream - The Lazy One-Shot Async Value
//!
//! A promise is a deferred computation: a function from a downstream to an
//! armed delivery.  Nothing runs until a terminal operator (`then`) connects
//! the chain, and the downstream then receives exactly one of success,
//! error, or complete.
//!
//! # Scheduling Contract:
//! - Every operator continuation runs on the owning execution's worker
//! - Asynchronous producers marshal their delivery through a reserved
//!   stream position, so foreign threads never run user transforms
//! - Errors inside transforms fold into error deliveries; errors after the
//!   terminal operator route into the execution's error handler

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::error;

use crate::error::{unshare, ExecError};
use crate::exec::execution::Execution;

pub mod cached;
pub mod parallel;
pub mod throttle;

pub use cached::CachedPromise;
pub use throttle::Throttle;

/// A shared, terminally delivered error.
pub type ErrorRef = Arc<anyhow::Error>;

/// The single terminal signal of a promise.
#[derive(Clone)]
pub enum Outcome<T> {
    /// The value was produced.
    Success(T),
    /// The producer failed.
    Error(ErrorRef),
    /// The producer finished without a value.
    Complete,
}

impl<T> Outcome<T> {
    /// The success value, if this outcome carries one.
    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

struct DownstreamShared<T> {
    fired: AtomicBool,
    sink: Mutex<Option<Box<dyn FnOnce(Outcome<T>) + Send>>>,
}

/// The receiving side of a promise.
///
/// At most one of [`success`](Self::success), [`error`](Self::error), or
/// [`complete`](Self::complete) may be invoked; a second terminal signal is
/// a programming error and panics on the offending thread.
pub struct Downstream<T> {
    shared: Arc<DownstreamShared<T>>,
}

impl<T> Clone for Downstream<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Downstream<T> {
    pub(crate) fn new(sink: impl FnOnce(Outcome<T>) + Send + 'static) -> Self {
        Self {
            shared: Arc::new(DownstreamShared {
                fired: AtomicBool::new(false),
                sink: Mutex::new(Some(Box::new(sink))),
            }),
        }
    }

    /// Deliver the value.
    pub fn success(&self, value: T) {
        self.fire(Outcome::Success(value));
    }

    /// Deliver a failure.
    pub fn error(&self, err: anyhow::Error) {
        self.fire(Outcome::Error(Arc::new(err)));
    }

    /// Deliver completion without a value.
    pub fn complete(&self) {
        self.fire(Outcome::Complete);
    }

    /// Deliver an already-built outcome.
    pub fn fire(&self, outcome: Outcome<T>) {
        if self.shared.fired.swap(true, Ordering::AcqRel) {
            error!("downstream received a second terminal signal");
            panic!("{}", ExecError::DoubleFire);
        }
        let sink = self.shared.sink.lock().take();
        if let Some(sink) = sink {
            sink(outcome);
        }
    }
}

/// The producing side of a promise: a one-shot connection function.
pub struct Upstream<T> {
    connect_fn: Box<dyn FnOnce(Downstream<T>) + Send>,
}

impl<T> Upstream<T> {
    pub(crate) fn new(connect_fn: impl FnOnce(Downstream<T>) + Send + 'static) -> Self {
        Self {
            connect_fn: Box::new(connect_fn),
        }
    }

    pub(crate) fn connect(self, downstream: Downstream<T>) {
        (self.connect_fn)(downstream)
    }
}

/// A lazy, one-shot asynchronous value.
///
/// Promises are not shareable across subscribers; connecting consumes the
/// promise.  Use [`cached`](Self::cached) for multi-waiter fan-in.
///
/// ```rust,no_run
/// # fn inside_a_segment() -> anyhow::Result<()> {
/// use strand_core::Promise;
/// Promise::of(2).map(|n| n * 3).then(|n| {
///     assert_eq!(n, 6);
///     Ok(())
/// })?;
/// # Ok(()) }
/// ```
pub struct Promise<T> {
    upstream: Upstream<T>,
}

impl<T: Send + 'static> Promise<T> {
    pub(crate) fn new(connect: impl FnOnce(Downstream<T>) + Send + 'static) -> Self {
        Self {
            upstream: Upstream::new(connect),
        }
    }

    pub(crate) fn connect(self, downstream: Downstream<T>) {
        self.upstream.connect(downstream)
    }

    // ── constructors ──────────────────────────────────────────────────

    /// A promise already resolved with `value`.
    pub fn of(value: T) -> Self {
        Self::new(move |down| down.success(value))
    }

    /// A promise already failed with `err`.
    pub fn of_error(err: anyhow::Error) -> Self {
        Self::new(move |down| down.error(err))
    }

    /// A promise computed synchronously at connection time.  A returned
    /// error becomes an error delivery.
    pub fn from_callable(func: impl FnOnce() -> anyhow::Result<T> + Send + 'static) -> Self {
        Self::new(move |down| match func() {
            Ok(value) => down.success(value),
            Err(err) => down.error(err),
        })
    }

    /// Adapt a promise-returning function so a failure to produce the
    /// promise becomes an error delivery.
    pub fn wrap(func: impl FnOnce() -> anyhow::Result<Promise<T>> + Send + 'static) -> Self {
        Self::new(move |down| match func() {
            Ok(promise) => promise.connect(down),
            Err(err) => down.error(err),
        })
    }

    /// A promise backed by an asynchronous producer.
    ///
    /// The producer runs inside a segment of the connecting execution and
    /// may fire its downstream from any thread; delivery is marshalled back
    /// onto the owning worker through a reserved stream position before any
    /// downstream transform runs.
    pub fn from_async(producer: impl FnOnce(Downstream<T>) + Send + 'static) -> Self {
        Self::new(move |down| {
            let execution = match Execution::current() {
                Ok(execution) => execution,
                Err(err) => {
                    down.error(err.into());
                    return;
                }
            };
            let on_fail = down.clone();
            let result = execution.subscribe(move |handle| {
                let bridge = Downstream::new(move |outcome: Outcome<T>| {
                    handle.complete_with(move |_| {
                        down.fire(outcome);
                        Ok(())
                    });
                });
                producer(bridge);
            });
            if let Err(err) = result {
                on_fail.error(err.into());
            }
        })
    }

    // ── operators ─────────────────────────────────────────────────────

    /// Transform the value.  Errors and completion pass through.
    pub fn map<U, F>(self, func: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Promise::new(move |down| {
            self.connect(Downstream::new(move |outcome| match outcome {
                Outcome::Success(value) => down.success(func(value)),
                Outcome::Error(err) => down.fire(Outcome::Error(err)),
                Outcome::Complete => down.complete(),
            }))
        })
    }

    /// Transform the value fallibly; a returned error becomes an error
    /// delivery.
    pub fn try_map<U, F>(self, func: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> anyhow::Result<U> + Send + 'static,
    {
        Promise::new(move |down| {
            self.connect(Downstream::new(move |outcome| match outcome {
                Outcome::Success(value) => match func(value) {
                    Ok(mapped) => down.success(mapped),
                    Err(err) => down.error(err),
                },
                Outcome::Error(err) => down.fire(Outcome::Error(err)),
                Outcome::Complete => down.complete(),
            }))
        })
    }

    /// Chain another promise off the value.
    pub fn flat_map<U, F>(self, func: F) -> Promise<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> Promise<U> + Send + 'static,
    {
        Promise::new(move |down| {
            self.connect(Downstream::new(move |outcome| match outcome {
                Outcome::Success(value) => func(value).connect(down),
                Outcome::Error(err) => down.fire(Outcome::Error(err)),
                Outcome::Complete => down.complete(),
            }))
        })
    }

    /// Convert an error into a value.  Success and completion pass through;
    /// a failing converter re-delivers its own error.
    pub fn map_error<F>(self, func: F) -> Promise<T>
    where
        F: FnOnce(ErrorRef) -> anyhow::Result<T> + Send + 'static,
    {
        Promise::new(move |down| {
            self.connect(Downstream::new(move |outcome| match outcome {
                Outcome::Error(err) => match func(err) {
                    Ok(recovered) => down.success(recovered),
                    Err(err) => down.error(err),
                },
                other => down.fire(other),
            }))
        })
    }

    /// Observe an error before it continues downstream.
    pub fn on_error<F>(self, observer: F) -> Promise<T>
    where
        F: FnOnce(&ErrorRef) + Send + 'static,
    {
        Promise::new(move |down| {
            self.connect(Downstream::new(move |outcome| {
                if let Outcome::Error(err) = &outcome {
                    observer(err);
                }
                down.fire(outcome);
            }))
        })
    }

    /// Observe the outcome without altering it.
    pub fn wiretap<F>(self, observer: F) -> Promise<T>
    where
        F: FnOnce(&Outcome<T>) + Send + 'static,
    {
        Promise::new(move |down| {
            self.connect(Downstream::new(move |outcome| {
                observer(&outcome);
                down.fire(outcome);
            }))
        })
    }

    /// Terminal operator: connect the chain and run `consumer` with the
    /// value as a user-code segment of the current execution.
    ///
    /// An error outcome — and any error returned by the consumer — routes
    /// into the execution's error handler.  Completion without a value skips
    /// the consumer.
    pub fn then(
        self,
        consumer: impl FnOnce(T) -> anyhow::Result<()> + Send + 'static,
    ) -> Result<(), ExecError> {
        let execution = Execution::current()?;
        execution.subscribe(move |handle| {
            self.connect(Downstream::new(move |outcome| {
                handle.complete_with(move |_| match outcome {
                    Outcome::Success(value) => consumer(value),
                    Outcome::Error(err) => Err(unshare(err)),
                    Outcome::Complete => Ok(()),
                });
            }));
        })
    }

    /// Delay connecting the underlying promise by `delay`, on the owning
    /// worker's timer.
    pub fn defer(self, delay: Duration) -> Promise<T> {
        Promise::new(move |down| {
            let execution = match Execution::current() {
                Ok(execution) => execution,
                Err(err) => {
                    down.error(err.into());
                    return;
                }
            };
            let on_fail = down.clone();
            let result = execution.subscribe(move |handle| {
                let execution = Arc::clone(handle.execution());
                execution.schedule_after(delay, move || {
                    handle.complete_with(move |_| {
                        self.connect(down);
                        Ok(())
                    });
                });
            });
            if let Err(err) = result {
                on_fail.error(err.into());
            }
        })
    }

    /// Race the underlying promise against a deadline.
    ///
    /// The underlying runs on a freshly started execution; a delayed segment
    /// on the caller's worker marks the race cancelled and delivers
    /// [`ExecError::Timeout`] if the value has not arrived.  The loser's
    /// late delivery is ignored.
    pub fn timeout(self, limit: Duration) -> Promise<T> {
        Promise::new(move |down| {
            let execution = match Execution::current() {
                Ok(execution) => execution,
                Err(err) => {
                    down.error(err.into());
                    return;
                }
            };
            let controller = execution.controller().clone();
            let on_fail = down.clone();
            let result = execution.subscribe(move |handle| {
                let cancelled = Arc::new(AtomicBool::new(false));

                let timer_handle = handle.clone();
                let timer_cancelled = Arc::clone(&cancelled);
                let timer_down = down.clone();
                handle.execution().schedule_after(limit, move || {
                    if !timer_cancelled.swap(true, Ordering::AcqRel) {
                        timer_handle.complete_with(move |_| {
                            timer_down.error(ExecError::Timeout(limit).into());
                            Ok(())
                        });
                    }
                });

                // The underlying runs on its own execution so a stalled
                // producer cannot wedge the caller's stream.
                controller.fork().start(move |_| {
                    self.connect(Downstream::new(move |outcome| {
                        if !cancelled.swap(true, Ordering::AcqRel) {
                            handle.complete_with(move |_| {
                                down.fire(outcome);
                                Ok(())
                            });
                        }
                    }));
                    Ok(())
                });
            });
            if let Err(err) = result {
                on_fail.error(err.into());
            }
        })
    }

    /// Gate connection of this promise behind `throttle`.
    pub fn throttled(self, throttle: &Throttle) -> Promise<T> {
        let throttle = throttle.clone();
        Promise::new(move |down| {
            let execution = match Execution::current() {
                Ok(execution) => execution,
                Err(err) => {
                    down.error(err.into());
                    return;
                }
            };
            let on_fail = down.clone();
            let result = execution.subscribe(move |handle| {
                let release = throttle.clone();
                throttle.submit(Box::new(move || {
                    handle.complete_with(move |_| {
                        self.connect(Downstream::new(move |outcome| {
                            release.release();
                            down.fire(outcome);
                        }));
                        Ok(())
                    });
                }));
            });
            if let Err(err) = result {
                on_fail.error(err.into());
            }
        })
    }

    /// Turn this promise into a single-fire caching promise.
    pub fn cached(self) -> CachedPromise<T>
    where
        T: Clone,
    {
        CachedPromise::new(self.upstream)
    }
}

impl Promise<()> {
    /// A promise that delivers `()` after `delay` on the owning worker.
    pub fn sleep(delay: Duration) -> Promise<()> {
        Promise::of(()).defer(delay)
    }
}
