//! The Single-Fire Caching Promise
//!
//! Wraps an upstream so the first connection fires it and every connection —
//! first, concurrent, or late — observes the same stored terminal outcome,
//! each delivered inside its own execution's segment stream.
//!
//! # Coordination:
//! - `started` guards the upstream: it is connected at most once
//! - Waiters land in a queue keyed by their reserved stream position
//! - Delivery runs under an atomic `drain_requested` counter: the thread
//!   that moves it zero→one drains the queue and loops until the counter
//!   returns to zero, so a request arriving mid-drain is never lost
//! - Late subscribers also go through the queue and a drain pass, never an
//!   inline delivery, preserving segment ordering in their executions

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{Downstream, Outcome, Promise, Upstream};
use crate::exec::execution::Execution;

type Waiter<T> = Box<dyn FnOnce(Outcome<T>) + Send>;

struct CacheShared<T> {
    upstream: Mutex<Option<Upstream<T>>>,
    started: AtomicBool,
    result: Mutex<Option<Outcome<T>>>,
    waiters: Mutex<VecDeque<Waiter<T>>>,
    drain_requested: AtomicUsize,
}

impl<T: Clone + Send + 'static> CacheShared<T> {
    fn request_drain(&self) {
        if self.drain_requested.fetch_add(1, Ordering::AcqRel) != 0 {
            // A drainer is active and will observe this request.
            return;
        }
        let mut observed = 1;
        loop {
            self.drain_waiters();
            let remaining = self.drain_requested.fetch_sub(observed, Ordering::AcqRel) - observed;
            if remaining == 0 {
                break;
            }
            observed = remaining;
        }
    }

    fn drain_waiters(&self) {
        let outcome = match &*self.result.lock() {
            Some(outcome) => outcome.clone(),
            None => return,
        };
        loop {
            let waiter = self.waiters.lock().pop_front();
            match waiter {
                Some(waiter) => waiter(outcome.clone()),
                None => break,
            }
        }
    }
}

/// A promise that fires its upstream once and replays the outcome to every
/// waiter.
///
/// Unlike [`Promise`], a caching promise is cloneable and may be connected
/// from any number of executions; see
/// [`Promise::cached`](crate::Promise::cached).
pub struct CachedPromise<T: Clone + Send + 'static> {
    shared: Arc<CacheShared<T>>,
}

impl<T: Clone + Send + 'static> Clone for CachedPromise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Clone + Send + 'static> CachedPromise<T> {
    pub(crate) fn new(upstream: Upstream<T>) -> Self {
        Self {
            shared: Arc::new(CacheShared {
                upstream: Mutex::new(Some(upstream)),
                started: AtomicBool::new(false),
                result: Mutex::new(None),
                waiters: Mutex::new(VecDeque::new()),
                drain_requested: AtomicUsize::new(0),
            }),
        }
    }

    /// A promise view over the cache for the current execution.
    pub fn promise(&self) -> Promise<T> {
        let shared = Arc::clone(&self.shared);
        Promise::new(move |down: Downstream<T>| {
            let execution = match Execution::current() {
                Ok(execution) => execution,
                Err(err) => {
                    down.error(err.into());
                    return;
                }
            };
            let metrics = Arc::clone(execution.controller().metrics());
            let on_fail = down.clone();
            let result = execution.subscribe(move |handle| {
                let hit_metrics = Arc::clone(&metrics);
                shared.waiters.lock().push_back(Box::new(move |outcome| {
                    hit_metrics.record_cache_hit();
                    handle.complete_with(move |_| {
                        down.fire(outcome);
                        Ok(())
                    });
                }));

                if !shared.started.swap(true, Ordering::AcqRel) {
                    debug!("Caching promise firing its upstream");
                    let upstream = shared.upstream.lock().take();
                    if let Some(upstream) = upstream {
                        let fill = Arc::clone(&shared);
                        upstream.connect(Downstream::new(move |outcome| {
                            metrics.record_cache_fill();
                            *fill.result.lock() = Some(outcome);
                            fill.request_drain();
                        }));
                    }
                } else {
                    shared.request_drain();
                }
            });
            if let Err(err) = result {
                on_fail.error(err.into());
            }
        })
    }
}
