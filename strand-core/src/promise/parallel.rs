//! Parallel Fan-Out / Fan-In
//!
//! Runs a finite set of named promises, each on a freshly started execution,
//! and delivers a combined map once every branch has terminated.  Because
//! branches never borrow the caller's worker or permits, fan-out composes
//! with a throttled caller without deadlock.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{Downstream, Outcome, Promise};
use crate::exec::controller::ExecController;
use crate::exec::execution::Execution;

struct FanIn<T> {
    results: Mutex<HashMap<String, T>>,
    remaining: AtomicUsize,
    failed: AtomicBool,
}

impl ExecController {
    /// Run each named promise on its own fresh execution and deliver a map
    /// of the successes once all branches have terminated.
    ///
    /// The first branch error wins and is delivered immediately; remaining
    /// branches run to completion but their outcomes are dropped.  A branch
    /// that completes without a value contributes no entry.
    pub fn fan_out<T>(&self, branches: Vec<(String, Promise<T>)>) -> Promise<HashMap<String, T>>
    where
        T: Send + 'static,
    {
        let controller = self.clone();
        Promise::new(move |down: Downstream<HashMap<String, T>>| {
            if branches.is_empty() {
                down.success(HashMap::new());
                return;
            }
            let execution = match Execution::current() {
                Ok(execution) => execution,
                Err(err) => {
                    down.error(err.into());
                    return;
                }
            };
            let on_fail = down.clone();
            let result = execution.subscribe(move |handle| {
                debug!(branches = branches.len(), "Fanning out");
                let state = Arc::new(FanIn {
                    results: Mutex::new(HashMap::new()),
                    remaining: AtomicUsize::new(branches.len()),
                    failed: AtomicBool::new(false),
                });

                for (name, promise) in branches {
                    let state = Arc::clone(&state);
                    let handle = handle.clone();
                    let down = down.clone();
                    controller.fork().start(move |_| {
                        promise.connect(Downstream::new(move |outcome| match outcome {
                            Outcome::Success(value) => {
                                state.results.lock().insert(name, value);
                                if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1
                                    && !state.failed.load(Ordering::Acquire)
                                {
                                    let map = std::mem::take(&mut *state.results.lock());
                                    handle.complete_with(move |_| {
                                        down.success(map);
                                        Ok(())
                                    });
                                }
                            }
                            Outcome::Error(err) => {
                                if !state.failed.swap(true, Ordering::AcqRel) {
                                    handle.complete_with(move |_| {
                                        down.fire(Outcome::Error(err));
                                        Ok(())
                                    });
                                }
                            }
                            Outcome::Complete => {
                                if state.remaining.fetch_sub(1, Ordering::AcqRel) == 1
                                    && !state.failed.load(Ordering::Acquire)
                                {
                                    let map = std::mem::take(&mut *state.results.lock());
                                    handle.complete_with(move |_| {
                                        down.success(map);
                                        Ok(())
                                    });
                                }
                            }
                        }));
                        Ok(())
                    });
                }
            });
            if let Err(err) = result {
                on_fail.error(err.into());
            }
        })
    }
}
