//! Throttle - Fair Gating of Promise Activation
//!
//! A throttle is a semaphore over promise connection: at most `size`
//! throttled promises run at once, and connections beyond that queue FIFO.
//! A released permit is handed directly to the oldest queued connection, so
//! arrival order is completion-start order and late arrivals cannot barge.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) type ThrottleJob = Box<dyn FnOnce() + Send>;

struct ThrottleShared {
    size: Option<usize>,
    active: AtomicUsize,
    queue: Mutex<VecDeque<ThrottleJob>>,
}

/// A fair semaphore over promise activation.
///
/// Cloning shares the same permit pool.  See
/// [`Promise::throttled`](crate::Promise::throttled).
#[derive(Clone)]
pub struct Throttle {
    shared: Arc<ThrottleShared>,
}

impl Throttle {
    /// A throttle that never queues.
    pub fn unlimited() -> Self {
        Self::build(None)
    }

    /// A throttle permitting `size` concurrent activations.
    pub fn of_size(size: usize) -> Self {
        Self::build(Some(size.max(1)))
    }

    fn build(size: Option<usize>) -> Self {
        debug!(size = ?size, "Creating throttle");
        Self {
            shared: Arc::new(ThrottleShared {
                size,
                active: AtomicUsize::new(0),
                queue: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// The permit count, or `None` when unlimited.
    pub fn size(&self) -> Option<usize> {
        self.shared.size
    }

    /// Number of activations currently holding a permit.
    pub fn active(&self) -> usize {
        self.shared.active.load(Ordering::Acquire)
    }

    /// Number of queued activations waiting for a permit.
    pub fn waiting(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Run `job` now if a permit is free and nothing is queued ahead of it,
    /// otherwise queue it.
    pub(crate) fn submit(&self, job: ThrottleJob) {
        match self.shared.size {
            None => {
                self.shared.active.fetch_add(1, Ordering::AcqRel);
                job();
            }
            Some(limit) => {
                let mut queue = self.shared.queue.lock();
                if queue.is_empty() && self.shared.active.load(Ordering::Acquire) < limit {
                    self.shared.active.fetch_add(1, Ordering::AcqRel);
                    drop(queue);
                    job();
                } else {
                    queue.push_back(job);
                }
            }
        }
    }

    /// Return a permit, handing it to the oldest queued activation if any.
    pub(crate) fn release(&self) {
        if self.shared.size.is_none() {
            self.shared.active.fetch_sub(1, Ordering::AcqRel);
            return;
        }
        let next = {
            let mut queue = self.shared.queue.lock();
            match queue.pop_front() {
                // Permit hand-off: `active` stays unchanged.
                Some(job) => Some(job),
                None => {
                    self.shared.active.fetch_sub(1, Ordering::AcqRel);
                    None
                }
            }
        };
        if let Some(job) = next {
            job();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_unlimited_runs_inline() {
        let throttle = Throttle::unlimited();
        let ran = Arc::new(AtomicU32::new(0));

        let r = Arc::clone(&ran);
        throttle.submit(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(throttle.active(), 1);
        assert_eq!(throttle.waiting(), 0);
        throttle.release();
        assert_eq!(throttle.active(), 0);
    }

    #[test]
    fn test_size_one_queues_second() {
        let throttle = Throttle::of_size(1);
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            throttle.submit(Box::new(move || order.lock().push(tag)));
        }

        // Only the first ran; the rest queued in arrival order.
        assert_eq!(*order.lock(), vec!["first"]);
        assert_eq!(throttle.active(), 1);
        assert_eq!(throttle.waiting(), 2);

        throttle.release();
        assert_eq!(*order.lock(), vec!["first", "second"]);
        assert_eq!(throttle.active(), 1);

        throttle.release();
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);

        throttle.release();
        assert_eq!(throttle.active(), 0);
        assert_eq!(throttle.waiting(), 0);
    }

    #[test]
    fn test_of_size_zero_rounds_up() {
        let throttle = Throttle::of_size(0);
        assert_eq!(throttle.size(), Some(1));
    }

    #[test]
    fn test_observers() {
        let throttle = Throttle::of_size(3);
        assert_eq!(throttle.size(), Some(3));
        assert_eq!(Throttle::unlimited().size(), None);
        assert_eq!(throttle.active(), 0);
        assert_eq!(throttle.waiting(), 0);
    }
}
