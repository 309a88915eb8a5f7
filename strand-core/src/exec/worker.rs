//! Event-loop workers.
//!
//! Each worker is a dedicated OS thread driving a current-thread Tokio
//! runtime.  Executions are pinned to one worker for their whole life, which
//! makes every piece of per-execution state single-threaded by construction;
//! the runtime handle doubles as a cross-thread job queue (and timer) for
//! re-entering a parked execution.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

struct WorkerShared {
    index: usize,
    handle: tokio::runtime::Handle,
    thread_id: ThreadId,
}

/// A handle to one event-loop worker thread.
#[derive(Clone)]
pub(crate) struct EventLoopWorker {
    inner: Arc<WorkerShared>,
}

impl EventLoopWorker {
    /// Index of this worker within its group.
    pub(crate) fn index(&self) -> usize {
        self.inner.index
    }

    /// Returns `true` when called from this worker's thread.
    pub(crate) fn on_worker_thread(&self) -> bool {
        std::thread::current().id() == self.inner.thread_id
    }

    /// Run `job` on this worker's thread.
    pub(crate) fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.inner.handle.spawn(async move { job() });
    }

    /// Run `job` on this worker's thread after `delay`.
    pub(crate) fn execute_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        let _ = self.inner.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            job()
        });
    }
}

/// The fixed set of event-loop workers owned by a controller.
pub(crate) struct EventLoopGroup {
    workers: Vec<EventLoopWorker>,
    next: AtomicUsize,
    stops: Vec<Option<oneshot::Sender<()>>>,
    joins: Vec<Option<JoinHandle<()>>>,
}

impl EventLoopGroup {
    /// Spawn `count` worker threads named `{prefix}-loop-{i}`.
    pub(crate) fn new(count: usize, prefix: &str) -> Result<Self> {
        let count = count.max(1);
        info!(workers = count, "Starting event loop group");

        let mut workers = Vec::with_capacity(count);
        let mut stops = Vec::with_capacity(count);
        let mut joins = Vec::with_capacity(count);

        for index in 0..count {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .context("Failed to build event loop runtime")?;
            let handle = runtime.handle().clone();
            let (stop_tx, stop_rx) = oneshot::channel::<()>();

            let join = std::thread::Builder::new()
                .name(format!("{prefix}-loop-{index}"))
                .spawn(move || {
                    // The runtime drives cross-thread spawns and timers while
                    // this future stays parked on the stop signal.
                    runtime.block_on(async move {
                        let _ = stop_rx.await;
                    });
                })
                .context("Failed to spawn event loop thread")?;

            workers.push(EventLoopWorker {
                inner: Arc::new(WorkerShared {
                    index,
                    handle,
                    thread_id: join.thread().id(),
                }),
            });
            stops.push(Some(stop_tx));
            joins.push(Some(join));
        }

        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
            stops,
            joins,
        })
    }

    /// Number of workers in the group.
    pub(crate) fn len(&self) -> usize {
        self.workers.len()
    }

    /// Pick the next worker round-robin.
    pub(crate) fn next_worker(&self) -> EventLoopWorker {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index].clone()
    }

    /// Get a worker by index (wrapping).
    pub(crate) fn worker(&self, index: usize) -> EventLoopWorker {
        self.workers[index % self.workers.len()].clone()
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        debug!("Stopping event loop group");
        for stop in &mut self.stops {
            if let Some(tx) = stop.take() {
                let _ = tx.send(());
            }
        }
        // The group may be dropped from one of its own workers when the last
        // controller handle dies inside a task; that thread exits on its own
        // once the stop signal lands, and must not join itself.
        let current = std::thread::current().id();
        for join in &mut self.joins {
            if let Some(handle) = join.take() {
                if handle.thread().id() == current {
                    continue;
                }
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_jobs_run_on_named_worker_thread() {
        let group = EventLoopGroup::new(1, "test").unwrap();
        let worker = group.next_worker();

        let (tx, rx) = mpsc::channel();
        worker.execute(move || {
            let name = std::thread::current().name().map(str::to_string);
            let _ = tx.send(name);
        });

        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("test-loop-0"));
    }

    #[test]
    fn test_on_worker_thread_detection() {
        let group = EventLoopGroup::new(1, "test").unwrap();
        let worker = group.next_worker();
        assert!(!worker.on_worker_thread());

        let (tx, rx) = mpsc::channel();
        let probe = worker.clone();
        worker.execute(move || {
            let _ = tx.send(probe.on_worker_thread());
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_round_robin_cycles() {
        let group = EventLoopGroup::new(3, "test").unwrap();
        let picks: Vec<usize> = (0..6).map(|_| group.next_worker().index()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
        assert_eq!(group.worker(7).index(), 1);
        assert_eq!(group.len(), 3);
    }

    #[test]
    fn test_execute_after_delays() {
        let group = EventLoopGroup::new(1, "test").unwrap();
        let worker = group.next_worker();

        let (tx, rx) = mpsc::channel();
        let start = std::time::Instant::now();
        worker.execute_after(Duration::from_millis(30), move || {
            let _ = tx.send(start.elapsed());
        });

        let elapsed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(elapsed >= Duration::from_millis(30));
    }
}
