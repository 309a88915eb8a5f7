//! The Execution - One Logical Thread of Control
//!
//! An execution is a cooperative task pinned to a single event-loop worker.
//! Its segment stream linearises all of its work: exactly one segment of an
//! execution runs at any instant, segments within a scope run FIFO, and
//! nested scopes (reservations) preempt the remainder of their parent.
//!
//! # Scheduling Model:
//! - The drain loop runs segments on the owning worker only
//! - A thread binding marks the execution active for re-entrancy detection
//! - Off-thread completions re-enter through `event_loop_drain`
//! - The terminal marker flips `done`; when the stream then empties, the
//!   completion hook and close hooks run and the execution is finished

use parking_lot::Mutex;
use std::any::Any;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error};

use super::controller::ExecController;
use super::interceptor::{run_intercepted, ExecInterceptor, ExecType};
use super::stream::{Segment, StreamHandle, StreamNode, UserSegmentFn};
use super::worker::EventLoopWorker;
use crate::error::ExecError;
use crate::registry::{MutableRegistry, Registry};

pub(crate) type ErrorHandlerFn =
    Box<dyn FnMut(&Arc<Execution>, anyhow::Error) -> anyhow::Result<()> + Send>;
pub(crate) type CompleteFn = Box<dyn FnOnce(&Arc<Execution>) + Send>;
type CloseHookFn = Box<dyn FnOnce(&Arc<Execution>) -> anyhow::Result<()> + Send>;

thread_local! {
    static THREAD_BINDING: RefCell<Option<Arc<Execution>>> = const { RefCell::new(None) };
}

/// Clears the thread binding when a drain frame exits, including on panic.
struct BindingGuard;

impl BindingGuard {
    fn bind(execution: &Arc<Execution>) -> Self {
        THREAD_BINDING.with(|binding| {
            *binding.borrow_mut() = Some(Arc::clone(execution));
        });
        Self
    }
}

impl Drop for BindingGuard {
    fn drop(&mut self) {
        THREAD_BINDING.with(|binding| {
            *binding.borrow_mut() = None;
        });
    }
}

/// One logical cooperative task, pinned to an event-loop worker.
pub struct Execution {
    id: u64,
    weak: Weak<Execution>,
    worker: EventLoopWorker,
    controller: ExecController,
    root: Arc<StreamNode>,
    current: Mutex<Arc<StreamNode>>,
    done: AtomicBool,
    started_at: Instant,
    overlay: MutableRegistry,
    base_registry: Registry,
    on_error: Mutex<ErrorHandlerFn>,
    on_complete: Mutex<Option<CompleteFn>>,
    close_hooks: Mutex<Vec<CloseHookFn>>,
    base_interceptors: Vec<Arc<dyn ExecInterceptor>>,
    adhoc_interceptors: Mutex<Vec<Arc<dyn ExecInterceptor>>>,
}

impl Execution {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        worker: EventLoopWorker,
        controller: ExecController,
        base_registry: Registry,
        overlay: MutableRegistry,
        base_interceptors: Vec<Arc<dyn ExecInterceptor>>,
        on_error: ErrorHandlerFn,
        on_complete: Option<CompleteFn>,
    ) -> Arc<Self> {
        let root = StreamNode::root();
        Arc::new_cyclic(|weak| Self {
            id,
            weak: weak.clone(),
            worker,
            controller,
            current: Mutex::new(Arc::clone(&root)),
            root,
            done: AtomicBool::new(false),
            started_at: Instant::now(),
            overlay,
            base_registry,
            on_error: Mutex::new(on_error),
            on_complete: Mutex::new(on_complete),
            close_hooks: Mutex::new(Vec::new()),
            base_interceptors,
            adhoc_interceptors: Mutex::new(Vec::new()),
        })
    }

    /// The execution bound to the current thread.
    ///
    /// Fails with [`ExecError::UnmanagedThread`] when the calling thread is
    /// not running a segment.
    pub fn current() -> Result<Arc<Execution>, ExecError> {
        Self::try_current().ok_or(ExecError::UnmanagedThread)
    }

    /// The execution bound to the current thread, if any.
    pub fn try_current() -> Option<Arc<Execution>> {
        THREAD_BINDING.with(|binding| binding.borrow().clone())
    }

    /// Unique id of this execution within its controller.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The controller that started this execution.
    pub fn controller(&self) -> &ExecController {
        &self.controller
    }

    /// Returns `true` once the terminal marker has been processed.
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    // ── registry access ───────────────────────────────────────────────

    /// The mutable registry overlay of this execution.
    pub fn registry(&self) -> &MutableRegistry {
        &self.overlay
    }

    /// Add a value to the execution's registry overlay.
    pub fn add<T: Any + Send + Sync>(&self, value: T) {
        self.overlay.add(value);
    }

    /// Look up `T` in the overlay first, then in the base registry.
    pub fn maybe_get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.overlay
            .maybe_get::<T>()
            .or_else(|| self.base_registry.maybe_get::<T>())
    }

    /// Like [`maybe_get`](Self::maybe_get), but a miss is an error.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ExecError> {
        self.maybe_get::<T>()
            .ok_or_else(|| ExecError::NotInRegistry(std::any::type_name::<T>()))
    }

    /// All values of `T`, overlay entries before base entries.
    pub fn get_all<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        let mut out = self.overlay.get_all::<T>();
        out.extend(self.base_registry.get_all::<T>());
        out
    }

    // ── hooks and interceptors ────────────────────────────────────────

    /// Register a hook to run when the execution terminates.  Hooks run in
    /// registration order; a failing hook is logged and does not prevent
    /// later hooks from running.
    pub fn on_close(
        &self,
        hook: impl FnOnce(&Arc<Execution>) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.close_hooks.lock().push(Box::new(hook));
    }

    /// Register an interceptor for the remainder of this execution.
    pub fn add_interceptor(&self, interceptor: Arc<dyn ExecInterceptor>) {
        self.adhoc_interceptors.lock().push(interceptor);
    }

    /// The effective interceptor chain: global, then registry-scoped
    /// (snapshotted at start), then ad-hoc.
    pub(crate) fn interceptor_chain(&self) -> Vec<Arc<dyn ExecInterceptor>> {
        let adhoc = self.adhoc_interceptors.lock();
        let mut chain = Vec::with_capacity(self.base_interceptors.len() + adhoc.len());
        chain.extend(self.base_interceptors.iter().cloned());
        chain.extend(adhoc.iter().cloned());
        chain
    }

    // ── stream operations ─────────────────────────────────────────────

    /// Reserve a position in the stream.
    ///
    /// `consumer` is appended to the current scope as an infrastructure
    /// segment; when it runs, a nested scope is pushed and the consumer
    /// receives its [`StreamHandle`].  Segments enqueued through the handle
    /// run before any segment queued after this reservation in the parent
    /// scope.
    pub fn subscribe(
        &self,
        consumer: impl FnOnce(StreamHandle) + Send + 'static,
    ) -> Result<(), ExecError> {
        if self.done.load(Ordering::Acquire) {
            return Err(ExecError::ExecutionCompleted(self.id));
        }
        self.current
            .lock()
            .push(Segment::Infra(Box::new(move |execution| {
                let parent = execution.current.lock().clone();
                let node = StreamNode::nested(parent);
                *execution.current.lock() = Arc::clone(&node);
                consumer(StreamHandle::new(Arc::clone(execution), node));
            })));
        self.drain();
        Ok(())
    }

    /// Request a drain on the owning worker.  Used to re-enter a parked
    /// execution after an off-thread completion.
    pub fn event_loop_drain(&self) {
        let this = self.arc();
        self.worker.execute(move || this.drain());
    }

    /// Run `job` on the owning worker after `delay`.
    pub(crate) fn schedule_after(&self, delay: Duration, job: impl FnOnce() + Send + 'static) {
        self.worker.execute_after(delay, job);
    }

    /// Enqueue the initial action and the terminal marker, then kick off the
    /// first drain.
    pub(crate) fn launch(&self, action: UserSegmentFn) {
        self.root.push(Segment::User(action));
        self.root.push(Segment::Terminal);
        self.event_loop_drain();
    }

    // ── the drain ─────────────────────────────────────────────────────

    /// Run queued segments on the owning worker until the stream parks or
    /// the execution finishes.
    pub(crate) fn drain(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        // Re-entrancy guard: an enclosing drain frame on this thread will
        // pick up whatever was just queued.
        let bound_to_other = THREAD_BINDING.with(|binding| match &*binding.borrow() {
            Some(bound) => {
                if std::ptr::eq(Arc::as_ptr(bound), self) {
                    None
                } else {
                    Some(true)
                }
            }
            None => Some(false),
        });
        let bound_to_other = match bound_to_other {
            None => return,
            Some(flag) => flag,
        };
        if !self.worker.on_worker_thread() || bound_to_other {
            self.event_loop_drain();
            return;
        }

        let this = self.arc();
        let _binding = BindingGuard::bind(&this);
        loop {
            let segment = {
                let node = self.current.lock().clone();
                node.pop()
            };
            match segment {
                Some(segment) => self.run_segment(segment),
                None => {
                    // Head scope empty: the execution either finished or
                    // parks until an off-thread completion re-enters.
                    if self.done.load(Ordering::Acquire) {
                        self.finish();
                    }
                    return;
                }
            }
        }
    }

    fn run_segment(&self, segment: Segment) {
        match segment {
            Segment::User(f) => self.run_user(f),
            Segment::Infra(f) => f(&self.arc()),
            Segment::Error(err) => self.invoke_error_handler(err),
            Segment::Pop { node, then } => {
                if let Some(parent) = node.parent() {
                    *self.current.lock() = Arc::clone(parent);
                }
                if let Some(f) = then {
                    self.run_user(f);
                }
            }
            Segment::Terminal => {
                if self.root.is_empty() {
                    debug!(execution = self.id, "Terminal marker reached");
                    self.done.store(true, Ordering::Release);
                } else {
                    // Segments were scheduled behind the marker during this
                    // execution; the marker stays last.
                    self.root.push(Segment::Terminal);
                }
            }
        }
    }

    fn run_user(&self, f: UserSegmentFn) {
        let this = self.arc();
        self.controller.metrics().record_segment();
        let chain = self.interceptor_chain();
        let mut f = Some(f);
        let result = run_intercepted(&chain, &this, ExecType::Compute, || match f.take() {
            Some(f) => f(&this),
            None => Ok(()),
        });
        if let Err(err) = result {
            self.route_user_error(err);
        }
    }

    /// Route a user error: clear the current scope and replace it with a
    /// single segment invoking the execution's error handler.
    pub(crate) fn route_user_error(&self, err: anyhow::Error) {
        self.controller.metrics().record_user_error();
        let node = self.current.lock().clone();
        let dropped = node.clear();
        let had_terminal = dropped.iter().any(|s| matches!(s, Segment::Terminal));
        node.push(Segment::Error(err));
        if had_terminal {
            node.push(Segment::Terminal);
        }
    }

    fn invoke_error_handler(&self, err: anyhow::Error) {
        let this = self.arc();
        let result = {
            let mut guard = self.on_error.lock();
            (guard.as_mut())(&this, err)
        };
        if let Err(next) = result {
            // The handler itself failed: schedule the failure as a fresh
            // user segment so interceptors and default logging still see it.
            self.current
                .lock()
                .push(Segment::User(Box::new(move |_| Err(next))));
        }
    }

    fn finish(&self) {
        let this = self.arc();
        debug!(execution = self.id, "Execution complete");
        let on_complete = self.on_complete.lock().take();
        if let Some(hook) = on_complete {
            hook(&this);
        }
        let hooks: Vec<CloseHookFn> = std::mem::take(&mut *self.close_hooks.lock());
        for hook in hooks {
            if let Err(err) = hook(&this) {
                error!(
                    execution = self.id,
                    error = %format!("{err:#}"),
                    "Close hook failed"
                );
            }
        }
        self.controller
            .metrics()
            .record_execution_completed(self.started_at.elapsed());
    }

    fn arc(&self) -> Arc<Execution> {
        self.weak.upgrade().expect("execution still referenced")
    }
}

/// The default error handler: logs at error level.
pub(crate) fn default_error_handler() -> ErrorHandlerFn {
    Box::new(|execution, err| {
        error!(
            execution = execution.id(),
            error = %format!("{err:#}"),
            "Unhandled execution error"
        );
        Ok(())
    })
}
