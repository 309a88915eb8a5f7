//! The Execution Controller
//!
//! Owns the event-loop worker group and the blocking executor, and is the
//! factory for executions.  A fixed worker set with per-execution pinning
//! makes all per-execution state single-threaded by construction and keeps
//! locking off the hot path.

use anyhow::{Context, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use super::execution::{default_error_handler, CompleteFn, ErrorHandlerFn, Execution};
use super::interceptor::{run_intercepted, ExecInterceptor, ExecType};
use super::worker::{EventLoopGroup, EventLoopWorker};
use crate::config::ControllerConfig;
use crate::metrics::{ExecMetrics, ScopedTimer, TimerType};
use crate::promise::{Downstream, Promise};
use crate::registry::{MutableRegistry, Registry};

struct ControllerShared {
    config: ControllerConfig,
    workers: EventLoopGroup,
    blocking: parking_lot::Mutex<Option<tokio::runtime::Runtime>>,
    blocking_handle: tokio::runtime::Handle,
    interceptors: Vec<Arc<dyn ExecInterceptor>>,
    base_registry: Registry,
    metrics: Arc<ExecMetrics>,
    next_execution_id: AtomicU64,
}

impl Drop for ControllerShared {
    fn drop(&mut self) {
        // The last controller handle may die inside a worker task, where a
        // normal runtime drop would block in an async context.
        if let Some(runtime) = self.blocking.lock().take() {
            runtime.shutdown_background();
        }
    }
}

/// Factory and owner of executions.
///
/// Cloning a controller is cheap and shares the same worker group, blocking
/// pool, and metrics.
///
/// ```rust,no_run
/// # fn main() -> anyhow::Result<()> {
/// use strand_core::{ExecController, Promise};
/// let controller = ExecController::new()?;
/// controller.start(|_execution| {
///     Promise::of(2).map(|n| n * 3).then(|n| {
///         println!("{n}");
///         Ok(())
///     })?;
///     Ok(())
/// });
/// # Ok(()) }
/// ```
#[derive(Clone)]
pub struct ExecController {
    inner: Arc<ControllerShared>,
}

impl ExecController {
    /// Create a controller with default configuration.
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a controller with the given configuration.
    pub fn with_config(config: ControllerConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Start building a controller.
    pub fn builder() -> ExecControllerBuilder {
        ExecControllerBuilder {
            config: ControllerConfig::default(),
            interceptors: Vec::new(),
            base_registry: Registry::empty(),
        }
    }

    /// Begin configuring a new execution.
    pub fn fork(&self) -> ExecSpec {
        ExecSpec {
            controller: self.clone(),
            on_error: default_error_handler(),
            on_complete: None,
            registry_init: None,
            worker: None,
        }
    }

    /// Start an execution with default error and completion handling.
    pub fn start(
        &self,
        action: impl FnOnce(&Arc<Execution>) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.fork().start(action);
    }

    /// Run `func` on the blocking executor, delivering its result back on
    /// the owning execution's worker.
    ///
    /// Interceptors wrap the blocking body with `ExecType::Blocking` on the
    /// blocking thread, so context propagation spans the hop.
    pub fn blocking<T, F>(&self, func: F) -> Promise<T>
    where
        T: Send + 'static,
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let controller = self.clone();
        Promise::from_async(move |downstream: Downstream<T>| {
            let execution = match Execution::current() {
                Ok(execution) => execution,
                Err(err) => {
                    downstream.error(err.into());
                    return;
                }
            };
            let metrics = Arc::clone(controller.metrics());
            let _ = controller.inner.blocking_handle.spawn_blocking(move || {
                let _timer = ScopedTimer::new(&metrics, TimerType::Blocking);
                let chain = execution.interceptor_chain();
                let mut func = Some(func);
                let mut value = None;
                let result =
                    run_intercepted(&chain, &execution, ExecType::Blocking, || match func.take() {
                        Some(f) => {
                            value = Some(f()?);
                            Ok(())
                        }
                        None => Ok(()),
                    });
                match result {
                    Ok(()) => match value {
                        Some(value) => downstream.success(value),
                        None => downstream.complete(),
                    },
                    Err(err) => downstream.error(err),
                }
            });
        })
    }

    /// A promise already resolved with `value`.
    pub fn promise_of<T: Send + 'static>(&self, value: T) -> Promise<T> {
        Promise::of(value)
    }

    /// A promise built from an asynchronous producer.
    pub fn promise<T: Send + 'static>(
        &self,
        producer: impl FnOnce(Downstream<T>) + Send + 'static,
    ) -> Promise<T> {
        Promise::from_async(producer)
    }

    /// Runtime metrics shared by all executions of this controller.
    pub fn metrics(&self) -> &Arc<ExecMetrics> {
        &self.inner.metrics
    }

    /// The configuration this controller was built with.
    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// Number of event-loop workers.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub(crate) fn next_worker(&self) -> EventLoopWorker {
        self.inner.workers.next_worker()
    }

    pub(crate) fn worker(&self, index: usize) -> EventLoopWorker {
        self.inner.workers.worker(index)
    }
}

/// Builder for an [`ExecController`].
pub struct ExecControllerBuilder {
    config: ControllerConfig,
    interceptors: Vec<Arc<dyn ExecInterceptor>>,
    base_registry: Registry,
}

impl ExecControllerBuilder {
    /// Use the given configuration.
    pub fn config(mut self, config: ControllerConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a controller-wide interceptor.  The set is fixed once built.
    pub fn add_interceptor(mut self, interceptor: Arc<dyn ExecInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Registry joined under every execution of this controller.
    pub fn base_registry(mut self, registry: Registry) -> Self {
        self.base_registry = registry;
        self
    }

    /// Build the controller, spawning its worker and blocking pools.
    pub fn build(self) -> Result<ExecController> {
        let workers =
            EventLoopGroup::new(self.config.compute_threads, &self.config.thread_name_prefix)?;
        let blocking = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.config.blocking_threads.max(1))
            .thread_name(format!("{}-blocking", self.config.thread_name_prefix))
            .enable_all()
            .build()
            .context("Failed to build blocking executor")?;

        info!(
            workers = workers.len(),
            blocking = self.config.blocking_threads,
            "Execution controller ready"
        );

        let blocking_handle = blocking.handle().clone();
        Ok(ExecController {
            inner: Arc::new(ControllerShared {
                config: self.config,
                workers,
                blocking: parking_lot::Mutex::new(Some(blocking)),
                blocking_handle,
                interceptors: self.interceptors,
                base_registry: self.base_registry,
                metrics: ExecMetrics::new(),
                next_execution_id: AtomicU64::new(1),
            }),
        })
    }
}

/// Fluent configuration for one execution, created by
/// [`ExecController::fork`].
pub struct ExecSpec {
    controller: ExecController,
    on_error: ErrorHandlerFn,
    on_complete: Option<CompleteFn>,
    registry_init: Option<Box<dyn FnOnce(&MutableRegistry) + Send>>,
    worker: Option<usize>,
}

impl ExecSpec {
    /// Handler for user errors routed out of segments.  The default logs at
    /// error level.
    pub fn on_error(
        mut self,
        handler: impl FnMut(&Arc<Execution>, anyhow::Error) -> anyhow::Result<()> + Send + 'static,
    ) -> Self {
        self.on_error = Box::new(handler);
        self
    }

    /// Hook invoked once the terminal marker has been processed and the
    /// stream has emptied, before close hooks.
    pub fn on_complete(mut self, hook: impl FnOnce(&Arc<Execution>) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(hook));
        self
    }

    /// Seed the execution's registry overlay before the first segment runs.
    pub fn register(mut self, init: impl FnOnce(&MutableRegistry) + Send + 'static) -> Self {
        self.registry_init = Some(Box::new(init));
        self
    }

    /// Pin the execution to a specific worker instead of round-robin.
    pub fn pin_to(mut self, worker: usize) -> Self {
        self.worker = Some(worker);
        self
    }

    /// Start the execution with `action` as its first user-code segment.
    pub fn start(
        self,
        action: impl FnOnce(&Arc<Execution>) -> anyhow::Result<()> + Send + 'static,
    ) {
        let controller = self.controller;
        let id = controller
            .inner
            .next_execution_id
            .fetch_add(1, Ordering::Relaxed);
        let worker = match self.worker {
            Some(index) => controller.worker(index),
            None => controller.next_worker(),
        };

        let overlay = MutableRegistry::new();
        if let Some(init) = self.registry_init {
            init(&overlay);
        }

        // Interceptor snapshot: global first, then registry-scoped entries
        // present at start (overlay before base registry).
        let mut interceptors = controller.inner.interceptors.clone();
        interceptors.extend(
            overlay
                .get_all::<Arc<dyn ExecInterceptor>>()
                .iter()
                .map(|i| Arc::clone(i.as_ref())),
        );
        interceptors.extend(
            controller
                .inner
                .base_registry
                .get_all::<Arc<dyn ExecInterceptor>>()
                .iter()
                .map(|i| Arc::clone(i.as_ref())),
        );

        debug!(execution = id, worker = worker.index(), "Starting execution");
        controller.metrics().record_execution_started();

        let execution = Execution::new(
            id,
            worker,
            controller.clone(),
            controller.inner.base_registry.clone(),
            overlay,
            interceptors,
            self.on_error,
            self.on_complete,
        );
        execution.launch(Box::new(action));
    }
}
