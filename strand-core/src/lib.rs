//! Strand Core - Cooperative Per-Execution Async Runtime
//!
//! This crate provides a non-blocking execution runtime that gives handler
//! code a linear programming model on top of an event loop: each execution
//! is pinned to one worker, its work is linearised through a segment stream
//! with deterministic ordering, and asynchronous values compose through a
//! lazy one-shot promise type.
//!
//! # Design Patterns:
//! - Single-threaded-by-construction per-execution state (worker pinning)
//! - Reserved stream positions for off-thread completions
//! - Interceptors for cross-segment context propagation
//! - Typed hierarchical registry as the contextual data plane
//! - Single-fire caching promise, throttle, and fan-out for coordination
//!   across executions

pub mod config;
pub mod error;
pub mod exec;
pub mod metrics;
pub mod promise;
pub mod registry;

pub use config::ControllerConfig;
pub use error::{ExecError, SharedError};
pub use exec::{
    Continuation, ExecController, ExecControllerBuilder, ExecInterceptor, ExecSpec, ExecType,
    Execution, SpanInterceptor, StreamHandle,
};
pub use metrics::{ExecMetrics, ExecSnapshot, ScopedTimer, TimerType};
pub use promise::{CachedPromise, Downstream, ErrorRef, Outcome, Promise, Throttle, Upstream};
pub use registry::{MutableRegistry, Registry, RegistryBuilder};

use anyhow::Result;
use tracing::info;

/// Initialize tracing for the runtime with sensible defaults.
pub fn init() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    info!("Initializing Strand Runtime v{}", env!("CARGO_PKG_VERSION"));
    info!("Event loops: pinned current-thread tokio runtimes");
    info!("Blocking pool: tokio spawn_blocking executor");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // Only one global subscriber may exist per process; a second init in
        // the same test binary is allowed to fail.
        let _ = init();
    }
}
