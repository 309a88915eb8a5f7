//! Performance Monitoring for the Execution Runtime
//!
//! This module provides lightweight performance tracking for runtime
//! operations, enabling throughput and latency observation without touching
//! the hot path.
//!
//! # Design Goals:
//! - < 1μs overhead per measurement
//! - Lock-free atomic counters
//! - Zero-allocation in hot paths

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Global performance metrics for a controller and its executions.
pub struct ExecMetrics {
    // Execution lifecycle
    pub executions_started: AtomicU64,
    pub executions_completed: AtomicU64,
    pub execution_time_ns: AtomicU64,

    // Segment scheduling
    pub segments_run: AtomicU64,
    pub user_errors: AtomicU64,

    // Blocking executor
    pub blocking_ops: AtomicU64,
    pub blocking_time_ns: AtomicU64,

    // Caching promise
    pub cache_fills: AtomicU64,
    pub cache_hits: AtomicU64,
}

impl ExecMetrics {
    /// Create a new metrics tracker.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record the start of an execution.
    pub fn record_execution_started(&self) {
        self.executions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed execution and its wall-clock lifetime.
    pub fn record_execution_completed(&self, duration: Duration) {
        self.executions_completed.fetch_add(1, Ordering::Relaxed);
        self.execution_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record one user-code segment run.
    pub fn record_segment(&self) {
        self.segments_run.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a user error routed to an execution's error handler.
    pub fn record_user_error(&self) {
        self.user_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a blocking operation and its duration.
    pub fn record_blocking(&self, duration: Duration) {
        self.blocking_ops.fetch_add(1, Ordering::Relaxed);
        self.blocking_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Record the single upstream fire of a caching promise.
    pub fn record_cache_fill(&self) {
        self.cache_fills.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a waiter served from a caching promise's stored result.
    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> ExecSnapshot {
        ExecSnapshot {
            executions_started: self.executions_started.load(Ordering::Relaxed),
            executions_completed: self.executions_completed.load(Ordering::Relaxed),
            avg_execution_ms: self
                .avg_duration_ms(&self.executions_completed, &self.execution_time_ns),
            segments_run: self.segments_run.load(Ordering::Relaxed),
            user_errors: self.user_errors.load(Ordering::Relaxed),
            blocking_ops: self.blocking_ops.load(Ordering::Relaxed),
            avg_blocking_ms: self.avg_duration_ms(&self.blocking_ops, &self.blocking_time_ns),
            cache_fills: self.cache_fills.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
        }
    }

    /// Calculate average duration in milliseconds.
    fn avg_duration_ms(&self, count: &AtomicU64, total_ns: &AtomicU64) -> f64 {
        let c = count.load(Ordering::Relaxed);
        if c == 0 {
            return 0.0;
        }
        let total = total_ns.load(Ordering::Relaxed);
        (total as f64) / (c as f64) / 1_000_000.0
    }

    /// Reset all metrics to zero.
    pub fn reset(&self) {
        self.executions_started.store(0, Ordering::Relaxed);
        self.executions_completed.store(0, Ordering::Relaxed);
        self.execution_time_ns.store(0, Ordering::Relaxed);
        self.segments_run.store(0, Ordering::Relaxed);
        self.user_errors.store(0, Ordering::Relaxed);
        self.blocking_ops.store(0, Ordering::Relaxed);
        self.blocking_time_ns.store(0, Ordering::Relaxed);
        self.cache_fills.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
    }
}

impl Default for ExecMetrics {
    fn default() -> Self {
        Self {
            executions_started: AtomicU64::new(0),
            executions_completed: AtomicU64::new(0),
            execution_time_ns: AtomicU64::new(0),
            segments_run: AtomicU64::new(0),
            user_errors: AtomicU64::new(0),
            blocking_ops: AtomicU64::new(0),
            blocking_time_ns: AtomicU64::new(0),
            cache_fills: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
        }
    }
}

/// A point-in-time snapshot of runtime metrics.
#[derive(Debug, Clone)]
pub struct ExecSnapshot {
    pub executions_started: u64,
    pub executions_completed: u64,
    pub avg_execution_ms: f64,
    pub segments_run: u64,
    pub user_errors: u64,
    pub blocking_ops: u64,
    pub avg_blocking_ms: f64,
    pub cache_fills: u64,
    pub cache_hits: u64,
}

impl ExecSnapshot {
    /// Print a human-readable runtime report.
    pub fn print_report(&self) {
        println!("╔═══════════════════════════════════════════════════════════╗");
        println!("║             Strand Runtime Metrics Report                 ║");
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Executions                                                ║");
        println!(
            "║   Started:     {:>8}                                   ║",
            self.executions_started
        );
        println!(
            "║   Completed:   {:>8} (avg: {:>8.3} ms)              ║",
            self.executions_completed, self.avg_execution_ms
        );
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Segments                                                  ║");
        println!(
            "║   Run:         {:>8}                                   ║",
            self.segments_run
        );
        println!(
            "║   User errors: {:>8}                                   ║",
            self.user_errors
        );
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Blocking Executor                                         ║");
        println!(
            "║   Operations:  {:>8} (avg: {:>8.3} ms)              ║",
            self.blocking_ops, self.avg_blocking_ms
        );
        println!("╠═══════════════════════════════════════════════════════════╣");
        println!("║ Caching Promises                                          ║");
        println!(
            "║   Fills:       {:>8}                                   ║",
            self.cache_fills
        );
        println!(
            "║   Hits:        {:>8}                                   ║",
            self.cache_hits
        );
        println!("╚═══════════════════════════════════════════════════════════╝");
    }
}

/// A scoped timer that records a duration on drop.
pub struct ScopedTimer<'a> {
    start: Instant,
    metrics: &'a ExecMetrics,
    metric_type: TimerType,
}

pub enum TimerType {
    Blocking,
}

impl<'a> ScopedTimer<'a> {
    /// Create a new scoped timer.
    pub fn new(metrics: &'a ExecMetrics, metric_type: TimerType) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            metric_type,
        }
    }
}

impl<'a> Drop for ScopedTimer<'a> {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        match self.metric_type {
            TimerType::Blocking => self.metrics.record_blocking(duration),
        }
    }
}
