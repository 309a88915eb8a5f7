//! Performance benchmarks for Strand Core.
//!
//! These tests measure timing for key operations and validate that
//! performance stays within acceptable bounds. Run with:
//!
//! ```sh
//! cargo test -p strand-core --test benchmarks -- --ignored --nocapture
//! ```

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Instant;

use strand_core::{ControllerConfig, ExecController, Promise, Registry, Throttle};

fn bench_controller() -> ExecController {
    ExecController::with_config(ControllerConfig {
        compute_threads: 4,
        blocking_threads: 8,
        ..Default::default()
    })
    .expect("controller")
}

// ---------------------------------------------------------------------------
// Execution startup benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_execution_throughput() {
    const ITERATIONS: usize = 1_000;
    let controller = bench_controller();
    let (tx, rx) = mpsc::channel();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        let tx = tx.clone();
        controller
            .fork()
            .on_complete(move |_| {
                let _ = tx.send(());
            })
            .start(|_| Ok(()));
    }
    for _ in 0..ITERATIONS {
        rx.recv().unwrap();
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!(
        "[bench_execution_throughput] {ITERATIONS} executions in {elapsed:?} ({per_iter:?}/iter)"
    );
    assert!(
        elapsed.as_millis() < 5_000,
        "1000 empty executions should finish in < 5 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Promise chain benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_promise_chain() {
    const ITERATIONS: usize = 1_000;
    let controller = bench_controller();
    let (tx, rx) = mpsc::channel();

    let start = Instant::now();
    for _ in 0..ITERATIONS {
        let tx = tx.clone();
        controller.start(move |_| {
            Promise::of(1_u64)
                .map(|n| n + 1)
                .map(|n| n * 3)
                .try_map(|n| Ok(n - 2))
                .then(move |n| {
                    let _ = tx.send(n);
                    Ok(())
                })?;
            Ok(())
        });
    }
    for _ in 0..ITERATIONS {
        assert_eq!(rx.recv().unwrap(), 4);
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / ITERATIONS as u32;

    eprintln!(
        "[bench_promise_chain] {ITERATIONS} four-stage chains in {elapsed:?} ({per_iter:?}/iter)"
    );
    assert!(
        elapsed.as_millis() < 5_000,
        "1000 promise chains should finish in < 5 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Registry lookup benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_registry_lookups() {
    const LOOKUPS: usize = 100_000;
    let parent = Registry::builder()
        .add(1_u32)
        .add("deep".to_string())
        .add(2.5_f64)
        .build();
    let registry = parent.join(Registry::single(9_u8));

    let start = Instant::now();
    for _ in 0..LOOKUPS {
        // One cached-hit and one fall-through lookup per iteration.
        assert!(registry.maybe_get::<u8>().is_some());
        assert!(registry.maybe_get::<String>().is_some());
    }
    let elapsed = start.elapsed();
    let per_iter = elapsed / LOOKUPS as u32;

    eprintln!("[bench_registry_lookups] {LOOKUPS} lookup pairs in {elapsed:?} ({per_iter:?}/iter)");
    assert!(
        elapsed.as_millis() < 2_000,
        "100k joined lookups should finish in < 2 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Throttle benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_throttled_promises() {
    const ITERATIONS: usize = 200;
    let controller = bench_controller();
    let throttle = Throttle::of_size(8);
    let (tx, rx) = mpsc::channel();

    let start = Instant::now();
    for index in 0..ITERATIONS {
        let throttle = throttle.clone();
        let tx = tx.clone();
        controller.start(move |_| {
            Promise::of(index)
                .throttled(&throttle)
                .then(move |index| {
                    let _ = tx.send(index);
                    Ok(())
                })?;
            Ok(())
        });
    }
    for _ in 0..ITERATIONS {
        rx.recv().unwrap();
    }
    let elapsed = start.elapsed();

    eprintln!(
        "[bench_throttled_promises] {ITERATIONS} activations behind 8 permits in {elapsed:?}"
    );
    assert_eq!(throttle.active(), 0);
    assert_eq!(throttle.waiting(), 0);
    assert!(
        elapsed.as_millis() < 5_000,
        "200 throttled promises should finish in < 5 s, got {elapsed:?}"
    );
}

// ---------------------------------------------------------------------------
// Caching promise benchmark
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn bench_caching_promise_fan_in() {
    const WAITERS: usize = 500;
    let controller = bench_controller();
    let (tx, rx) = mpsc::channel();

    let cached = Promise::from_callable(|| Ok(Arc::new(vec![1_u8; 1024]))).cached();

    let start = Instant::now();
    for _ in 0..WAITERS {
        let cached = cached.clone();
        let tx = tx.clone();
        controller.start(move |_| {
            cached.promise().then(move |payload| {
                let _ = tx.send(payload.len());
                Ok(())
            })?;
            Ok(())
        });
    }
    for _ in 0..WAITERS {
        assert_eq!(rx.recv().unwrap(), 1024);
    }
    let elapsed = start.elapsed();

    eprintln!("[bench_caching_promise_fan_in] {WAITERS} waiters served in {elapsed:?}");
    assert!(
        elapsed.as_millis() < 5_000,
        "500 cache waiters should finish in < 5 s, got {elapsed:?}"
    );
}
