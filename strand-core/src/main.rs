//! Strand - Cooperative Execution Runtime
//!
//! A small demonstration driver: starts a controller, runs a promise chain
//! and a blocking hop through one execution, and prints the metrics report.

use anyhow::Result;
use std::sync::mpsc;
use std::sync::Arc;
use strand_core::{init, ExecController, Promise, SpanInterceptor};
use tracing::info;

fn main() -> Result<()> {
    // Initialize the runtime
    init()?;

    let controller = ExecController::builder()
        .add_interceptor(Arc::new(SpanInterceptor))
        .build()?;
    info!(
        workers = controller.worker_count(),
        "Strand controller started"
    );

    let (tx, rx) = mpsc::channel();
    let blocking = controller.clone();
    controller
        .fork()
        .on_complete(move |_| {
            let _ = tx.send(());
        })
        .start(move |_execution| {
            blocking
                .blocking(|| Ok("payload".to_string()))
                .map(|payload| payload.len())
                .then(|len| {
                    info!(len, "Handled demo request");
                    Ok(())
                })?;
            Promise::of(2).map(|n| n * 3).then(|n| {
                info!(n, "Computed demo value");
                Ok(())
            })?;
            Ok(())
        });

    rx.recv()?;
    controller.metrics().snapshot().print_report();

    Ok(())
}
