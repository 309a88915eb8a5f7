//! Throughput demo: drive a batch of executions through the runtime and
//! print the metrics report.
//!
//! ```sh
//! cargo run -p strand-core --example throughput
//! ```

use anyhow::Result;
use std::sync::mpsc;
use std::time::Instant;
use strand_core::{ExecController, Promise};

const EXECUTIONS: usize = 10_000;

fn main() -> Result<()> {
    strand_core::init()?;

    let controller = ExecController::new()?;
    let (tx, rx) = mpsc::channel();

    let start = Instant::now();
    for index in 0..EXECUTIONS {
        let tx = tx.clone();
        controller.start(move |_| {
            Promise::of(index)
                .map(|n| n * 2)
                .try_map(|n| Ok(n + 1))
                .then(move |_| {
                    let _ = tx.send(());
                    Ok(())
                })?;
            Ok(())
        });
    }
    for _ in 0..EXECUTIONS {
        rx.recv()?;
    }
    let elapsed = start.elapsed();

    let rate = EXECUTIONS as f64 / elapsed.as_secs_f64();
    println!("{EXECUTIONS} executions in {elapsed:?} ({rate:.0}/s)");
    controller.metrics().snapshot().print_report();

    Ok(())
}
