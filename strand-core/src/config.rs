//! Controller configuration.
//!
//! Sizing and naming for the worker pool and the blocking executor.  The
//! defaults follow the runtime's scheduling model: twice as many event-loop
//! workers as logical CPUs (workers spend most of their time parked), and a
//! wide blocking pool since blocking work is I/O bound by definition.

use serde::{Deserialize, Serialize};

/// Configuration for an [`ExecController`](crate::ExecController).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Number of event-loop worker threads.
    pub compute_threads: usize,
    /// Maximum number of threads in the blocking executor.
    pub blocking_threads: usize,
    /// Prefix for worker and blocking thread names.
    pub thread_name_prefix: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            compute_threads: 2 * num_cpus::get(),
            blocking_threads: 512,
            thread_name_prefix: "strand".to_string(),
        }
    }
}
