//! Exec module - the cooperative scheduler.
//!
//! Contains the execution controller, the execution and its segment stream,
//! the event-loop worker group, and the interceptor pipeline.

pub mod controller;
pub mod execution;
pub mod interceptor;
pub mod stream;
pub(crate) mod worker;

pub use controller::{ExecController, ExecControllerBuilder, ExecSpec};
pub use execution::Execution;
pub use interceptor::{Continuation, ExecInterceptor, ExecType, SpanInterceptor};
pub use stream::StreamHandle;
