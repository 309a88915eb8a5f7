//! The per-execution segment stream.
//!
//! Logically a stack of FIFO queues: the head node is the currently
//! executing scope, and reserving a position (via
//! [`Execution::subscribe`](super::execution::Execution::subscribe)) pushes
//! a fresh nested node whose segments run before the parent's remaining
//! segments.  Only the queues need cross-thread safety — completions may
//! arrive from the blocking pool, a timer, or another execution's worker —
//! so each node guards its queue with a mutex while the stack itself is a
//! parent pointer walked only on the owning worker.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::execution::Execution;

/// A user-code segment: intercepted, and routed to the execution's error
/// handler on failure.
pub(crate) type UserSegmentFn = Box<dyn FnOnce(&Arc<Execution>) -> anyhow::Result<()> + Send>;

/// An infrastructure segment: runtime plumbing, not intercepted.
pub(crate) type InfraSegmentFn = Box<dyn FnOnce(&Arc<Execution>) + Send>;

pub(crate) enum Segment {
    User(UserSegmentFn),
    Infra(InfraSegmentFn),
    /// Routes a user error into the execution's error handler.
    Error(anyhow::Error),
    /// Pops `node` back to its parent, then optionally runs a user segment
    /// in the parent scope.
    Pop {
        node: Arc<StreamNode>,
        then: Option<UserSegmentFn>,
    },
    /// The distinguished terminal marker.  Lives only in the root node and
    /// keeps floating to the tail until the root drains behind it.
    Terminal,
}

/// One scope of the stream: a FIFO of segments plus a parent pointer.
pub(crate) struct StreamNode {
    queue: Mutex<VecDeque<Segment>>,
    parent: Option<Arc<StreamNode>>,
}

impl StreamNode {
    pub(crate) fn root() -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            parent: None,
        })
    }

    pub(crate) fn nested(parent: Arc<StreamNode>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::new()),
            parent: Some(parent),
        })
    }

    pub(crate) fn push(&self, segment: Segment) {
        self.queue.lock().push_back(segment);
    }

    pub(crate) fn pop(&self) -> Option<Segment> {
        self.queue.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Drain every queued segment, returning what was dropped.
    pub(crate) fn clear(&self) -> Vec<Segment> {
        self.queue.lock().drain(..).collect()
    }

    pub(crate) fn parent(&self) -> Option<&Arc<StreamNode>> {
        self.parent.as_ref()
    }
}

/// A reservation token for a nested position in an execution's stream.
///
/// Obtained by the consumer passed to
/// [`Execution::subscribe`](super::execution::Execution::subscribe).  The
/// handle may be cloned and carried to any thread; segments enqueued through
/// it run at the reserved position, before any segment that was queued after
/// the reservation in the parent scope.
///
/// A handle is one-shot with respect to completion: after
/// [`complete`](Self::complete) or [`complete_with`](Self::complete_with)
/// has been called once, further deliveries are ignored.  This is the
/// cooperative cancellation point — a raced or cancelled producer's late
/// delivery lands on a resumed handle and is dropped.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<HandleShared>,
}

struct HandleShared {
    execution: Arc<Execution>,
    node: Arc<StreamNode>,
    resumed: AtomicBool,
}

impl StreamHandle {
    pub(crate) fn new(execution: Arc<Execution>, node: Arc<StreamNode>) -> Self {
        Self {
            inner: Arc::new(HandleShared {
                execution,
                node,
                resumed: AtomicBool::new(false),
            }),
        }
    }

    /// The execution this handle belongs to.
    pub fn execution(&self) -> &Arc<Execution> {
        &self.inner.execution
    }

    /// Enqueue a user-code segment at the reserved position.
    pub fn event(
        &self,
        segment: impl FnOnce(&Arc<Execution>) -> anyhow::Result<()> + Send + 'static,
    ) {
        if self.inner.resumed.load(Ordering::Acquire) {
            debug!(
                execution = self.inner.execution.id(),
                "Dropping event on resumed stream handle"
            );
            return;
        }
        self.inner.node.push(Segment::User(Box::new(segment)));
        self.inner.execution.drain();
    }

    /// Pop the reserved position without further work.
    pub fn complete(&self) {
        self.finish(None);
    }

    /// Enqueue a final user-code segment that runs in the parent scope after
    /// the reserved position is popped.
    pub fn complete_with(
        &self,
        segment: impl FnOnce(&Arc<Execution>) -> anyhow::Result<()> + Send + 'static,
    ) {
        self.finish(Some(Box::new(segment)));
    }

    fn finish(&self, then: Option<UserSegmentFn>) {
        if self.inner.resumed.swap(true, Ordering::AcqRel) {
            debug!(
                execution = self.inner.execution.id(),
                "Dropping completion on resumed stream handle"
            );
            return;
        }
        self.inner.node.push(Segment::Pop {
            node: Arc::clone(&self.inner.node),
            then,
        });
        self.inner.execution.drain();
    }
}
