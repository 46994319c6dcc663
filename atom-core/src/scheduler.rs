//! Teardown Scheduler
//!
//! When the last subscriber leaves a cell, its mount cleanup is not run on
//! the spot. Instead a task is deferred to the next turn of the event loop,
//! and that task re-checks the subscriber count before tearing down. A
//! synchronous unsubscribe-then-resubscribe therefore never touches the
//! underlying resource.
//!
//! The scheduler decides what "next turn" means:
//!
//! - [`TokioScheduler`]: a task spawned on the current tokio runtime.
//! - [`ManualScheduler`]: a queue drained explicitly with `run_pending`.
//! - [`ImmediateScheduler`]: no deferral at all.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send>;

/// Something that can run a task on a later turn.
pub trait Scheduler: Send + Sync {
    /// Schedule `task` to run after the current synchronous call stack.
    fn defer(&self, task: Task);
}

/// Defers tasks onto the ambient tokio runtime.
///
/// Outside of a runtime there is no later turn to defer to, so the task
/// runs inline.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn defer(&self, task: Task) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { task() });
            }
            Err(_) => {
                trace!("no tokio runtime, running deferred task inline");
                task();
            }
        }
    }
}

/// Runs tasks immediately, inside `defer`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn defer(&self, task: Task) {
        task();
    }
}

/// Queues tasks until the owner drains them.
///
/// Useful for tests and for hosts that drive their own loop.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<Task>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every queued task, including tasks queued while draining.
    ///
    /// Returns how many tasks ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            // The lock is released before running so tasks may defer more work.
            let next = self.queue.lock().pop_front();
            match next {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

impl Scheduler for ManualScheduler {
    fn defer(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

impl std::fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

/// The scheduler cells use when none is configured.
pub fn default_scheduler() -> Arc<dyn Scheduler> {
    Arc::new(TokioScheduler)
}
