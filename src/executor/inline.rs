//! Inline executor (spec §4.4): runs each task synchronously on the
//! submitting thread. Grounded on `concurrencpp`'s `inline_executor`
//! (`original_source/concurrencpp/src/executors/inline_executor.h`) and
//! styled after the teacher's plain, doc-light utility types.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::RuntimeError;
use crate::executor::{Executor, UNBOUNDED_CONCURRENCY};
use crate::task::Task;

/// Runs every enqueued task immediately, on the calling thread.
///
/// Useful as a no-op scheduler in tests, and for forcing a continuation to
/// run synchronously rather than being re-dispatched.
pub struct InlineExecutor {
    shutdown: AtomicBool,
}

impl fmt::Debug for InlineExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineExecutor")
            .field("shutdown", &self.shutdown_requested())
            .finish()
    }
}

impl Default for InlineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineExecutor {
    pub fn new() -> Self {
        InlineExecutor {
            shutdown: AtomicBool::new(false),
        }
    }
}

impl Executor for InlineExecutor {
    fn name(&self) -> &str {
        "inline_executor"
    }

    fn enqueue(&self, task: Task) -> Result<(), RuntimeError> {
        if self.shutdown_requested() {
            task.cancel(RuntimeError::executor_shutdown(self.name()));
            return Err(RuntimeError::executor_shutdown(self.name()));
        }
        task.invoke();
        Ok(())
    }

    fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn max_concurrency_level(&self) -> usize {
        UNBOUNDED_CONCURRENCY
    }
}
