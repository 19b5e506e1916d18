//! The executor protocol (spec §6) and its five concrete implementations.
//!
//! Every executor in this crate implements [`Executor`]. The trait is the
//! one extension point external code can hook into (an `Arc<dyn Executor>`
//! is what the result-state's `await_via` path and the timer queue both
//! schedule onto), mirroring how the teacher's `vc_task` crate keeps its
//! named task pools behind a small, uniform surface
//! (`platform/multi/task_pool.rs`).

pub mod inline;
pub mod manual;
pub mod one_shot_thread;
pub mod thread_pool;
pub mod worker_thread;

use std::fmt;

use crate::error::RuntimeError;
use crate::task::Task;

/// `i32::MAX` stands in for "unbounded" concurrency, matching
/// `concurrencpp::executor::max_concurrency_level`'s convention for
/// executors with no fixed worker count (inline, one-shot-thread).
pub const UNBOUNDED_CONCURRENCY: usize = usize::MAX;

/// An object that accepts [`Task`]s for eventual execution.
///
/// Implementations must throw [`RuntimeError::ExecutorShutdown`] from
/// `enqueue`/`enqueue_batch` once `shutdown` has completed, and must never
/// invoke a task queued after that point.
pub trait Executor: Send + Sync + fmt::Debug {
    /// A short, stable name used in diagnostics and in
    /// [`RuntimeError::ExecutorShutdown`]/[`RuntimeError::ExecutorException`].
    fn name(&self) -> &str;

    /// Submits a single task for eventual execution.
    fn enqueue(&self, task: Task) -> Result<(), RuntimeError>;

    /// Submits a batch of tasks. The default implementation enqueues them
    /// one at a time; the thread-pool executor overrides this to split the
    /// batch evenly across workers per spec §4.8.
    fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), RuntimeError> {
        for task in tasks {
            self.enqueue(task)?;
        }
        Ok(())
    }

    /// Requests shutdown: queued tasks are drained and cancelled with
    /// [`RuntimeError::ExecutorShutdown`]; subsequent `enqueue` calls fail.
    /// Idempotent.
    fn shutdown(&self);

    /// `true` once `shutdown` has been requested.
    fn shutdown_requested(&self) -> bool;

    /// The maximum number of tasks this executor can run concurrently, or
    /// [`UNBOUNDED_CONCURRENCY`] if it has no fixed upper bound.
    fn max_concurrency_level(&self) -> usize;
}
