//! Manual executor (spec §4.5): a FIFO of tasks drained by an external
//! caller rather than by a worker thread of its own. Grounded on
//! `concurrencpp::manual_executor`
//! (`original_source/concurrencpp/src/executors/manual_executor.cpp`),
//! shaped with the Mutex+Condvar idiom the teacher's `vc_os::sync` module
//! wraps for its own blocking-queue primitives.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::RuntimeError;
use crate::executor::{Executor, UNBOUNDED_CONCURRENCY};
use crate::task::Task;

/// A FIFO of tasks drained one-at-a-time (or in batches) by whoever calls
/// [`ManualExecutor::loop_once`] / [`ManualExecutor::run_loop`].
pub struct ManualExecutor {
    queue: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    shutdown: AtomicBool,
}

impl fmt::Debug for ManualExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualExecutor")
            .field("size", &self.size())
            .field("shutdown", &self.shutdown_requested())
            .finish()
    }
}

impl Default for ManualExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualExecutor {
    pub fn new() -> Self {
        ManualExecutor {
            queue: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Current queue depth.
    pub fn size(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Dequeues and runs one task, if any is available, without blocking.
    /// Returns `true` if a task ran.
    pub fn loop_once(&self) -> Result<bool, RuntimeError> {
        self.check_shutdown()?;
        let task = {
            let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.pop_front()
        };
        match task {
            Some(t) => {
                t.invoke();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dequeues and runs one task, blocking up to `timeout` for one to
    /// become available.
    pub fn loop_once_timeout(&self, timeout: Duration) -> Result<bool, RuntimeError> {
        self.wait_for_task(Some(timeout))?;
        self.loop_once()
    }

    /// Runs up to `max` tasks, stopping early if the queue empties.
    pub fn run_loop(&self, max: usize) -> Result<usize, RuntimeError> {
        let mut ran = 0;
        while ran < max {
            if !self.loop_once()? {
                break;
            }
            ran += 1;
        }
        Ok(ran)
    }

    /// Blocks until at least one task is queued (or `timeout` elapses, or
    /// the executor is shut down).
    pub fn wait_for_task(&self, timeout: Option<Duration>) -> Result<(), RuntimeError> {
        self.check_shutdown()?;
        let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = timeout.map(|d| Instant::now() + d);
        while q.is_empty() && !self.shutdown.load(Ordering::Acquire) {
            match deadline {
                None => {
                    q = self.condvar.wait(q).unwrap_or_else(|e| e.into_inner());
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _timeout) = self
                        .condvar
                        .wait_timeout(q, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    q = guard;
                }
            }
        }
        drop(q);
        self.check_shutdown()
    }

    /// Drops every queued task, cancelling each with
    /// [`RuntimeError::BrokenTask`].
    pub fn clear(&self) {
        let drained: Vec<Task> = {
            let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.drain(..).collect()
        };
        for task in drained {
            task.cancel(RuntimeError::BrokenTask);
        }
    }

    fn check_shutdown(&self) -> Result<(), RuntimeError> {
        if self.shutdown.load(Ordering::Acquire) {
            Err(RuntimeError::executor_shutdown(self.name()))
        } else {
            Ok(())
        }
    }
}

impl Executor for ManualExecutor {
    fn name(&self) -> &str {
        "manual_executor"
    }

    fn enqueue(&self, task: Task) -> Result<(), RuntimeError> {
        if let Err(e) = self.check_shutdown() {
            task.cancel(RuntimeError::executor_shutdown(self.name()));
            return Err(e);
        }
        {
            let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.push_back(task);
        }
        self.condvar.notify_one();
        Ok(())
    }

    fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), RuntimeError> {
        if let Err(e) = self.check_shutdown() {
            for task in tasks {
                task.cancel(RuntimeError::executor_shutdown(self.name()));
            }
            return Err(e);
        }
        {
            let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.extend(tasks);
        }
        self.condvar.notify_all();
        Ok(())
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Task> = {
            let mut q = self.queue.lock().unwrap_or_else(|e| e.into_inner());
            q.drain(..).collect()
        };
        for task in drained {
            task.cancel(RuntimeError::executor_shutdown(self.name()));
        }
        self.condvar.notify_all();
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn max_concurrency_level(&self) -> usize {
        UNBOUNDED_CONCURRENCY
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    #[test]
    fn loop_once_runs_single_queued_task() {
        let ex = ManualExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r2 = ran.clone();
        ex.enqueue(Task::new(move || {
            r2.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert!(ex.loop_once().unwrap());
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!ex.loop_once().unwrap());
    }

    #[test]
    fn run_loop_drains_up_to_max() {
        let ex = ManualExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let r2 = ran.clone();
            ex.enqueue(Task::new(move || {
                r2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        let ran_count = ex.run_loop(3).unwrap();
        assert_eq!(ran_count, 3);
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert_eq!(ex.size(), 2);
    }

    #[test]
    fn shutdown_cancels_queued_tasks_and_rejects_enqueue() {
        let ex = ManualExecutor::new();
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let c2 = cancelled.clone();
        let s2 = seen.clone();
        ex.enqueue(Task::with_cancel(
            || {},
            move |err| {
                c2.fetch_add(1, Ordering::SeqCst);
                *s2.lock().unwrap() = Some(err);
            },
        ))
        .unwrap();
        ex.shutdown();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert!(matches!(
            seen.lock().unwrap().take().unwrap(),
            RuntimeError::ExecutorShutdown(_)
        ));
        let err = ex.enqueue(Task::new(|| {})).unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutorShutdown(_)));
    }

    #[test]
    fn clear_cancels_queued_tasks_with_broken_task() {
        let ex = ManualExecutor::new();
        let seen = Arc::new(Mutex::new(None));
        let s2 = seen.clone();
        ex.enqueue(Task::with_cancel(
            || {},
            move |err| {
                *s2.lock().unwrap() = Some(err);
            },
        ))
        .unwrap();
        ex.clear();
        assert!(matches!(
            seen.lock().unwrap().take().unwrap(),
            RuntimeError::BrokenTask
        ));
        assert_eq!(ex.size(), 0);
    }
}
