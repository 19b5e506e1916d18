//! One-shot-thread executor (spec §4.6): every `enqueue` spawns a fresh OS
//! thread for that single task. Grounded on `concurrencpp::thread_executor`
//! (`original_source/concurrencpp/src/executors/thread_executor.cpp`), used
//! for long-running blocking work where pool contention is undesirable.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use crate::error::RuntimeError;
use crate::executor::{Executor, UNBOUNDED_CONCURRENCY};
use crate::task::Task;

/// Spawns a fresh, unpooled OS thread per submitted task.
pub struct OneShotThreadExecutor {
    shutdown: AtomicBool,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for OneShotThreadExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneShotThreadExecutor")
            .field("shutdown", &self.shutdown_requested())
            .finish()
    }
}

impl Default for OneShotThreadExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl OneShotThreadExecutor {
    pub fn new() -> Self {
        OneShotThreadExecutor {
            shutdown: AtomicBool::new(false),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Joins any threads that have already finished, without blocking on
    /// ones still running. Keeps the retired list from growing without
    /// bound under steady submission.
    fn reap_finished(&self) {
        let mut retired = self.retired.lock().unwrap_or_else(|e| e.into_inner());
        let mut still_running = Vec::with_capacity(retired.len());
        for handle in retired.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                still_running.push(handle);
            }
        }
        *retired = still_running;
    }
}

impl Executor for OneShotThreadExecutor {
    fn name(&self) -> &str {
        "thread_executor"
    }

    fn enqueue(&self, task: Task) -> Result<(), RuntimeError> {
        if self.shutdown_requested() {
            task.cancel(RuntimeError::executor_shutdown(self.name()));
            return Err(RuntimeError::executor_shutdown(self.name()));
        }
        self.reap_finished();
        let handle = std::thread::Builder::new()
            .name("taskrt-one-shot".into())
            .spawn(move || {
                task.invoke();
            })
            .expect("failed to spawn one-shot-thread executor thread");
        self.retired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        Ok(())
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles: Vec<JoinHandle<()>> = self
            .retired
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.join();
        }
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
    use std::sync::Arc;

    #[test]
    fn each_enqueue_runs_on_its_own_thread() {
        let ex = OneShotThreadExecutor::new();
        let seen_threads = Arc::new(Mutex::new(std::collections::HashSet::new()));
        for _ in 0..4 {
            let seen = seen_threads.clone();
            ex.enqueue(Task::new(move || {
                seen.lock().unwrap().insert(std::thread::current().id());
            }))
            .unwrap();
        }
        ex.shutdown();
        assert_eq!(seen_threads.lock().unwrap().len(), 4);
    }

    #[test]
    fn shutdown_joins_all_spawned_threads() {
        let ex = OneShotThreadExecutor::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let r2 = ran.clone();
            ex.enqueue(Task::new(move || {
                r2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        ex.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 8);
    }
}
