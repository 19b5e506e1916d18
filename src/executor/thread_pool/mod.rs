//! Thread-pool executor (spec §4.8, "the hard part"). N workers, each with
//! a private and a public deque, a pool-wide idle-worker set, work
//! donation, and lazy worker reactivation after an idle timeout. Grounded
//! throughout on
//! `examples/original_source/concurrencpp/src/executors/thread_pool_executor.cpp`.

mod idle_set;
mod worker;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::RuntimeError;
use crate::executor::Executor;
use crate::task::Task;

use idle_set::IdleSet;
use worker::{thread_hash_seed, Inner, Worker, CURRENT};

/// Default idle timeout before a worker thread exits (its record, queues,
/// and status stay alive for later reactivation).
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(15);

/// Builder for [`ThreadPoolExecutor`], in the style of the teacher's
/// `vc_task::TaskPoolBuilder` (`platform/multi/task_pool.rs`).
pub struct ThreadPoolBuilder {
    worker_count: usize,
    max_idle_time: Duration,
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        ThreadPoolBuilder {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
        }
    }
}

impl ThreadPoolBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    pub fn max_idle_time(mut self, d: Duration) -> Self {
        self.max_idle_time = d;
        self
    }

    pub fn build(self, name: impl Into<String>) -> ThreadPoolExecutor {
        ThreadPoolExecutor::with_config(name.into(), self.worker_count, self.max_idle_time)
    }
}

/// N workers with per-worker deques, an idle set, and work stealing via
/// donation.
pub struct ThreadPoolExecutor {
    inner: Arc<Inner>,
}

impl fmt::Debug for ThreadPoolExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPoolExecutor")
            .field("name", &self.inner.name)
            .field("workers", &self.inner.workers.len())
            .field("approx_idle", &self.inner.idle.approx_idle_count())
            .field("shutdown", &self.shutdown_requested())
            .finish()
    }
}

impl ThreadPoolExecutor {
    pub fn new(name: impl Into<String>, worker_count: usize) -> Self {
        Self::with_config(name.into(), worker_count, DEFAULT_MAX_IDLE_TIME)
    }

    fn with_config(name: String, worker_count: usize, max_idle_time: Duration) -> Self {
        let worker_count = worker_count.max(1);
        let workers = (0..worker_count).map(Worker::new).collect::<Vec<_>>();
        let inner = Arc::new(Inner {
            name,
            workers,
            idle: IdleSet::new(worker_count),
            round_robin: AtomicUsize::new(0),
            abort: std::sync::atomic::AtomicBool::new(false),
            max_idle_time,
        });
        // Every worker starts idle, as in `thread_pool_executor`'s
        // constructor, and gets its first thread spawned eagerly.
        for i in 0..worker_count {
            inner.idle.set_idle(i);
        }
        for i in 0..worker_count {
            inner.ensure_worker_active(i);
        }
        ThreadPoolExecutor { inner }
    }

    fn identity(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    fn current_worker_index(&self) -> Option<usize> {
        CURRENT.with(|c| match c.get() {
            Some((addr, idx)) if addr == self.identity() => Some(idx),
            _ => None,
        })
    }

    fn push_foreign(&self, target: usize, task: Task) {
        self.inner.workers[target].push_foreign(task);
        self.inner.ensure_worker_active(target);
    }
}

impl Executor for ThreadPoolExecutor {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn enqueue(&self, task: Task) -> Result<(), RuntimeError> {
        if self.shutdown_requested() {
            task.cancel(RuntimeError::executor_shutdown(self.name()));
            return Err(RuntimeError::executor_shutdown(self.name()));
        }

        // Policy step 1: caller is a pool worker whose local deque appears
        // empty -> push locally, no locking.
        if let Some(idx) = self.current_worker_index() {
            let worker = &self.inner.workers[idx];
            if worker.local_len_hint() == 0 {
                worker.push_local(task);
                return Ok(());
            }
            // Policy step 2: scan the idle set.
            if let Some(target) = self
                .inner
                .idle
                .find_idle_worker(Some(idx), thread_hash_seed())
            {
                self.push_foreign(target, task);
                return Ok(());
            }
            // Policy step 3: caller is a worker with non-empty local -- push
            // locally anyway.
            worker.push_local(task);
            return Ok(());
        }

        // Not a pool worker. Policy step 2: scan the idle set.
        if let Some(target) = self.inner.idle.find_idle_worker(None, thread_hash_seed()) {
            self.push_foreign(target, task);
            return Ok(());
        }

        // Policy step 4: round-robin.
        let target = self.inner.round_robin.fetch_add(1, Ordering::Relaxed) % self.inner.workers.len();
        self.push_foreign(target, task);
        Ok(())
    }

    fn enqueue_batch(&self, tasks: Vec<Task>) -> Result<(), RuntimeError> {
        if self.shutdown_requested() {
            for task in tasks {
                task.cancel(RuntimeError::executor_shutdown(self.name()));
            }
            return Err(RuntimeError::executor_shutdown(self.name()));
        }

        if let Some(idx) = self.current_worker_index() {
            // From inside the pool, push the whole batch locally.
            let worker = &self.inner.workers[idx];
            for task in tasks {
                worker.push_local(task);
            }
            return Ok(());
        }

        let worker_count = self.inner.workers.len();
        if tasks.len() < worker_count {
            // Too small to split meaningfully; enqueue one at a time
            // through the normal single-task policy.
            for task in tasks {
                self.enqueue(task)?;
            }
            return Ok(());
        }

        // Split approximately evenly; the first `len % workers` workers get
        // one extra task.
        let base = tasks.len() / worker_count;
        let extra = tasks.len() % worker_count;
        let mut iter = tasks.into_iter();
        for i in 0..worker_count {
            let count = base + if i < extra { 1 } else { 0 };
            let batch: Vec<Task> = (&mut iter).take(count).collect();
            if !batch.is_empty() {
                self.inner.workers[i].push_foreign_batch(batch);
                self.inner.ensure_worker_active(i);
            }
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.inner.shutdown_all();
    }

    fn shutdown_requested(&self) -> bool {
        self.inner.abort.load(Ordering::Acquire)
    }

    fn max_concurrency_level(&self) -> usize {
        self.inner.workers.len()
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        if !self.shutdown_requested() {
            self.inner.shutdown_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as O};
    use std::sync::Mutex;

    #[test]
    fn runs_many_tasks_across_bounded_thread_set() {
        let pool = ThreadPoolExecutor::new("test-pool", 4);
        let ran = Arc::new(AtomicUsize::new(0));
        let threads_seen = Arc::new(Mutex::new(std::collections::HashSet::new()));
        for _ in 0..2000 {
            let ran = ran.clone();
            let seen = threads_seen.clone();
            pool.enqueue(Task::new(move || {
                ran.fetch_add(1, O::SeqCst);
                seen.lock().unwrap().insert(std::thread::current().id());
            }))
            .unwrap();
        }
        pool.shutdown();
        assert_eq!(ran.load(O::SeqCst), 2000);
        assert!(threads_seen.lock().unwrap().len() <= 4);
    }

    #[test]
    fn shutdown_rejects_further_enqueue() {
        let pool = ThreadPoolExecutor::new("test-pool-2", 2);
        pool.shutdown();
        let err = pool.enqueue(Task::new(|| {})).unwrap_err();
        assert!(matches!(err, RuntimeError::ExecutorShutdown(_)));
    }

    #[test]
    fn a_slow_task_does_not_block_a_fast_one() {
        let pool = ThreadPoolExecutor::new("test-pool-3", 4);
        let fast_done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        pool.enqueue(Task::new(|| {
            std::thread::sleep(Duration::from_millis(300));
        }))
        .unwrap();
        let fd = fast_done.clone();
        pool.enqueue(Task::new(move || {
            fd.store(true, O::SeqCst);
        }))
        .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert!(fast_done.load(O::SeqCst));
        pool.shutdown();
    }
}
