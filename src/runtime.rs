//! The runtime façade: a bundle of ready-made executors plus a timer queue,
//! the single entry point most callers construct. Grounded on
//! `concurrencpp::runtime`/`runtime_options`
//! (`original_source/concurrencpp/src/runtime/runtime.h`).

use std::sync::Arc;
use std::time::Duration;

use crate::executor::inline::InlineExecutor;
use crate::executor::manual::ManualExecutor;
use crate::executor::one_shot_thread::OneShotThreadExecutor;
use crate::executor::thread_pool::{ThreadPoolBuilder, ThreadPoolExecutor};
use crate::executor::worker_thread::WorkerThreadExecutor;
use crate::executor::Executor;
use crate::timer::TimerQueue;

const DEFAULT_BACKGROUND_WORKERS: usize = 4;

/// Mirrors `concurrencpp::runtime_options`: the handful of knobs callers
/// might reasonably want to tune before the runtime's executors start
/// spawning threads.
pub struct RuntimeBuilder {
    max_cpu_threads: usize,
    max_background_threads: usize,
    thread_pool_idle_time: Duration,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        RuntimeBuilder {
            max_cpu_threads: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            max_background_threads: DEFAULT_BACKGROUND_WORKERS,
            thread_pool_idle_time: crate::executor::thread_pool::DEFAULT_MAX_IDLE_TIME,
        }
    }
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_cpu_threads(mut self, n: usize) -> Self {
        self.max_cpu_threads = n.max(1);
        self
    }

    pub fn max_background_threads(mut self, n: usize) -> Self {
        self.max_background_threads = n.max(1);
        self
    }

    pub fn thread_pool_idle_time(mut self, d: Duration) -> Self {
        self.thread_pool_idle_time = d;
        self
    }

    pub fn build(self) -> Runtime {
        Runtime::from_builder(self)
    }
}

/// The single entry point most callers use: owns a cpu-bound thread pool, a
/// background thread pool (for blocking work), an inline executor, a
/// one-shot-thread executor, and a timer queue.
///
/// Shutdown order matters: the timer queue is stopped first so it cannot
/// post a fire task onto an executor that is itself mid-shutdown, then each
/// executor is shut down in turn.
pub struct Runtime {
    thread_pool: Arc<ThreadPoolExecutor>,
    background: Arc<ThreadPoolExecutor>,
    inline: Arc<InlineExecutor>,
    one_shot: Arc<OneShotThreadExecutor>,
    timers: Arc<TimerQueue>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    pub fn new() -> Self {
        RuntimeBuilder::default().build()
    }

    fn from_builder(options: RuntimeBuilder) -> Self {
        let thread_pool = Arc::new(
            ThreadPoolBuilder::new()
                .worker_count(options.max_cpu_threads)
                .max_idle_time(options.thread_pool_idle_time)
                .build("thread_pool_executor"),
        );
        let background = Arc::new(
            ThreadPoolBuilder::new()
                .worker_count(options.max_background_threads)
                .max_idle_time(options.thread_pool_idle_time)
                .build("background_executor"),
        );
        let inline = Arc::new(InlineExecutor::new());
        let one_shot = Arc::new(OneShotThreadExecutor::new());
        let timers = Arc::new(TimerQueue::new());
        Runtime {
            thread_pool,
            background,
            inline,
            one_shot,
            timers,
        }
    }

    /// The cpu-bound worker pool: a [`ThreadPoolExecutor`] sized to
    /// `available_parallelism` by default.
    pub fn thread_pool_executor(&self) -> Arc<ThreadPoolExecutor> {
        self.thread_pool.clone()
    }

    /// A second, separately-sized [`ThreadPoolExecutor`] intended for
    /// blocking or long-running work that shouldn't starve `thread_pool`.
    pub fn background_executor(&self) -> Arc<ThreadPoolExecutor> {
        self.background.clone()
    }

    /// Runs tasks synchronously on the calling thread.
    pub fn thread_executor(&self) -> Arc<InlineExecutor> {
        self.inline.clone()
    }

    /// Spawns a fresh OS thread per task.
    pub fn make_one_shot_executor(&self) -> Arc<OneShotThreadExecutor> {
        self.one_shot.clone()
    }

    /// A caller-owned single-worker executor, independent of the runtime's
    /// shutdown (the runtime does not track or shut this one down).
    pub fn make_worker_thread_executor(&self) -> WorkerThreadExecutor {
        WorkerThreadExecutor::new()
    }

    /// A caller-owned, manually-pumped executor; see
    /// [`ManualExecutor`](crate::executor::manual::ManualExecutor).
    pub fn make_manual_executor(&self) -> ManualExecutor {
        ManualExecutor::new()
    }

    pub fn timer_queue(&self) -> Arc<TimerQueue> {
        self.timers.clone()
    }

    /// Shuts down the timer queue and every runtime-owned executor, in an
    /// order that guarantees no in-flight timer fire posts onto an executor
    /// already mid-shutdown.
    pub fn shutdown(&self) {
        self.timers.shutdown();
        self.thread_pool.shutdown();
        self.background.shutdown();
        self.inline.shutdown();
        self.one_shot.shutdown();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runtime_executors_run_tasks() {
        let runtime = Runtime::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        runtime
            .thread_pool_executor()
            .enqueue(Task::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        runtime.shutdown();
    }

    #[test]
    fn runtime_builder_controls_thread_counts() {
        let runtime = RuntimeBuilder::new()
            .max_cpu_threads(2)
            .max_background_threads(1)
            .build();
        assert_eq!(runtime.thread_pool_executor().max_concurrency_level(), 2);
        assert_eq!(runtime.background_executor().max_concurrency_level(), 1);
        runtime.shutdown();
    }
}
