//! Per-worker state and work loop for the thread-pool executor. Grounded
//! closely on `concurrencpp::details::thread_pool_worker`
//! (`original_source/concurrencpp/src/executors/thread_pool_executor.cpp`):
//! `balance_work` (donation), `drain_queue`/`drain_queue_impl`,
//! `wait_for_task`, `ensure_worker_active`.

use std::cell::{Cell, UnsafeCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::RuntimeError;
use crate::task::Task;

use super::idle_set::IdleSet;

#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum Status {
    Working = 0,
    Waiting = 1,
    Idle = 2,
}

/// Shared pool state every worker closure and every `enqueue` call sees.
pub(super) struct Inner {
    pub(super) name: String,
    pub(super) workers: Vec<Worker>,
    pub(super) idle: IdleSet,
    pub(super) round_robin: std::sync::atomic::AtomicUsize,
    pub(super) abort: AtomicBool,
    pub(super) max_idle_time: Duration,
}

pub(super) struct Worker {
    pub(super) id: usize,
    /// Only ever touched by the thread currently running this worker's
    /// loop -- including re-entrant `enqueue` calls made by a task running
    /// on that same thread. See `ThreadPoolExecutor::enqueue` policy step 1.
    local: UnsafeCell<VecDeque<Task>>,
    public: Mutex<VecDeque<Task>>,
    condvar: Condvar,
    status: AtomicU8,
    running: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

// SAFETY: `local` is read/written exclusively by the single OS thread that
// is, at any given time, running this worker's loop (or a task dispatched
// from it); no other thread ever accesses it. `public`/`condvar`/`status`
// use their own synchronization.
unsafe impl Sync for Worker {}

impl Worker {
    pub(super) fn new(id: usize) -> Self {
        Worker {
            id,
            local: UnsafeCell::new(VecDeque::new()),
            public: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            status: AtomicU8::new(Status::Idle as u8),
            running: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    /// # Safety
    /// Caller must be the worker's own loop thread, or a task currently
    /// running on it.
    unsafe fn local_mut(&self) -> &mut VecDeque<Task> {
        // SAFETY: forwarded from caller.
        unsafe { &mut *self.local.get() }
    }

    pub(super) fn local_len_hint(&self) -> usize {
        // SAFETY: a length read racing the owning thread's own push/pop is
        // the "appears empty" approximation the spec explicitly allows for
        // enqueue policy step 1; it is never read from another thread.
        unsafe { (*self.local.get()).len() }
    }

    pub(super) fn status(&self) -> Status {
        match self.status.load(Ordering::Acquire) {
            0 => Status::Working,
            1 => Status::Waiting,
            _ => Status::Idle,
        }
    }

    fn set_status(&self, s: Status) {
        self.status.store(s as u8, Ordering::Release);
    }

    /// Pushes directly onto this worker's own local deque. Must only be
    /// called from the worker's own thread (enforced by the caller).
    pub(super) fn push_local(&self, task: Task) {
        // SAFETY: see `local_mut`.
        unsafe { self.local_mut().push_back(task) };
    }

    /// Pushes onto the public deque under the lock and wakes the worker.
    pub(super) fn push_foreign(&self, task: Task) {
        {
            let mut q = self.public.lock().unwrap_or_else(|e| e.into_inner());
            q.push_back(task);
        }
        self.condvar.notify_one();
    }

    pub(super) fn push_foreign_batch(&self, tasks: impl IntoIterator<Item = Task>) {
        {
            let mut q = self.public.lock().unwrap_or_else(|e| e.into_inner());
            q.extend(tasks);
        }
        self.condvar.notify_all();
    }

    fn drain_for_shutdown(&self, name: &str) {
        let foreign: Vec<Task> = {
            let mut q = self.public.lock().unwrap_or_else(|e| e.into_inner());
            q.drain(..).collect()
        };
        for t in foreign {
            t.cancel(RuntimeError::executor_shutdown(name));
        }
        // SAFETY: the worker thread has already been joined by the time
        // `shutdown` calls this, so no thread can be touching `local`.
        let local: Vec<Task> = unsafe { self.local_mut().drain(..).collect() };
        for t in local {
            t.cancel(RuntimeError::executor_shutdown(name));
        }
    }
}

/// A simple thread-local xorshift, grounded on the teacher's
/// `platform/multi/xor_shift.rs`, used only to pick a hashed scan start
/// position for idle-worker discovery -- never for correctness.
pub(super) fn thread_hash_seed() -> usize {
    use std::cell::Cell;
    thread_local! {
        static STATE: Cell<u64> = Cell::new({
            let tid = format!("{:?}", std::thread::current().id());
            let mut h: u64 = 0xcbf29ce484222325;
            for b in tid.as_bytes() {
                h ^= *b as u64;
                h = h.wrapping_mul(0x100000001b3);
            }
            h | 1
        });
    }
    STATE.with(|s| {
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x as usize
    })
}

thread_local! {
    /// `(pool identity, worker index)` for the pool the current thread is a
    /// worker of, if any. The identity is the `Inner` allocation's address,
    /// stable for the process lifetime of that pool. Read by
    /// `ThreadPoolExecutor::enqueue` to decide local vs. foreign routing.
    pub(super) static CURRENT: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

impl Inner {
    /// Redistributes a donating worker's backlog to idle peers, per spec
    /// §4.8's donation invariants: only donate when ≥ 2 tasks remain, keep
    /// at least one, donate a contiguous range per acquired idle worker.
    fn balance_work(&self, donor_idx: usize) {
        let donor = &self.workers[donor_idx];
        // SAFETY: called only from the donor's own loop.
        let available = unsafe { donor.local_mut().len() };
        if available < 2 {
            return;
        }
        let max_idle_targets = (self.workers.len() - 1).min(available - 1);
        if max_idle_targets == 0 {
            return;
        }
        let targets = self
            .idle
            .find_idle_workers(Some(donor_idx), max_idle_targets, thread_hash_seed());
        if targets.is_empty() {
            return;
        }

        // SAFETY: still the donor's own thread.
        let local = unsafe { donor.local_mut() };
        let donatable = local.len() - 1; // always keep at least one
        let per_target = (donatable / targets.len()).max(1);

        for &target_idx in &targets {
            let take = per_target.min(local.len().saturating_sub(1));
            if take == 0 {
                // Nothing left to give without violating "keep at least
                // one"; re-mark this target idle since it received nothing.
                self.idle.set_idle(target_idx);
                continue;
            }
            let donated: Vec<Task> = local.drain(..take).collect();
            self.workers[target_idx].push_foreign_batch(donated);
        }
    }

    /// The worker's main loop. Runs on the dedicated OS thread for worker
    /// `idx` until told to stop (by returning) on idle timeout, or
    /// permanently on pool shutdown.
    pub(super) fn worker_loop(self: &Arc<Self>, idx: usize) {
        let identity = Arc::as_ptr(self) as usize;
        CURRENT.with(|c| c.set(Some((identity, idx))));

        let worker = &self.workers[idx];
        loop {
            if self.abort.load(Ordering::Acquire) {
                return;
            }

            self.balance_work(idx);

            // SAFETY: this is the worker's own thread.
            let next = unsafe { worker.local_mut().pop_back() };
            if let Some(task) = next {
                worker.set_status(Status::Working);
                task.invoke();
                continue;
            }

            // Local empty: swap in the public deque.
            {
                let mut public = worker.public.lock().unwrap_or_else(|e| e.into_inner());
                if !public.is_empty() {
                    // SAFETY: this is the worker's own thread.
                    let local = unsafe { worker.local_mut() };
                    local.extend(public.drain(..));
                    drop(public);
                    worker.set_status(Status::Working);
                    continue;
                }
            }

            // Both empty: go idle and wait on the condvar (a stand-in for
            // the original's binary semaphore) until the idle timeout.
            worker.set_status(Status::Idle);
            self.idle.set_idle(idx);

            let timed_out = {
                let mut public = worker.public.lock().unwrap_or_else(|e| e.into_inner());
                let deadline = Instant::now() + self.max_idle_time;
                let mut timed_out = false;
                loop {
                    if self.abort.load(Ordering::Acquire) {
                        return;
                    }
                    if !public.is_empty() {
                        break;
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        timed_out = true;
                        break;
                    }
                    let (guard, result) = worker
                        .condvar
                        .wait_timeout(public, deadline - now)
                        .unwrap_or_else(|e| e.into_inner());
                    public = guard;
                    if result.timed_out() && public.is_empty() {
                        timed_out = true;
                        break;
                    }
                }
                timed_out
            };

            self.idle.set_active(idx);
            worker.set_status(Status::Working);

            if timed_out && self.abort.load(Ordering::Acquire) {
                return;
            }
            if timed_out {
                // Idle timeout: exit this OS thread but keep the worker's
                // record (queues, status) alive so a future foreign enqueue
                // can reactivate it.
                worker.running.store(false, Ordering::Release);
                return;
            }
        }
    }

    /// Ensures worker `idx` has a live OS thread, spawning one if its
    /// previous thread exited on idle timeout. Joins the stale handle after
    /// releasing the lock that guards thread (re)spawning, mirroring
    /// `ensure_worker_active`'s unlock-then-join discipline.
    pub(super) fn ensure_worker_active(self: &Arc<Self>, idx: usize) {
        let worker = &self.workers[idx];
        if worker.running.swap(true, Ordering::AcqRel) {
            // Already has a live thread; if it's waiting, the condvar
            // notify in `push_foreign` already woke it.
            return;
        }
        let stale = {
            let mut slot = worker.thread.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(stale) = stale {
            let _ = stale.join();
        }

        let pool = self.clone();
        let handle = std::thread::Builder::new()
            .name(format!("{}-worker-{}", pool.name, idx))
            .spawn(move || pool.worker_loop(idx))
            .expect("failed to spawn thread-pool worker thread");
        *worker.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    pub(super) fn shutdown_all(self: &Arc<Self>) {
        if self.abort.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in &self.workers {
            worker.condvar.notify_all();
        }
        for worker in &self.workers {
            let handle = worker.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
            if let Some(handle) = handle {
                let _ = handle.join();
            }
            worker.running.store(false, Ordering::Release);
        }
        for worker in &self.workers {
            worker.drain_for_shutdown(&self.name);
        }
    }
}
