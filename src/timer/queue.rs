//! The timer queue's worker loop: a background thread owning a
//! deadline-ordered collection of timer records, fed by a locked request
//! queue. Grounded on `concurrencpp::details::timer_queue_internal` and
//! `timer_queue::work_loop`
//! (`original_source/concurrencpp/src/timers/timer_queue.cpp`), with the
//! C++ `std::multiset` + `iterator_map` pair reexpressed as a
//! `BTreeMap<(Instant, u64), _>` plus a `HashMap<u64, Instant>` reverse
//! index -- the idiomatic Rust equivalent of "ordered collection + index
//! for out-of-order removal."

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::executor::Executor;

use super::record::TimerRecord;

enum Request {
    Register(Arc<TimerRecord>, Instant),
    Deregister(u64),
}

pub(crate) struct TimerQueueInner {
    requests: Mutex<VecDeque<Request>>,
    condvar: Condvar,
    abort: AtomicBool,
    next_id: AtomicU64,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerQueueInner {
    pub(crate) fn new() -> Arc<Self> {
        let inner = Arc::new(TimerQueueInner {
            requests: Mutex::new(VecDeque::new()),
            condvar: Condvar::new(),
            abort: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            thread: Mutex::new(None),
        });
        inner.ensure_worker_thread();
        inner
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Lazily spawns the worker thread; a no-op once it has already been
    /// spawned (mirrors `ensure_worker_thread`'s "spawn exactly once").
    fn ensure_worker_thread(self: &Arc<Self>) {
        let mut slot = self.thread.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let inner = self.clone();
        *slot = Some(
            std::thread::Builder::new()
                .name("taskrt-timer-queue".into())
                .spawn(move || inner.work_loop())
                .expect("failed to spawn timer-queue worker thread"),
        );
    }

    pub(crate) fn request_register(&self, record: Arc<TimerRecord>, first_deadline: Instant) {
        {
            let mut q = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            q.push_back(Request::Register(record, first_deadline));
        }
        self.condvar.notify_one();
    }

    pub(crate) fn request_deregister(&self, id: u64) {
        {
            let mut q = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            q.push_back(Request::Deregister(id));
        }
        self.condvar.notify_one();
    }

    pub(crate) fn shutdown(&self) {
        if self.abort.swap(true, Ordering::AcqRel) {
            return;
        }
        self.condvar.notify_all();
        let handle = self.thread.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn drain_requests(&self) -> Vec<Request> {
        let mut q = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        q.drain(..).collect()
    }

    fn work_loop(self: Arc<Self>) {
        // Only this thread ever touches `ordered`/`reverse`; cross-thread
        // submissions arrive strictly through the request queue, per the
        // invariant in spec §4.9.
        let mut ordered: BTreeMap<(Instant, u64), Arc<TimerRecord>> = BTreeMap::new();
        let mut reverse: HashMap<u64, Instant> = HashMap::new();

        loop {
            if self.abort.load(Ordering::Acquire) {
                return;
            }

            for request in self.drain_requests() {
                match request {
                    Request::Register(record, deadline) => {
                        reverse.insert(record.id, deadline);
                        ordered.insert((deadline, record.id), record);
                    }
                    Request::Deregister(id) => {
                        if let Some(deadline) = reverse.remove(&id) {
                            ordered.remove(&(deadline, id));
                        }
                    }
                }
            }

            let now = Instant::now();
            loop {
                let Some((&(deadline, id), _)) = ordered.iter().next() else {
                    break;
                };
                if deadline > now {
                    break;
                }
                let (_, record) = ordered.remove(&(deadline, id)).map(|r| ((), r)).unwrap();
                reverse.remove(&id);

                if !record.is_cancelled() {
                    let fire = record.make_fire_task();
                    if let Err(err) = record.executor.enqueue(fire) {
                        tracing::warn!(
                            timer_id = id,
                            error = %err,
                            "timer executor rejected fire task"
                        );
                    }
                    if !record.is_one_shot() {
                        let next = record.next_deadline_after(deadline);
                        reverse.insert(id, next);
                        ordered.insert((next, id), record);
                    }
                }
            }

            let next_deadline = ordered.keys().next().map(|(d, _)| *d);

            let mut q = self.requests.lock().unwrap_or_else(|e| e.into_inner());
            loop {
                if self.abort.load(Ordering::Acquire) {
                    return;
                }
                if !q.is_empty() {
                    break;
                }
                match next_deadline {
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
        }
    }
}

impl Drop for TimerQueueInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Milliseconds-from-now helper shared by the public `create_*` methods.
pub(crate) fn deadline_from_now(due_ms: u64) -> Instant {
    Instant::now() + Duration::from_millis(due_ms)
}
