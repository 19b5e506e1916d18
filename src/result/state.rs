//! The result state: a one-shot SPSC synchronization cell with four
//! consumer modes. Grounded on
//! `examples/original_source/concurrencpp/src/results/result_core.h`'s
//! `result_core`/`result_core_base`, adapted from its C++ `std::variant` +
//! `std::atomic<pc_state>` pair into safe-at-the-boundary Rust built on
//! `UnsafeCell`, the way `JonasKruckenberg-k23/libs/async-exec/src/sync/wait_cell.rs`
//! builds a CAS-driven waker cell on top of raw cells rather than a mutex.
//!
//! There is deliberately no real `Mutex` guarding the producer/consumer
//! slots: the atomic `phase` CAS *is* the lock, exactly as in the original.
//! Only the side that wins a given transition may touch the slot it just
//! claimed, and release/acquire ordering on the CAS makes that write visible
//! to whichever side observes it next.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::task::Waker;
use std::time::{Duration, Instant};

use crate::error::{EmptyObjectKind, RuntimeError};
use crate::executor::Executor;

/// The three-state phase driving the producer/consumer hand-off.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle = 0,
    Producer = 1,
    Consumer = 2,
}

impl Phase {
    fn from_u8(v: u8) -> Phase {
        match v {
            0 => Phase::Idle,
            1 => Phase::Producer,
            2 => Phase::Consumer,
            _ => unreachable!("invalid phase byte"),
        }
    }
}

/// What the producer slot currently holds.
enum Producer<T> {
    Empty,
    Value(T),
    Exception(RuntimeError),
}

/// What kind of consumer is installed, mirroring `result_core_base::consumer_context`.
enum Consumer {
    None,
    /// A coroutine waiting inline: resumed on whichever thread publishes.
    Coroutine(Waker),
    /// A coroutine that must be resumed via a specific executor.
    CoroutineVia(Waker, Arc<dyn Executor>, &'static str),
    /// A thread blocked in `wait`/`wait_for`.
    Blocking(Arc<WaitContext>),
}

/// The blocking side's rendezvous point, grounded on
/// `result_core.h`'s `details::wait_context` (mutex + condvar + ready flag).
pub(crate) struct WaitContext {
    lock: Mutex<bool>,
    condvar: Condvar,
}

impl WaitContext {
    fn new() -> Arc<Self> {
        Arc::new(WaitContext {
            lock: Mutex::new(false),
            condvar: Condvar::new(),
        })
    }

    fn wait(&self) {
        let mut ready = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*ready {
            ready = self.condvar.wait(ready).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Returns `true` if notified before the deadline.
    fn wait_for(&self, duration: Duration) -> bool {
        let mut ready = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let deadline = Instant::now() + duration;
        while !*ready {
            let now = Instant::now();
            if now >= deadline {
                return *ready;
            }
            let (guard, timeout) = self
                .condvar
                .wait_timeout(ready, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            ready = guard;
            if timeout.timed_out() && !*ready {
                return false;
            }
        }
        true
    }

    fn notify(&self) {
        let mut ready = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        *ready = true;
        self.condvar.notify_one();
    }
}

/// Status of a result state as observed by a non-consuming peek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    Idle,
    Value,
    Exception,
}

/// The shared one-shot cell. Lives behind an `Arc`, owned jointly by a
/// [`Promise`](crate::result::Promise) and a
/// [`ResultHandle`](crate::result::ResultHandle).
pub(crate) struct ResultState<T> {
    phase: AtomicU8,
    producer: UnsafeCell<Producer<T>>,
    consumer: UnsafeCell<Consumer>,
    retrieved: AtomicU8,
}

// SAFETY: access to `producer`/`consumer` is disciplined entirely by the
// `phase` CAS protocol documented on each method below: only the side that
// wins a given transition touches the corresponding cell, and the
// AcqRel/Acquire/Release orderings on `phase` make that write visible
// before the other side observes it.
unsafe impl<T: Send> Send for ResultState<T> {}
unsafe impl<T: Send> Sync for ResultState<T> {}

impl<T> fmt::Debug for ResultState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultState")
            .field("phase", &Phase::from_u8(self.phase.load(Ordering::Relaxed)))
            .finish()
    }
}

impl<T> ResultState<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ResultState {
            phase: AtomicU8::new(Phase::Idle as u8),
            producer: UnsafeCell::new(Producer::Empty),
            consumer: UnsafeCell::new(Consumer::None),
            retrieved: AtomicU8::new(0),
        })
    }

    /// `true` if `get_result` has already transferred the read end once.
    pub(crate) fn mark_retrieved(&self) -> bool {
        self.retrieved.swap(1, Ordering::AcqRel) == 0
    }

    fn publish(&self) {
        let before = self.phase.swap(Phase::Producer as u8, Ordering::AcqRel);
        let before = Phase::from_u8(before);
        if before == Phase::Idle {
            return;
        }
        debug_assert_eq!(before, Phase::Consumer);

        // SAFETY: we just observed `Consumer` as the prior phase via an
        // AcqRel swap, which happens-after the consumer's own CAS that
        // installed this cell; we are the sole producer and are the only
        // side permitted to read it once in this state.
        let consumer = unsafe { std::mem::replace(&mut *self.consumer.get(), Consumer::None) };
        match consumer {
            Consumer::None => {}
            Consumer::Coroutine(waker) => waker.wake(),
            Consumer::CoroutineVia(waker, executor, name) => {
                let fallback = waker.clone();
                let result = executor.enqueue(crate::task::Task::new(move || waker.wake()));
                if let Err(_err) = result {
                    // The ready-path discipline: wrap the publish in an
                    // executor-exception and resume inline so `co_await`
                    // observes the wrapped failure (result_core.h's
                    // `schedule_continuation` catch-all).
                    tracing::warn!(executor = name, "executor failed scheduling continuation");
                    // SAFETY: we still exclusively own the producer slot;
                    // no consumer can be racing us here because the phase
                    // already reads Producer and nothing can transition
                    // out of it.
                    unsafe {
                        *self.producer.get() = Producer::Exception(RuntimeError::executor_exception(
                            name, None,
                        ));
                    }
                    fallback.wake();
                }
            }
            Consumer::Blocking(ctx) => ctx.notify(),
        }
    }

    pub(crate) fn set_value(&self, value: T) {
        // SAFETY: the producer slot may only be written while phase is
        // still `Idle`; callers uphold the "written at most once" promise
        // documented on `Promise`.
        unsafe { *self.producer.get() = Producer::Value(value) };
        self.publish();
    }

    pub(crate) fn set_exception(&self, err: RuntimeError) {
        // SAFETY: see `set_value`.
        unsafe { *self.producer.get() = Producer::Exception(err) };
        self.publish();
    }

    pub(crate) fn status(&self) -> ResultStatus {
        let phase = Phase::from_u8(self.phase.load(Ordering::Acquire));
        match phase {
            Phase::Idle => ResultStatus::Idle,
            Phase::Consumer => ResultStatus::Idle,
            Phase::Producer => {
                // SAFETY: phase Producer happens-after the release write in
                // `set_value`/`set_exception`, observed here with Acquire.
                match unsafe { &*self.producer.get() } {
                    Producer::Value(_) => ResultStatus::Value,
                    Producer::Exception(_) => ResultStatus::Exception,
                    Producer::Empty => unreachable!("producer phase without a written value"),
                }
            }
        }
    }

    /// Blocks the calling thread until the value is ready.
    pub(crate) fn wait(&self) {
        if Phase::from_u8(self.phase.load(Ordering::Acquire)) == Phase::Producer {
            return;
        }
        let ctx = WaitContext::new();
        // SAFETY: we are about to attempt the idle->consumer CAS; until
        // that CAS succeeds no producer can observe this cell, and at most
        // one consumer ever calls wait/wait_for/await on a given state.
        unsafe { *self.consumer.get() = Consumer::Blocking(ctx.clone()) };

        let prev = self
            .phase
            .compare_exchange(
                Phase::Idle as u8,
                Phase::Consumer as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|actual| actual);
        if Phase::from_u8(prev) != Phase::Idle {
            // Producer already published; our installed consumer was never
            // observed. Nothing to wait on.
            return;
        }
        ctx.wait();
    }

    /// Blocks with a timeout; returns the resulting status. On timeout the
    /// consumer slot is uninstalled by CASing `consumer -> idle`.
    pub(crate) fn wait_for(&self, duration: Duration) -> ResultStatus {
        if Phase::from_u8(self.phase.load(Ordering::Acquire)) == Phase::Producer {
            return self.status();
        }
        let ctx = WaitContext::new();
        // SAFETY: see `wait`.
        unsafe { *self.consumer.get() = Consumer::Blocking(ctx.clone()) };

        let prev = self
            .phase
            .compare_exchange(
                Phase::Idle as u8,
                Phase::Consumer as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|actual| actual);
        if Phase::from_u8(prev) != Phase::Idle {
            return self.status();
        }

        if ctx.wait_for(duration) {
            return self.status();
        }

        // Timed out: try to rewind consumer -> idle.
        let rewound = self
            .phase
            .compare_exchange(
                Phase::Consumer as u8,
                Phase::Idle as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if !rewound {
            // Producer raced us and already published.
            return self.status();
        }
        // SAFETY: we just re-won Idle, so no producer is touching the
        // consumer slot concurrently; clear it so a later wait can reuse it.
        unsafe { *self.consumer.get() = Consumer::None };
        ResultStatus::Idle
    }

    /// Installs `waker` as the consumer if not already ready.
    ///
    /// Returns `true` if the state was already ready (caller should not
    /// suspend), `false` if the waker was installed and the caller should
    /// suspend.
    pub(crate) fn poll_install(&self, waker: &Waker) -> bool {
        if Phase::from_u8(self.phase.load(Ordering::Acquire)) == Phase::Producer {
            return true;
        }
        // SAFETY: see `wait`; single consumer discipline applies.
        unsafe { *self.consumer.get() = Consumer::Coroutine(waker.clone()) };
        let prev = self
            .phase
            .compare_exchange(
                Phase::Idle as u8,
                Phase::Consumer as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|actual| actual);
        Phase::from_u8(prev) != Phase::Idle
    }

    /// Installs `waker`, to be resumed via `executor` rather than inline.
    ///
    /// When `force_reschedule` is `false`, a result that is already ready
    /// resumes the caller inline (returns `true`, no dispatch) exactly like
    /// `poll_install`. When `true`, a result that is already ready still
    /// gets posted onto `executor` before the caller is told to suspend --
    /// `co_await`'s `await_via(executor, force)` per-call override.
    pub(crate) fn poll_install_via(
        &self,
        waker: &Waker,
        executor: Arc<dyn Executor>,
        name: &'static str,
        force_reschedule: bool,
    ) -> bool {
        if Phase::from_u8(self.phase.load(Ordering::Acquire)) == Phase::Producer {
            if !force_reschedule {
                return true;
            }
            let to_wake = waker.clone();
            let fallback = to_wake.clone();
            if let Err(_err) = executor.enqueue(crate::task::Task::new(move || to_wake.wake())) {
                tracing::warn!(
                    executor = name,
                    "executor failed scheduling forced continuation"
                );
                fallback.wake();
            }
            return false;
        }
        // SAFETY: see `wait`.
        unsafe {
            *self.consumer.get() = Consumer::CoroutineVia(waker.clone(), executor, name);
        }
        let prev = self
            .phase
            .compare_exchange(
                Phase::Idle as u8,
                Phase::Consumer as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_or_else(|actual| actual);
        Phase::from_u8(prev) != Phase::Idle
    }

    /// Moves the value or exception out. Precondition: phase is `Producer`.
    /// Exactly one call is permitted per state.
    pub(crate) fn take(&self) -> Result<T, RuntimeError> {
        debug_assert_eq!(
            Phase::from_u8(self.phase.load(Ordering::Acquire)),
            Phase::Producer
        );
        // SAFETY: phase Producer happens-after the publishing write; we are
        // the sole consumer and this is called at most once (enforced by
        // `ResultHandle`/`Promise` consuming `self` on use).
        let slot = unsafe { std::mem::replace(&mut *self.producer.get(), Producer::Empty) };
        match slot {
            Producer::Value(v) => Ok(v),
            Producer::Exception(e) => Err(e),
            Producer::Empty => Err(RuntimeError::EmptyObject(EmptyObjectKind::Result)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn producer_first_then_consumer_wait_returns_immediately() {
        let state = ResultState::<i32>::new();
        state.set_value(42);
        state.wait();
        assert_eq!(state.status(), ResultStatus::Value);
        assert_eq!(state.take().unwrap(), 42);
    }

    #[test]
    fn consumer_first_then_producer_wakes_it() {
        let state = ResultState::<i32>::new();
        assert_eq!(state.wait_for(Duration::from_millis(20)), ResultStatus::Idle);
        state.set_value(9);
        assert_eq!(state.status(), ResultStatus::Value);
    }

    /// Races a real producer thread against a real consumer thread a large
    /// number of times: whichever side wins the idle->{producer,consumer}
    /// CAS first, the other side must still observe the published value
    /// exactly once with no lost wakeup and no double-take.
    #[test]
    fn concurrent_publish_and_wait_race_is_race_free() {
        for _ in 0..2_000 {
            let state = Arc::new(ResultState::<u64>::new());
            let producer = state.clone();
            let writer = std::thread::spawn(move || producer.set_value(7));
            state.wait();
            assert_eq!(state.status(), ResultStatus::Value);
            writer.join().unwrap();
            assert_eq!(state.take().unwrap(), 7);
        }
    }

    #[test]
    fn wait_for_times_out_before_value_is_set_then_observes_it_once_it_is() {
        let state = ResultState::<i32>::new();
        assert_eq!(state.wait_for(Duration::from_millis(10)), ResultStatus::Idle);
        state.set_value(5);
        assert_eq!(state.wait_for(Duration::from_millis(10)), ResultStatus::Value);
    }
}
