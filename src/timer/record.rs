//! The timer record and its public handle. Grounded on
//! `concurrencpp::timer`/`timer_queue::timer_state`
//! (`original_source/concurrencpp/src/timers/timer.cpp` and
//! `timer_queue.cpp`).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::error::{EmptyObjectKind, RuntimeError};
use crate::executor::Executor;
use crate::task::Task;

use super::queue::TimerQueueInner;

/// Sentinel frequency meaning "fire exactly once, then self-remove."
pub const ONE_SHOT: u64 = u64::MAX;

/// The shared state of a timer: owned jointly by its public
/// [`TimerHandle`] and the [`TimerQueue`](super::TimerQueue) it lives in.
pub(crate) struct TimerRecord {
    pub(crate) id: u64,
    pub(crate) due_ms: u64,
    /// Milliseconds between fires, or [`ONE_SHOT`].
    frequency_ms: AtomicU64,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) callback: std::sync::Mutex<Option<Box<dyn FnMut() + Send>>>,
    pub(crate) cancelled: AtomicBool,
    /// Weak back-reference so the handle can request deregistration
    /// without reaching into the queue's internals.
    pub(crate) queue: Weak<TimerQueueInner>,
}

impl TimerRecord {
    pub(crate) fn new(
        id: u64,
        due_ms: u64,
        frequency_ms: u64,
        executor: Arc<dyn Executor>,
        callback: impl FnMut() + Send + 'static,
        queue: Weak<TimerQueueInner>,
    ) -> Self {
        TimerRecord {
            id,
            due_ms,
            frequency_ms: AtomicU64::new(frequency_ms),
            executor,
            callback: std::sync::Mutex::new(Some(Box::new(callback))),
            cancelled: AtomicBool::new(false),
            queue,
        }
    }

    pub(crate) fn is_one_shot(&self) -> bool {
        self.frequency_ms.load(Ordering::Relaxed) == ONE_SHOT
    }

    pub(crate) fn frequency(&self) -> u64 {
        self.frequency_ms.load(Ordering::Relaxed)
    }

    /// Atomically updates the frequency. Takes effect starting with the
    /// fire *after* the one already scheduled.
    pub(crate) fn set_frequency(&self, new_ms: u64) {
        self.frequency_ms.store(new_ms, Ordering::Relaxed);
    }

    pub(crate) fn next_deadline_after(&self, from: Instant) -> Instant {
        from + Duration::from_millis(self.frequency())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Turns one fire into a [`Task`] posted onto the record's executor.
    /// Never invoked inline on the timer-queue worker thread.
    pub(crate) fn make_fire_task(self: &Arc<Self>) -> Task {
        let record = self.clone();
        Task::new(move || {
            let mut cb = record.callback.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(cb) = cb.as_mut() {
                cb();
            }
        })
    }
}

/// A handle referring to a timer record in some [`TimerQueue`](super::TimerQueue).
///
/// Dropping the last handle cancels the timer (spec §3, §4.9).
pub struct TimerHandle {
    pub(crate) record: Option<Arc<TimerRecord>>,
}

impl TimerHandle {
    pub(crate) fn new(record: Arc<TimerRecord>) -> Self {
        TimerHandle {
            record: Some(record),
        }
    }

    fn record(&self) -> Result<&Arc<TimerRecord>, RuntimeError> {
        self.record
            .as_ref()
            .ok_or(RuntimeError::EmptyObject(EmptyObjectKind::Timer))
    }

    /// Cancels the timer. A no-op if the handle is already empty, or if the
    /// timer already fired (one-shot) or was already cancelled.
    pub fn cancel(&mut self) -> Result<(), RuntimeError> {
        let Some(record) = self.record.take() else {
            return Ok(());
        };
        if record.cancelled.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(queue) = record.queue.upgrade() {
            queue.request_deregister(record.id);
        }
        Ok(())
    }

    /// Atomically updates the timer's frequency. Effective starting with
    /// the fire after the one already scheduled.
    pub fn set_frequency(&self, new_ms: u64) -> Result<(), RuntimeError> {
        let record = self.record()?;
        record.set_frequency(new_ms);
        Ok(())
    }

    pub fn is_one_shot(&self) -> Result<bool, RuntimeError> {
        Ok(self.record()?.is_one_shot())
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        let _ = self.cancel();
    }
}

impl std::fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerHandle")
            .field("is_empty", &self.record.is_none())
            .finish()
    }
}
