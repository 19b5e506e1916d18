//! The pool-wide idle-worker set: an array of cache-line-padded atomic
//! flags plus a relaxed approximate counter. Grounded directly on
//! `concurrencpp::details::idle_worker_set`
//! (`original_source/concurrencpp/src/executors/thread_pool_executor.cpp`),
//! using `crossbeam_utils::CachePadded` for the padding the teacher's
//! `global_executor.rs` also reaches for on its own `Seat`/`State` arrays.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

/// A hashed starting-position ring over a pool-wide set of idle flags.
///
/// `set_idle`/`set_active` are plain stores (the owning worker is the only
/// writer of its own flag in the steady state; donors/foreign enqueuers
/// only ever flip a flag from idle to active via a single CAS, never the
/// reverse). The approximate counter is deliberately relaxed: it may over-
/// or under-count transiently, which is fine since every real decision
/// (`find_idle_worker`) is re-validated with a CAS on the flag itself.
pub(crate) struct IdleSet {
    flags: Box<[CachePadded<AtomicBool>]>,
    approx_count: AtomicUsize,
}

impl IdleSet {
    pub(crate) fn new(worker_count: usize) -> Self {
        let flags = (0..worker_count)
            .map(|_| CachePadded::new(AtomicBool::new(false)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        IdleSet {
            flags,
            approx_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.flags.len()
    }

    pub(crate) fn approx_idle_count(&self) -> usize {
        self.approx_count.load(Ordering::Relaxed)
    }

    /// Marks worker `i` idle and bumps the approximate counter. Called only
    /// by worker `i` itself.
    pub(crate) fn set_idle(&self, i: usize) {
        let was_idle = self.flags[i].swap(true, Ordering::Release);
        if !was_idle {
            self.approx_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Marks worker `i` active. Called by worker `i` itself on waking, or
    /// by whichever caller just won the CAS in `find_idle_worker`.
    pub(crate) fn set_active(&self, i: usize) {
        let was_idle = self.flags[i].swap(false, Ordering::Release);
        if was_idle {
            self.approx_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn try_acquire(&self, i: usize) -> bool {
        self.flags[i]
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| {
                self.approx_count.fetch_sub(1, Ordering::Relaxed);
            })
            .is_ok()
    }

    /// Scans the ring starting from a hashed position, attempting a single
    /// CAS on each flag; never returns `caller`'s own slot. Returns the
    /// index of the acquired (now-active) worker, if any.
    pub(crate) fn find_idle_worker(&self, caller: Option<usize>, hash_seed: usize) -> Option<usize> {
        let n = self.flags.len();
        if n == 0 {
            return None;
        }
        let start = hash_seed % n;
        for offset in 0..n {
            let i = (start + offset) % n;
            if Some(i) == caller {
                continue;
            }
            if self.try_acquire(i) {
                return Some(i);
            }
        }
        None
    }

    /// Bulk-acquires up to `max` idle slots (excluding `caller`) for work
    /// donation.
    pub(crate) fn find_idle_workers(
        &self,
        caller: Option<usize>,
        max: usize,
        hash_seed: usize,
    ) -> Vec<usize> {
        let n = self.flags.len();
        if n == 0 || max == 0 {
            return Vec::new();
        }
        let start = hash_seed % n;
        let mut acquired = Vec::with_capacity(max);
        for offset in 0..n {
            if acquired.len() >= max {
                break;
            }
            let i = (start + offset) % n;
            if Some(i) == caller {
                continue;
            }
            if self.try_acquire(i) {
                acquired.push(i);
            }
        }
        acquired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_idle_worker_skips_caller_and_acquires_others() {
        let set = IdleSet::new(4);
        for i in 0..4 {
            set.set_idle(i);
        }
        assert_eq!(set.approx_idle_count(), 4);
        let found = set.find_idle_worker(Some(0), 0).unwrap();
        assert_ne!(found, 0);
        assert_eq!(set.approx_idle_count(), 3);
    }

    #[test]
    fn find_idle_workers_bulk_acquires_up_to_max() {
        let set = IdleSet::new(5);
        for i in 0..5 {
            set.set_idle(i);
        }
        let acquired = set.find_idle_workers(Some(0), 2, 1);
        assert_eq!(acquired.len(), 2);
        assert!(!acquired.contains(&0));
        assert_eq!(set.approx_idle_count(), 2);
    }

    #[test]
    fn no_idle_workers_returns_none() {
        let set = IdleSet::new(3);
        assert!(set.find_idle_worker(None, 0).is_none());
    }

    /// Many threads racing `find_idle_worker` over the same set must never
    /// acquire the same slot twice: the CAS in `try_acquire` is the only
    /// thing standing between this and a double-dispatch.
    #[test]
    fn concurrent_scans_never_double_acquire_a_slot() {
        use std::sync::Arc;
        use std::sync::Mutex;

        let set = Arc::new(IdleSet::new(16));
        for i in 0..16 {
            set.set_idle(i);
        }
        let acquired = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..16)
            .map(|t| {
                let set = set.clone();
                let acquired = acquired.clone();
                std::thread::spawn(move || {
                    if let Some(i) = set.find_idle_worker(None, t) {
                        acquired.lock().unwrap().push(i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let mut acquired = acquired.lock().unwrap();
        acquired.sort_unstable();
        let before_dedup = acquired.len();
        acquired.dedup();
        assert_eq!(acquired.len(), before_dedup, "a slot was acquired twice");
        assert_eq!(before_dedup, 16);
        assert_eq!(set.approx_idle_count(), 0);
    }
}
