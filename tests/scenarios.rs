//! End-to-end scenarios S3-S6 from the testable-properties section. S1/S2
//! (bounded thread-set execution, no head-of-line blocking on the pool) are
//! covered as unit tests alongside `ThreadPoolExecutor` itself; these cover
//! the timer queue and the coroutine/manual-executor properties that need a
//! whole-crate integration view.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use taskrt::executor::inline::InlineExecutor;
use taskrt::executor::manual::ManualExecutor;
use taskrt::{Executor, Promise, RuntimeError, Task, TimerQueue};

/// Installs a process-wide tracing subscriber so the `tracing` events emitted
/// by the timer queue and thread pool show up (with thread ids) when a test
/// is run with `--nocapture`. Safe to call from every test; only the first
/// call wins.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .try_init();
}

/// S3: a one-shot timer with a 500ms due time on an inline executor fires
/// within [480ms, 700ms] of creation.
#[test]
fn s3_one_shot_timer_fires_within_tolerance() {
    init_tracing();
    let queue = TimerQueue::new();
    let executor: Arc<dyn Executor> = Arc::new(InlineExecutor::new());
    let fired_at = Arc::new(Mutex::new(None::<Instant>));
    let f = fired_at.clone();
    let start = Instant::now();
    let _handle = queue.create_one_shot_timer(500, executor, move || {
        *f.lock().unwrap() = Some(Instant::now());
    });

    let deadline = start + Duration::from_millis(2_000);
    loop {
        if fired_at.lock().unwrap().is_some() || Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }

    let fired = fired_at.lock().unwrap().expect("timer never fired");
    let elapsed = fired.duration_since(start);
    assert!(
        elapsed >= Duration::from_millis(480) && elapsed <= Duration::from_millis(700),
        "elapsed = {elapsed:?}"
    );
}

/// S4: a 300ms-frequency periodic timer run for 3s fires [8, 12] times, with
/// successive gaps within [250ms, 400ms].
#[test]
fn s4_periodic_timer_fires_in_expected_range_with_bounded_gaps() {
    init_tracing();
    let queue = TimerQueue::new();
    let executor: Arc<dyn Executor> = Arc::new(InlineExecutor::new());
    let fires = Arc::new(Mutex::new(Vec::<Instant>::new()));
    let f = fires.clone();
    let mut handle = queue.create_timer(300, 300, executor, move || {
        f.lock().unwrap().push(Instant::now());
    });

    std::thread::sleep(Duration::from_millis(3_000));
    handle.cancel().unwrap();

    let fires = fires.lock().unwrap();
    assert!(
        fires.len() >= 8 && fires.len() <= 12,
        "fire count = {}",
        fires.len()
    );
    for pair in fires.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(250) && gap <= Duration::from_millis(400),
            "gap = {gap:?}"
        );
    }
}

/// A `Waker` that records which thread invoked `wake`, for verifying that a
/// coroutine-style awaiter resumes inline on the publishing thread rather
/// than being redispatched.
struct RecordingWaker {
    resumed_on: Mutex<Option<ThreadId>>,
}

impl Wake for RecordingWaker {
    fn wake(self: Arc<Self>) {
        *self.resumed_on.lock().unwrap() = Some(std::thread::current().id());
    }

    fn wake_by_ref(self: &Arc<Self>) {
        *self.resumed_on.lock().unwrap() = Some(std::thread::current().id());
    }
}

/// S5: a coroutine awaiting a result whose value is written by a second
/// thread resumes (its waker is invoked) on that writer's thread, with no
/// `resolve_via` redirection involved.
#[test]
fn s5_coroutine_resumes_on_writer_thread() {
    init_tracing();
    let promise = Promise::<i32>::new();
    let mut result = promise.get_result().unwrap();

    let recorder = Arc::new(RecordingWaker {
        resumed_on: Mutex::new(None),
    });
    let waker = Waker::from(recorder.clone());
    let mut cx = Context::from_waker(&waker);

    // First poll installs the coroutine's waker and observes Pending, since
    // nothing has been written yet.
    let pinned = std::pin::Pin::new(&mut result);
    assert!(matches!(pinned.poll(&mut cx), Poll::Pending));

    let writer_thread = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        promise.set_value(7);
        std::thread::current().id()
    });
    let writer_id = writer_thread.join().unwrap();

    let deadline = Instant::now() + Duration::from_millis(1_000);
    loop {
        if recorder.resumed_on.lock().unwrap().is_some() || Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }

    let resumed_on = recorder.resumed_on.lock().unwrap().expect("never resumed");
    assert_eq!(resumed_on, writer_id);

    let pinned = std::pin::Pin::new(&mut result);
    assert!(matches!(pinned.poll(&mut cx), Poll::Ready(Ok(7))));
}

/// S6: 1024 tasks enqueued on a manual executor, then `shutdown` without
/// draining: each task is cancelled exactly once, and a coroutine-shaped
/// task's awaiter observes broken-task.
#[test]
fn s6_manual_executor_shutdown_cancels_every_queued_task_exactly_once() {
    init_tracing();
    let executor = ManualExecutor::new();
    let cancelled = Arc::new(AtomicUsize::new(0));
    let invoked = Arc::new(AtomicUsize::new(0));

    let mut coroutine_results = Vec::new();
    for _ in 0..1024 {
        let promise = Promise::<()>::new();
        let result = promise.get_result().unwrap();
        coroutine_results.push(result);

        let c = cancelled.clone();
        let i = invoked.clone();
        let promise = Mutex::new(Some(promise));
        executor
            .enqueue(Task::with_cancel(
                move || {
                    i.fetch_add(1, Ordering::SeqCst);
                },
                move |_err| {
                    c.fetch_add(1, Ordering::SeqCst);
                    // Dropping the promise without writing publishes
                    // broken-task, the coroutine-awaiter analogue.
                    drop(promise.lock().unwrap().take());
                },
            ))
            .unwrap();
    }

    assert_eq!(executor.size(), 1024);
    executor.shutdown();

    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(cancelled.load(Ordering::SeqCst), 1024);

    for result in coroutine_results {
        let err = result.get().unwrap_err();
        assert!(matches!(err, RuntimeError::BrokenTask));
    }

    let err = executor.enqueue(Task::new(|| {})).unwrap_err();
    assert!(matches!(err, RuntimeError::ExecutorShutdown(_)));
}
