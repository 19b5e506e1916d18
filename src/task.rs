//! [`Task`]: a move-only, type-erased unit of work with an optional cancel
//! hook and small-buffer inline storage.
//!
//! This is the runtime's lowest-level currency: every executor ultimately
//! stores and runs `Task`s. Grounded on the vtable + inline-storage pattern
//! the teacher crate uses for its `Runnable`/`ListQueue` plumbing
//! (`vc_task::mini_executor`), generalized here to the spec's explicit
//! `{invoke, cancel, move, destroy}` vtable and its coroutine-aware variant.

use std::alloc::{self, Layout};
use std::fmt;
use std::mem::{self, MaybeUninit};
use std::ptr;

use crate::error::RuntimeError;

/// Bytes available for inline (non-allocating) storage of a callable.
///
/// Three machine words is enough to hold a `Box<dyn Future>` plus a
/// discriminant, or a handful of captured fields, without forcing a heap
/// allocation for the common case (a closure capturing one or two values).
const INLINE_CAPACITY: usize = 3 * mem::size_of::<usize>();
const INLINE_ALIGN: usize = mem::align_of::<usize>();

#[repr(C, align(8))]
struct InlineBuf(MaybeUninit<[u8; INLINE_CAPACITY]>);

/// The operations a task's stored callable must support, type-erased behind
/// function pointers (a vtable), as the spec's §4.1 requires.
struct Vtable {
    /// Invokes the callable, then drops it. Does not deallocate the task's
    /// own storage (the caller does that based on `is_inline`).
    invoke: unsafe fn(*mut ()),
    /// Cancels the callable with `error` instead of running it, then drops
    /// it. Never panics.
    cancel: unsafe fn(*mut (), RuntimeError),
    /// Drops the callable in place without running or cancelling it.
    drop_in_place: unsafe fn(*mut ()),
    /// `true` for tasks built from [`Task::from_coroutine`]. Lets a runtime
    /// distinguish "ordinary callable" from "coroutine driver" tasks when
    /// deciding how to unwind abandoned work during shutdown.
    is_coroutine: bool,
}

enum Storage {
    Inline(InlineBuf),
    Heap(*mut u8, Layout),
    Empty,
}

/// A move-only, type-erased unit of work.
///
/// A `Task` is either empty or owns exactly one callable. Small callables
/// (at most [`INLINE_CAPACITY`] bytes, suitably aligned, and safe to move
/// with `memcpy`) are stored inline; larger ones are heap-allocated. Moving
/// a `Task` transfers ownership and leaves the source empty.
pub struct Task {
    storage: Storage,
    vtable: Option<&'static Vtable>,
}

// SAFETY: a `Task` only ever stores `F: Send` callables (enforced by the
// `new`/`from_coroutine` constructors' bounds), so moving the erased bytes
// across threads is exactly as sound as moving the `F` itself would be.
unsafe impl Send for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("is_empty", &self.is_empty())
            .field(
                "is_coroutine",
                &self.vtable.map(|v| v.is_coroutine).unwrap_or(false),
            )
            .finish()
    }
}

trait Cancellable {
    fn cancel(&mut self, error: RuntimeError);
}

/// A plain callable has no cancel hook of its own: cancelling it just drops
/// it without running it.
struct Plain<F>(F);

impl<F: FnOnce()> Cancellable for Plain<F> {
    fn cancel(&mut self, _error: RuntimeError) {
        // Dropping in place (done by the caller after this returns) is the
        // entire cancellation; there is no user-visible cancel hook.
    }
}

/// A callable paired with an explicit cancel hook, for producers (e.g.
/// promises) that want to observe the cancellation error.
struct WithCancel<F, C> {
    invoke: Option<F>,
    cancel: Option<C>,
}

impl<F: FnOnce(), C: FnOnce(RuntimeError)> Cancellable for WithCancel<F, C> {
    fn cancel(&mut self, error: RuntimeError) {
        if let Some(c) = self.cancel.take() {
            c(error);
        }
    }
}

unsafe fn invoke_erased<T>(ptr: *mut ())
where
    T: Invocable,
{
    // SAFETY: `ptr` was produced by `store` for a value of type `T`, and is
    // invoked/dropped at most once per the `Task` invariants.
    unsafe {
        let typed = ptr.cast::<T>();
        let value = ptr::read(typed);
        value.run();
    }
}

unsafe fn cancel_erased<T>(ptr: *mut (), error: RuntimeError)
where
    T: Invocable,
{
    // SAFETY: see `invoke_erased`.
    unsafe {
        let typed = ptr.cast::<T>();
        let mut value = ptr::read(typed);
        value.cancel_in_place(error);
    }
}

unsafe fn drop_erased<T>(ptr: *mut ()) {
    // SAFETY: see `invoke_erased`.
    unsafe {
        ptr::drop_in_place(ptr.cast::<T>());
    }
}

/// Internal trait unifying `Plain<F>` and `WithCancel<F, C>` behind one
/// vtable shape.
trait Invocable: Cancellable + Sized {
    fn run(self);
    fn cancel_in_place(mut self, error: RuntimeError) {
        self.cancel(error);
    }
}

impl<F: FnOnce()> Invocable for Plain<F> {
    fn run(self) {
        (self.0)();
    }
}

impl<F: FnOnce(), C: FnOnce(RuntimeError)> Invocable for WithCancel<F, C> {
    fn run(self) {
        if let Some(f) = self.invoke {
            f();
        }
    }
}

fn vtable_for<T: Invocable + 'static>(is_coroutine: bool) -> &'static Vtable {
    use std::any::TypeId;
    use std::collections::HashMap;
    use std::sync::{Mutex, OnceLock};

    // A small process-wide registry keyed by `(TypeId, is_coroutine)`.
    // Bounded by the number of distinct closure types the program ever
    // constructs a `Task` from, not by the number of tasks created at
    // runtime.
    static REGISTRY: OnceLock<Mutex<HashMap<(TypeId, bool), &'static Vtable>>> = OnceLock::new();
    let registry = REGISTRY.get_or_init(|| Mutex::new(HashMap::new()));

    let key = (TypeId::of::<T>(), is_coroutine);
    let mut guard = registry.lock().unwrap_or_else(|e| e.into_inner());
    *guard.entry(key).or_insert_with(|| {
        Box::leak(Box::new(Vtable {
            invoke: invoke_erased::<T>,
            cancel: cancel_erased::<T>,
            drop_in_place: drop_erased::<T>,
            is_coroutine,
        }))
    })
}

fn fits_inline<T>() -> bool {
    mem::size_of::<T>() <= INLINE_CAPACITY && mem::align_of::<T>() <= INLINE_ALIGN
}

unsafe fn store<T>(value: T) -> Storage {
    if fits_inline::<T>() {
        let mut buf = InlineBuf(MaybeUninit::uninit());
        // SAFETY: `T` fits within `INLINE_CAPACITY` bytes at `INLINE_ALIGN`,
        // checked by `fits_inline` above.
        unsafe {
            let dst = buf.0.as_mut_ptr().cast::<T>();
            ptr::write(dst, value);
        }
        Storage::Inline(buf)
    } else {
        let layout = Layout::new::<T>();
        // SAFETY: layout is non-zero-sized whenever `T` requires heap
        // storage (it failed the inline-capacity check above).
        let raw = unsafe { alloc::alloc(layout) };
        if raw.is_null() {
            alloc::handle_alloc_error(layout);
        }
        // SAFETY: `raw` was just allocated with `layout` matching `T`.
        unsafe { ptr::write(raw.cast::<T>(), value) };
        Storage::Heap(raw, layout)
    }
}

impl Task {
    /// Constructs an empty task.
    pub fn empty() -> Self {
        Task {
            storage: Storage::Empty,
            vtable: None,
        }
    }

    /// Constructs a task from any move-only, `Send` callable.
    ///
    /// If `F` fits the inline buffer and its size/alignment qualify, the
    /// callable is stored inline; otherwise it is heap-allocated.
    pub fn new<F>(callable: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let boxed = Plain(callable);
        // SAFETY: `store` places a valid `Plain<F>` either inline or on the
        // heap; the vtable's erased functions are monomorphized for the
        // same concrete type.
        let storage = unsafe { store(boxed) };
        Task {
            storage,
            vtable: Some(vtable_for::<Plain<F>>(false)),
        }
    }

    /// Constructs a task from a callable paired with an explicit cancel
    /// hook, invoked with the cancellation error instead of the callable
    /// when the task is cancelled rather than run.
    pub fn with_cancel<F, C>(invoke: F, cancel: C) -> Self
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce(RuntimeError) + Send + 'static,
    {
        let boxed = WithCancel {
            invoke: Some(invoke),
            cancel: Some(cancel),
        };
        // SAFETY: see `new`.
        let storage = unsafe { store(boxed) };
        Task {
            storage,
            vtable: Some(vtable_for::<WithCancel<F, C>>(false)),
        }
    }

    /// Constructs a task that drives `resume` to run a previously-suspended
    /// coroutine forward. Tasks built this way are tagged
    /// [`is_coroutine`](Task::is_coroutine) so a shutting-down executor can
    /// distinguish "drop this abandoned coroutine driver" (which must still
    /// unwind the coroutine to publish broken-task) from "drop this plain
    /// callable" (which needs no further action).
    pub fn from_coroutine<F, C>(resume: F, unwind: C) -> Self
    where
        F: FnOnce() + Send + 'static,
        C: FnOnce(RuntimeError) + Send + 'static,
    {
        let boxed = WithCancel {
            invoke: Some(resume),
            cancel: Some(unwind),
        };
        // SAFETY: see `new`.
        let storage = unsafe { store(boxed) };
        Task {
            storage,
            vtable: Some(vtable_for::<WithCancel<F, C>>(true)),
        }
    }

    fn data_ptr(&mut self) -> *mut () {
        match &mut self.storage {
            Storage::Inline(buf) => buf.0.as_mut_ptr().cast::<()>(),
            Storage::Heap(ptr, _) => (*ptr).cast::<()>(),
            Storage::Empty => ptr::null_mut(),
        }
    }

    /// `true` if this task holds no callable.
    pub fn is_empty(&self) -> bool {
        self.vtable.is_none()
    }

    /// `true` if this task was constructed via [`Task::from_coroutine`].
    pub fn is_coroutine(&self) -> bool {
        self.vtable.map(|v| v.is_coroutine).unwrap_or(false)
    }

    /// Invokes the callable, then destroys the task, leaving it empty.
    /// A no-op if the task is already empty.
    pub fn invoke(mut self) {
        let Some(vt) = self.vtable.take() else {
            return;
        };
        let ptr = self.data_ptr();
        let heap_layout = match self.storage {
            Storage::Heap(raw, layout) => Some((raw, layout)),
            _ => None,
        };
        self.storage = Storage::Empty;
        // SAFETY: `ptr` points at a live value of the type `vt.invoke` was
        // monomorphized for; `invoke` consumes it exactly once.
        unsafe { (vt.invoke)(ptr) };
        if let Some((raw, layout)) = heap_layout {
            // SAFETY: `raw`/`layout` are the exact pair `store`'s heap path
            // allocated; the value has already been read out by `invoke`.
            unsafe { alloc::dealloc(raw, layout) };
        }
    }

    /// Cancels the task with `error` instead of running it, then destroys
    /// it, leaving it empty. Never panics. A no-op if already empty.
    pub fn cancel(mut self, error: RuntimeError) {
        let Some(vt) = self.vtable.take() else {
            return;
        };
        let ptr = self.data_ptr();
        let heap_layout = match self.storage {
            Storage::Heap(raw, layout) => Some((raw, layout)),
            _ => None,
        };
        self.storage = Storage::Empty;
        // SAFETY: see `invoke`.
        unsafe { (vt.cancel)(ptr, error) };
        if let Some((raw, layout)) = heap_layout {
            // SAFETY: see `invoke`.
            unsafe { alloc::dealloc(raw, layout) };
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        let Some(vt) = self.vtable.take() else {
            return;
        };
        match &mut self.storage {
            Storage::Inline(buf) => {
                let ptr = buf.0.as_mut_ptr().cast::<()>();
                // SAFETY: the inline buffer holds a live, type-matching
                // value until this drop runs it down.
                unsafe { (vt.drop_in_place)(ptr) };
            }
            Storage::Heap(ptr, layout) => {
                let data_ptr = (*ptr).cast::<()>();
                // SAFETY: see above; `ptr`/`layout` are the exact pair
                // `store`'s heap branch allocated.
                unsafe {
                    (vt.drop_in_place)(data_ptr);
                    alloc::dealloc(*ptr, *layout);
                }
            }
            Storage::Empty => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn empty_task_invoke_is_noop() {
        let t = Task::empty();
        assert!(t.is_empty());
        t.invoke();
    }

    #[test]
    fn inline_small_closure_runs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let t = Task::new(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!t.is_empty());
        t.invoke();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn oversized_closure_heap_allocates_and_runs() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        // Capture enough state to overflow the inline buffer.
        let payload = [0u8; 256];
        let t = Task::new(move || {
            let _ = payload.len();
            ran2.fetch_add(1, Ordering::SeqCst);
        });
        t.invoke();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_invokes_cancel_hook_not_invoke() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let (i2, c2) = (invoked.clone(), cancelled.clone());
        let t = Task::with_cancel(
            move || {
                i2.fetch_add(1, Ordering::SeqCst);
            },
            move |_err| {
                c2.fetch_add(1, Ordering::SeqCst);
            },
        );
        t.cancel(RuntimeError::executor_shutdown("test"));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn plain_task_cancel_is_harmless() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let i2 = invoked.clone();
        let t = Task::new(move || {
            i2.fetch_add(1, Ordering::SeqCst);
        });
        t.cancel(RuntimeError::BrokenTask);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn coroutine_tagged_task_reports_is_coroutine() {
        let t = Task::from_coroutine(|| {}, |_err| {});
        assert!(t.is_coroutine());
        t.invoke();
    }

    #[test]
    fn dropping_without_invoke_or_cancel_runs_neither() {
        let invoked = Arc::new(AtomicUsize::new(0));
        let cancelled = Arc::new(AtomicUsize::new(0));
        let (i2, c2) = (invoked.clone(), cancelled.clone());
        let t = Task::with_cancel(
            move || {
                i2.fetch_add(1, Ordering::SeqCst);
            },
            move |_| {
                c2.fetch_add(1, Ordering::SeqCst);
            },
        );
        drop(t);
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(cancelled.load(Ordering::SeqCst), 0);
    }
}
