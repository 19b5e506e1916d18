#![cfg_attr(docsrs, feature(doc_cfg))]

//! A general-purpose concurrency runtime: type-erased tasks, one-shot
//! results, a family of executors, and a timer queue.
//!
//! The crate's pieces compose the way `concurrencpp` (the C++ library this
//! design is adapted from) composes its own: a [`task::Task`] is a single
//! unit of deferred work; a [`result::Promise`]/[`result::ResultHandle`]
//! pair hands a value from whichever thread produces it to whichever thread
//! (or coroutine) wants it; an [`executor::Executor`] is anything that can
//! run a `Task`; and [`runtime::Runtime`] bundles a sensible default set of
//! executors plus a [`timer::TimerQueue`] behind one façade.
//!
//! Most applications only need [`runtime::Runtime`]:
//!
//! ```no_run
//! use taskrt::Runtime;
//!
//! let runtime = Runtime::new();
//! let pool = runtime.thread_pool_executor();
//! // pool.enqueue(...)
//! runtime.shutdown();
//! ```

// -----------------------------------------------------------------------------
// Modules

pub mod error;
pub mod executor;
pub mod result;
pub mod runtime;
pub mod task;
pub mod timer;

// -----------------------------------------------------------------------------
// Top-level exports

pub use error::{RuntimeError, UserError};
pub use executor::Executor;
pub use result::{Promise, ResultHandle, ResultStatus};
pub use runtime::{Runtime, RuntimeBuilder};
pub use task::Task;
pub use timer::{TimerHandle, TimerQueue};

/// The crate's error type, matching the taxonomy in [`error::RuntimeError`].
pub type Result<T> = core::result::Result<T, RuntimeError>;

/// Blocks the calling thread on `future`, parking it between polls instead
/// of busy-spinning. A thin re-export of `futures_lite::future::block_on`,
/// offered at the crate root the way the teacher's `vc_task` crate exposes
/// its own `block_on`.
pub fn block_on<F: core::future::Future>(future: F) -> F::Output {
    futures_lite::future::block_on(future)
}
