//! The runtime's error taxonomy.
//!
//! Every failure mode named by the component design is a variant of
//! [`RuntimeError`]. The taxonomy is intentionally small: most operations in
//! this crate either succeed or fail with one of a handful of well-known
//! kinds, never an open-ended error hierarchy.

use std::fmt;

/// The runtime's single error type.
///
/// See the [module-level documentation](self) for the taxonomy this type
/// implements.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// An operation was invoked on a moved-from / already-consumed handle
    /// (a [`Result`](crate::result::ResultHandle), [`Promise`](crate::result::Promise),
    /// timer, or coroutine awaitable).
    #[error("operation invoked on an empty {0}")]
    EmptyObject(EmptyObjectKind),

    /// The producer side (a promise, or a coroutine driving one) was dropped
    /// before it wrote a value or exception, or the consumer was cancelled
    /// by an executor shutdown while a task was still queued.
    #[error("broken task: the producer was dropped before a result was produced")]
    BrokenTask,

    /// `Promise::get_result` (or its moral equivalent) was called more than
    /// once on the same promise.
    #[error("result already retrieved from this promise")]
    AlreadyRetrieved,

    /// Any operation on an executor after `shutdown` has completed.
    #[error("executor `{0}` has been shut down")]
    ExecutorShutdown(String),

    /// An executor threw while the result state tried to schedule a ready
    /// continuation onto it. Carries the failing executor's name and,
    /// where available, the error it threw.
    #[error("executor `{executor}` failed while scheduling a continuation")]
    ExecutorException {
        executor: String,
        #[source]
        source: Option<Box<RuntimeError>>,
    },

    /// Reserved for IO-engine collaborators; out of scope for this crate,
    /// kept as a named variant so the taxonomy in the spec is complete.
    #[error("io operation cancelled")]
    IoCancelled,

    /// Reserved for IO-engine collaborators; out of scope for this crate.
    #[error("runtime shut down")]
    RuntimeShutdown,

    /// A caller-supplied payload, the Rust analogue of a type-erased
    /// `std::exception_ptr` passed to `set_exception` /
    /// `set_from_function`.
    #[error(transparent)]
    User(#[from] UserError),
}

impl RuntimeError {
    /// Builds the synthetic exception published when a promise is dropped
    /// without a write.
    pub fn broken_task() -> Self {
        RuntimeError::BrokenTask
    }

    pub fn executor_shutdown(name: impl Into<String>) -> Self {
        RuntimeError::ExecutorShutdown(name.into())
    }

    pub fn executor_exception(executor: impl Into<String>, source: Option<RuntimeError>) -> Self {
        RuntimeError::ExecutorException {
            executor: executor.into(),
            source: source.map(Box::new),
        }
    }

    /// Wraps an arbitrary user error/panic payload so it can travel through
    /// a result state's producer slot.
    pub fn user(err: impl Into<UserError>) -> Self {
        RuntimeError::User(err.into())
    }

    /// `true` if this is the kind of error that should trigger cancellation
    /// bookkeeping rather than simple propagation.
    pub fn is_broken_task(&self) -> bool {
        matches!(self, RuntimeError::BrokenTask)
    }
}

/// Which kind of handle was found empty. Named rather than a bare string so
/// call sites can match on it if they need to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyObjectKind {
    Result,
    Promise,
    Timer,
    Awaitable,
}

impl fmt::Display for EmptyObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EmptyObjectKind::Result => "result",
            EmptyObjectKind::Promise => "promise",
            EmptyObjectKind::Timer => "timer",
            EmptyObjectKind::Awaitable => "awaitable",
        };
        f.write_str(s)
    }
}

/// A type-erased user error payload, the stand-in for `std::exception_ptr`.
///
/// Boxed trait objects already give us `Send + Sync + 'static` propagation
/// across threads without the unsafety a real type-erased exception pointer
/// would need in C++.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct UserError(#[from] pub Box<dyn std::error::Error + Send + Sync + 'static>);

impl UserError {
    pub fn new(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        UserError(Box::new(err))
    }

    pub fn from_string(message: impl Into<String>) -> Self {
        UserError(Box::new(StringError(message.into())))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct StringError(String);

pub type Result<T> = std::result::Result<T, RuntimeError>;
