//! The promise: the exclusive writer side of a one-shot result. Grounded on
//! `result_core.h`'s `promise_base`/`promise` (the `co_return` / exception
//! writer half of a `result<T>` pair).

use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::RuntimeError;

use super::result::ResultHandle;
use super::state::ResultState;

/// The write-once producer side of a result. Exactly one of `set_value`,
/// `set_exception`, or `set_from_function` may be called; if the promise is
/// dropped having never been written to, its result resolves to
/// [`RuntimeError::BrokenTask`] (mirrors `promise_base::~promise_base`'s
/// "broken task" behavior when a coroutine is destroyed without returning).
pub struct Promise<T> {
    state: Arc<ResultState<T>>,
    completed: Cell<bool>,
    retrieved: Cell<bool>,
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("completed", &self.completed.get())
            .finish()
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T> {
    pub fn new() -> Self {
        Promise {
            state: ResultState::new(),
            completed: Cell::new(false),
            retrieved: Cell::new(false),
        }
    }

    /// A convenience constructor pairing a fresh promise with its result
    /// handle already retrieved, for call sites that always want both ends
    /// at once (e.g. the timer queue's delay objects).
    pub fn channel() -> (Self, ResultHandle<T>) {
        let promise = Self::new();
        let result = promise
            .get_result()
            .expect("a freshly constructed promise has never been retrieved");
        (promise, result)
    }

    /// Transfers the read end. May be called at most once per promise.
    pub fn get_result(&self) -> Result<ResultHandle<T>, RuntimeError> {
        if self.retrieved.replace(true) {
            return Err(RuntimeError::AlreadyRetrieved);
        }
        self.state.mark_retrieved();
        Ok(ResultHandle::new(self.state.clone()))
    }

    pub fn set_value(self, value: T) {
        self.completed.set(true);
        self.state.set_value(value);
    }

    pub fn set_exception(self, err: RuntimeError) {
        self.completed.set(true);
        self.state.set_exception(err);
    }

    /// Runs `f`, publishing its `Ok` as the value and its `Err` as the
    /// exception. Also catches a panic inside `f`, converting it to a
    /// [`RuntimeError::User`] the way `result_core.h`'s coroutine-promise
    /// path translates an escaping exception into `exception_ptr`.
    pub fn set_from_function<F>(self, f: F)
    where
        F: FnOnce() -> Result<T, RuntimeError> + std::panic::UnwindSafe,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(value)) => self.set_value(value),
            Ok(Err(err)) => self.set_exception(err),
            Err(panic) => {
                let message = panic_message(&panic);
                self.set_exception(RuntimeError::user(crate::error::UserError::new(
                    StringPanic(message),
                )));
            }
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if !self.completed.get() {
            self.completed.set(true);
            self.state.set_exception(RuntimeError::BrokenTask);
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in promise callback".to_string()
    }
}

#[derive(Debug)]
struct StringPanic(String);

impl fmt::Display for StringPanic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for StringPanic {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_value_is_observed_by_result_handle() {
        let promise = Promise::<i32>::new();
        let result = promise.get_result().unwrap();
        promise.set_value(42);
        assert_eq!(result.get().unwrap(), 42);
    }

    #[test]
    fn get_result_twice_errors() {
        let promise = Promise::<i32>::new();
        let _first = promise.get_result().unwrap();
        let second = promise.get_result();
        assert!(matches!(second, Err(RuntimeError::AlreadyRetrieved)));
    }

    #[test]
    fn dropping_unwritten_promise_yields_broken_task() {
        let promise = Promise::<i32>::new();
        let result = promise.get_result().unwrap();
        drop(promise);
        let err = result.get().unwrap_err();
        assert!(err.is_broken_task());
    }

    #[test]
    fn set_from_function_catches_panics() {
        let promise = Promise::<i32>::new();
        let result = promise.get_result().unwrap();
        promise.set_from_function(|| panic!("boom"));
        assert!(matches!(result.get(), Err(RuntimeError::User(_))));
    }
}
