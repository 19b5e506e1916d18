//! The result handle: the exclusive reader side of a one-shot result, and
//! its `Future` adapter for `co_await`-style use. Grounded on
//! `result_core.h`'s `result<T>` plus `result_awaiter`/`await_via_awaiter`.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use crate::error::{EmptyObjectKind, RuntimeError};
use crate::executor::Executor;

use super::state::{ResultState, ResultStatus};

/// The read-once consumer side of a result. Obtained from
/// [`Promise::get_result`](super::Promise::get_result).
pub struct ResultHandle<T> {
    state: Option<Arc<ResultState<T>>>,
}

impl<T> fmt::Debug for ResultHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("is_empty", &self.state.is_none())
            .finish()
    }
}

impl<T> ResultHandle<T> {
    pub(crate) fn new(state: Arc<ResultState<T>>) -> Self {
        ResultHandle { state: Some(state) }
    }

    fn state(&self) -> Result<&Arc<ResultState<T>>, RuntimeError> {
        self.state
            .as_ref()
            .ok_or(RuntimeError::EmptyObject(EmptyObjectKind::Result))
    }

    /// Non-consuming peek at the current status.
    pub fn status(&self) -> Result<ResultStatus, RuntimeError> {
        Ok(self.state()?.status())
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }

    /// Blocks the calling thread until ready, then moves the value out (or
    /// propagates the stored exception). Consumes the handle: a result may
    /// only be retrieved once.
    pub fn get(mut self) -> Result<T, RuntimeError> {
        let state = self
            .state
            .take()
            .ok_or(RuntimeError::EmptyObject(EmptyObjectKind::Result))?;
        state.wait();
        state.take()
    }

    /// Blocks the calling thread without a timeout, leaving the handle
    /// retrievable afterward.
    pub fn wait(&self) -> Result<(), RuntimeError> {
        self.state()?.wait();
        Ok(())
    }

    /// Blocks with a timeout, returning the status observed (`Idle` means
    /// the deadline elapsed first).
    pub fn wait_for(&self, duration: Duration) -> Result<ResultStatus, RuntimeError> {
        Ok(self.state()?.wait_for(duration))
    }

    /// Wraps this handle in an awaitable that resumes the awaiting
    /// coroutine directly on whichever thread publishes the result --
    /// `co_await result` with no executor argument.
    pub fn resolve(self) -> Resolve<T> {
        Resolve { handle: Some(self) }
    }

    /// Wraps this handle in an awaitable that resumes the awaiting coroutine
    /// via `executor` if it must suspend, and inline if the result is
    /// already ready -- `co_await result.resolve_via(executor)`. Like
    /// [`resolve`](Self::resolve), `await_resume` yields the handle itself
    /// rather than the value, so status can be inspected without throwing.
    pub fn resolve_via(self, executor: Arc<dyn Executor>, name: &'static str) -> ResolveVia<T> {
        ResolveVia {
            handle: Some(self),
            executor,
            name,
        }
    }

    /// Wraps this handle in an awaitable that installs the awaiting
    /// coroutine as the consumer and resumes it by unwrapping the value (or
    /// propagating the stored exception) -- `co_await result` via a named
    /// executor. When `force_reschedule` is `true`, the continuation is
    /// always posted onto `executor`, even if the result is already ready
    /// when first polled; when `false`, a ready result resumes inline.
    pub fn await_via(
        self,
        executor: Arc<dyn Executor>,
        name: &'static str,
        force_reschedule: bool,
    ) -> AwaitVia<T> {
        AwaitVia {
            handle: Some(self),
            executor,
            name,
            force_reschedule,
        }
    }
}

impl<T> Future for ResultHandle<T> {
    type Output = Result<T, RuntimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(state) = this.state.as_ref() else {
            return Poll::Ready(Err(RuntimeError::EmptyObject(EmptyObjectKind::Result)));
        };
        if state.poll_install(cx.waker()) {
            let state = this.state.take().unwrap();
            return Poll::Ready(state.take());
        }
        Poll::Pending
    }
}

/// An awaitable yielding the handle itself (rather than the value), so the
/// awaiting coroutine can inspect status without the exception being
/// rethrown -- the Rust analogue of `result_core.h`'s `resolve()` awaiter.
pub struct Resolve<T> {
    handle: Option<ResultHandle<T>>,
}

impl<T> Future for Resolve<T> {
    type Output = ResultHandle<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let handle = this
            .handle
            .as_ref()
            .expect("Resolve polled after completion");
        let ready = match &handle.state {
            Some(state) => state.poll_install(cx.waker()),
            None => true,
        };
        if ready {
            return Poll::Ready(this.handle.take().unwrap());
        }
        Poll::Pending
    }
}

/// As [`Resolve`], but always resumes via a specific executor.
pub struct ResolveVia<T> {
    handle: Option<ResultHandle<T>>,
    executor: Arc<dyn Executor>,
    name: &'static str,
}

impl<T> Future for ResolveVia<T> {
    type Output = ResultHandle<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let handle = this
            .handle
            .as_ref()
            .expect("ResolveVia polled after completion");
        let ready = match &handle.state {
            Some(state) => {
                state.poll_install_via(cx.waker(), this.executor.clone(), this.name, false)
            }
            None => true,
        };
        if ready {
            return Poll::Ready(this.handle.take().unwrap());
        }
        Poll::Pending
    }
}

/// `co_await result.await_via(executor, name, force_reschedule)`: like
/// awaiting the handle directly, but the continuation is routed through
/// `executor`, optionally even when the result is already ready.
pub struct AwaitVia<T> {
    handle: Option<ResultHandle<T>>,
    executor: Arc<dyn Executor>,
    name: &'static str,
    force_reschedule: bool,
}

impl<T> Future for AwaitVia<T> {
    type Output = Result<T, RuntimeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(handle) = this.handle.as_mut() else {
            return Poll::Ready(Err(RuntimeError::EmptyObject(EmptyObjectKind::Result)));
        };
        let Some(state) = handle.state.as_ref() else {
            this.handle.take();
            return Poll::Ready(Err(RuntimeError::EmptyObject(EmptyObjectKind::Result)));
        };
        let ready = state.poll_install_via(
            cx.waker(),
            this.executor.clone(),
            this.name,
            this.force_reschedule,
        );
        if ready {
            let state = handle.state.take().unwrap();
            this.handle.take();
            return Poll::Ready(state.take());
        }
        Poll::Pending
    }
}
