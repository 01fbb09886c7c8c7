// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

mod task;

pub use self::task::{first_of, timeout, TaskId};

use crate::{engine::EngineHandle, fail::Fail};

use derive_more::Display;

use std::{
    cell::RefCell,
    fmt,
    future,
    mem,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Futures
///
/// A [FutureHandle] is a single-assignment result container: it starts
/// running and transitions exactly once to done (result set) or cancelled
/// (exception set). Terminal states are absorbing, so later transitions are
/// no-ops unless forced. Done and partial callbacks are dispatched through
/// the owning loop's ready queue, never from inside the `set_*` call that
/// triggered them.
///
/// The container doubles as a native future: awaiting a handle suspends the
/// task until the container reaches a terminal state.

/// Status of a [FutureHandle].
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum FutureStatus {
    #[display(fmt = "running")]
    Running,
    #[display(fmt = "done")]
    Done,
    #[display(fmt = "cancelled")]
    Cancelled,
}

/// Callback fired when a future reaches a terminal state.
pub type DoneCallback<T> = Box<dyn FnMut(&FutureHandle<T>)>;

/// Callback fired for each intermediate (streamed) value.
pub type PartialCallback<T> = Box<dyn FnMut(&FutureHandle<T>, &T)>;

/// Predicate aggregated into the `ready`/`closed` state of a future.
pub type Probe = Box<dyn FnMut() -> bool>;

/// Future Data
struct Inner<T> {
    status: FutureStatus,
    result: Option<T>,
    exception: Option<Fail>,
    done_callbacks: Vec<DoneCallback<T>>,
    partial_callbacks: Vec<PartialCallback<T>>,
    ready_probes: Vec<Probe>,
    closed_probes: Vec<Probe>,
    engine: Option<EngineHandle>,
    wakers: Vec<Waker>,
}

/// Future
pub struct FutureHandle<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [FutureHandle].
impl<T: 'static> FutureHandle<T> {
    /// Creates a running future, optionally bound to a loop. An unbound
    /// future dispatches its callbacks inline.
    pub fn new(engine: Option<EngineHandle>) -> Self {
        let inner = Inner {
            status: FutureStatus::Running,
            result: None,
            exception: None,
            done_callbacks: Vec::new(),
            partial_callbacks: Vec::new(),
            ready_probes: Vec::new(),
            closed_probes: Vec::new(),
            engine,
            wakers: Vec::new(),
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    /// Returns the status of the target future.
    pub fn status(&self) -> FutureStatus {
        self.inner.borrow().status
    }

    /// Returns whether the target future is still running.
    pub fn running(&self) -> bool {
        self.status() == FutureStatus::Running
    }

    /// Returns whether the target future completed with a result.
    pub fn done(&self) -> bool {
        self.status() == FutureStatus::Done
    }

    /// Returns whether the target future was cancelled or failed.
    pub fn cancelled(&self) -> bool {
        self.status() == FutureStatus::Cancelled
    }

    /// Returns the exception of the target future, if any.
    pub fn exception(&self) -> Option<Fail> {
        self.inner.borrow().exception.clone()
    }

    /// Returns the loop the target future is bound to, if any.
    pub(crate) fn engine(&self) -> Option<EngineHandle> {
        self.inner.borrow().engine.clone()
    }

    /// Takes the result out of the target future.
    pub fn take_result(&self) -> Option<T> {
        self.inner.borrow_mut().result.take()
    }

    /// Completes the target future with a result. A no-op when the future is
    /// already terminal.
    pub fn set_result(&self, result: T) {
        self.complete(FutureStatus::Done, Some(result), None, false);
    }

    /// Completes the target future with a result, overriding a previous
    /// terminal state.
    pub fn set_result_force(&self, result: T) {
        self.complete(FutureStatus::Done, Some(result), None, true);
    }

    /// Fails the target future with an exception. A no-op when the future is
    /// already terminal.
    pub fn set_exception(&self, exception: Fail) {
        self.complete(FutureStatus::Cancelled, None, Some(exception), false);
    }

    /// Fails the target future with an exception, overriding a previous
    /// terminal state.
    pub fn set_exception_force(&self, exception: Fail) {
        self.complete(FutureStatus::Cancelled, None, Some(exception), true);
    }

    /// Cancels the target future.
    pub fn cancel(&self) {
        self.set_exception(Fail::Cancelled {});
    }

    /// Adds a callback fired once the target future reaches a terminal
    /// state. Callbacks run through the loop's ready queue in add order.
    pub fn add_done_callback(&self, callback: impl FnMut(&FutureHandle<T>) + 'static) {
        self.inner.borrow_mut().done_callbacks.push(Box::new(callback));
    }

    /// Adds a callback fired for every partial value.
    pub fn add_partial_callback(&self, callback: impl FnMut(&FutureHandle<T>, &T) + 'static) {
        self.inner
            .borrow_mut()
            .partial_callbacks
            .push(Box::new(callback));
    }

    /// Adds a probe aggregated into [FutureHandle::ready].
    pub fn add_ready_probe(&self, probe: impl FnMut() -> bool + 'static) {
        self.inner.borrow_mut().ready_probes.push(Box::new(probe));
    }

    /// Adds a probe aggregated into [FutureHandle::closed].
    pub fn add_closed_probe(&self, probe: impl FnMut() -> bool + 'static) {
        self.inner.borrow_mut().closed_probes.push(Box::new(probe));
    }

    /// Streams an intermediate value to the partial callbacks.
    pub fn partial(&self, value: T) {
        let engine = self.inner.borrow().engine.clone();
        let this = self.clone();
        match engine {
            Some(engine) => engine.delay(move || this.run_partial_callbacks(&value)),
            None => this.run_partial_callbacks(&value),
        }
    }

    /// Conjunction of the registered ready probes (vacuously true).
    pub fn ready(&self) -> bool {
        let mut probes = mem::take(&mut self.inner.borrow_mut().ready_probes);
        let mut ready = true;
        for probe in probes.iter_mut() {
            ready &= probe();
        }
        self.restore_probes(probes, true);
        ready
    }

    /// Disjunction of the registered closed probes (vacuously false).
    pub fn closed(&self) -> bool {
        let mut probes = mem::take(&mut self.inner.borrow_mut().closed_probes);
        let mut closed = false;
        for probe in probes.iter_mut() {
            closed |= probe();
        }
        self.restore_probes(probes, false);
        closed
    }

    /// Adopts the terminal state, callbacks and loop binding of another
    /// future, leaving the other one drained.
    pub fn wrap_from(&self, other: &FutureHandle<T>) {
        let mut inner = self.inner.borrow_mut();
        let mut other_inner = other.inner.borrow_mut();
        inner.status = other_inner.status;
        inner.result = other_inner.result.take();
        inner.exception = other_inner.exception.take();
        inner.done_callbacks = mem::take(&mut other_inner.done_callbacks);
        inner.partial_callbacks = mem::take(&mut other_inner.partial_callbacks);
        inner.ready_probes = mem::take(&mut other_inner.ready_probes);
        inner.closed_probes = mem::take(&mut other_inner.closed_probes);
        inner.engine = other_inner.engine.clone();
    }

    /// Terminal transition. Past the first transition this is a no-op unless
    /// forced; the actual callback dispatch is deferred to the loop.
    fn complete(
        &self,
        status: FutureStatus,
        result: Option<T>,
        exception: Option<Fail>,
        force: bool,
    ) {
        {
            let mut inner = self.inner.borrow_mut();
            if !force && inner.status != FutureStatus::Running {
                return;
            }
            inner.status = status;
            inner.result = result;
            inner.exception = exception;
        }
        self.dispatch_done();
    }

    /// Schedules the done callbacks through the owning loop, so that they
    /// never run inside the `set_*` call, and wakes any awaiting task.
    fn dispatch_done(&self) {
        let engine = self.inner.borrow().engine.clone();
        match engine {
            Some(engine) => {
                let this = self.clone();
                engine.delay(move || this.run_done_callbacks());
            }
            None => self.run_done_callbacks(),
        }
        let wakers: Vec<Waker> = self.inner.borrow_mut().wakers.drain(..).collect();
        for waker in wakers {
            waker.wake();
        }
    }

    /// Runs and drains the done callbacks, then drops the remaining
    /// callback lists.
    fn run_done_callbacks(&self) {
        let callbacks: Vec<DoneCallback<T>> =
            mem::take(&mut self.inner.borrow_mut().done_callbacks);
        for mut callback in callbacks {
            callback(self);
        }
        let mut inner = self.inner.borrow_mut();
        inner.partial_callbacks.clear();
        inner.ready_probes.clear();
        inner.closed_probes.clear();
    }

    /// Runs the partial callbacks against a streamed value.
    fn run_partial_callbacks(&self, value: &T) {
        let mut callbacks = mem::take(&mut self.inner.borrow_mut().partial_callbacks);
        for callback in callbacks.iter_mut() {
            callback(self, value);
        }
        let mut inner = self.inner.borrow_mut();
        let added = mem::replace(&mut inner.partial_callbacks, callbacks);
        inner.partial_callbacks.extend(added);
    }

    /// Puts a probe list back, preserving probes added during the run.
    fn restore_probes(&self, probes: Vec<Probe>, ready: bool) {
        let mut inner = self.inner.borrow_mut();
        let list = if ready {
            &mut inner.ready_probes
        } else {
            &mut inner.closed_probes
        };
        let added = mem::replace(list, probes);
        list.extend(added);
    }
}

/// Associate functions for [FutureHandle] over defaultable results.
impl<T: Default + 'static> FutureHandle<T> {
    /// Completes the target future with the default result.
    pub fn approve(&self) {
        self.set_result(T::default());
    }
}

/// Associate functions for [FutureHandle] over cloneable results.
impl<T: Clone + 'static> FutureHandle<T> {
    /// Returns a copy of the result of the target future, if set.
    pub fn result(&self) -> Option<T> {
        self.inner.borrow().result.clone()
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Clone trait implementation for [FutureHandle].
impl<T> Clone for FutureHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Debug trait implementation for [FutureHandle].
impl<T> fmt::Debug for FutureHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FutureHandle({})", self.inner.borrow().status)
    }
}

/// Future trait implementation for [FutureHandle], bridging the container
/// into native `await` positions.
impl<T: 'static> future::Future for FutureHandle<T> {
    type Output = Result<T, Fail>;

    /// Polls the target container.
    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        match inner.status {
            FutureStatus::Running => {
                let waker = ctx.waker();
                if !inner.wakers.iter().any(|w| w.will_wake(waker)) {
                    inner.wakers.push(waker.clone());
                }
                Poll::Pending
            }
            FutureStatus::Done => match inner.result.take() {
                Some(result) => Poll::Ready(Ok(result)),
                None => panic!("future polled after completion"),
            },
            FutureStatus::Cancelled => Poll::Ready(Err(inner
                .exception
                .clone()
                .unwrap_or(Fail::Cancelled {}))),
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
