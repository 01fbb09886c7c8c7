// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use super::FutureHandle;
use crate::{
    engine::{EngineHandle, RemoteHandle},
    fail::Fail,
};

use futures::task::{waker, ArcWake};

use std::{
    cell::{Cell, RefCell},
    future::Future,
    pin::Pin,
    rc::Rc,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

pub use crate::engine::TaskId;

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Tasks
///
/// A task hosts a coroutine (a native future) on the loop: each step sends
/// the coroutine forward by polling it, and the waker handed to the poll
/// re-enqueues the next step through the wake-signal-safe inbox. The
/// coroutine therefore suspends only at await points, and its terminal value
/// or error lands on the single-assignment container returned by
/// [EngineHandle::ensure].
///
/// Cancelling the container is cooperative: the driver drops the coroutine
/// on the step after the cancellation, so a coroutine holding the thread
/// never observes it before yielding.

/// Waker re-enqueuing a task step when the awaited readiness arrives.
struct TaskWaker {
    id: TaskId,
    remote: RemoteHandle,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [EngineHandle] hosting tasks.
impl EngineHandle {
    /// Turns a coroutine into a task bound to this loop and returns the
    /// future carrying its terminal value.
    pub fn ensure<T, F>(&self, coroutine: F) -> FutureHandle<T>
    where
        T: 'static,
        F: Future<Output = Result<T, Fail>> + 'static,
    {
        let result: FutureHandle<T> = self.build_future();
        let mut pinned: Pin<Box<dyn Future<Output = Result<T, Fail>>>> = Box::pin(coroutine);
        let remote = self.remote();

        // The task identifier only exists after insertion, so the step
        // closure reads it through a shared cell.
        let id_cell: Rc<Cell<Option<TaskId>>> = Rc::new(Cell::new(None));

        let result_ = result.clone();
        let id_cell_ = id_cell.clone();
        let step: Box<dyn FnMut() -> bool> = Box::new(move || {
            // An externally cancelled task retires without another poll,
            // dropping the coroutine.
            if result_.cancelled() {
                return true;
            }
            let id = match id_cell_.get() {
                Some(id) => id,
                None => return true,
            };
            let waker = waker(Arc::new(TaskWaker {
                id,
                remote: remote.clone(),
            }));
            let mut ctx = Context::from_waker(&waker);
            match pinned.as_mut().poll(&mut ctx) {
                Poll::Pending => false,
                Poll::Ready(Ok(value)) => {
                    result_.set_result(value);
                    true
                }
                Poll::Ready(Err(error)) => {
                    result_.set_exception(error);
                    true
                }
            }
        });

        let id = self.insert_task(Rc::new(RefCell::new(step)));
        id_cell.set(Some(id));
        self.schedule_step(id);

        // A cancellation from outside wakes the driver so the coroutine is
        // dropped promptly rather than on loop teardown.
        let this = self.clone();
        let result_ = result.clone();
        result.add_done_callback(move |_| {
            if result_.cancelled() {
                this.schedule_step(id);
            }
        });

        result
    }
}

/// Resolves with the first of the two futures to reach a terminal state and
/// cancels the other one.
pub fn first_of<T: 'static>(first: FutureHandle<T>, second: FutureHandle<T>) -> FutureHandle<T> {
    let winner: FutureHandle<T> = match first.engine().or_else(|| second.engine()) {
        Some(engine) => engine.build_future(),
        None => FutureHandle::new(None),
    };
    attach_racer(&first, &second, &winner);
    attach_racer(&second, &first, &winner);
    winner
}

/// Bounds a future by a deadline: past it, the future is cancelled and the
/// returned one fails with a timeout.
pub fn timeout<T: 'static>(
    engine: &EngineHandle,
    future: FutureHandle<T>,
    limit: Duration,
) -> FutureHandle<T> {
    let bounded: FutureHandle<T> = engine.build_future();
    let sleeper = engine.sleep(limit);

    let bounded_ = bounded.clone();
    let sleeper_ = sleeper.clone();
    future.add_done_callback(move |f| {
        if !bounded_.running() {
            return;
        }
        match f.exception() {
            Some(exception) => bounded_.set_exception(exception),
            None => match f.take_result() {
                Some(value) => bounded_.set_result(value),
                None => bounded_.cancel(),
            },
        }
        sleeper_.cancel();
    });

    let bounded_ = bounded.clone();
    sleeper.add_done_callback(move |s| {
        if !bounded_.running() || s.cancelled() {
            return;
        }
        bounded_.set_exception(Fail::TimedOut {});
        future.cancel();
    });

    bounded
}

/// Forwards the terminal state of `racer` into `winner` once, cancelling the
/// other contender.
fn attach_racer<T: 'static>(
    racer: &FutureHandle<T>,
    other: &FutureHandle<T>,
    winner: &FutureHandle<T>,
) {
    let winner = winner.clone();
    let other = other.clone();
    racer.add_done_callback(move |f| {
        if !winner.running() {
            return;
        }
        match f.exception() {
            Some(exception) => winner.set_exception(exception),
            None => match f.take_result() {
                Some(value) => winner.set_result(value),
                None => winner.cancel(),
            },
        }
        other.cancel();
    });
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// ArcWake trait implementation for [TaskWaker].
impl ArcWake for TaskWaker {
    /// Requests the next step of the awaiting task.
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.remote.step(arc_self.id);
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::{first_of, timeout};
    use crate::{engine::Engine, fail::Fail};
    use std::time::{Duration, Instant};

    /// Tests if a coroutine awaiting a loop future runs to completion.
    #[test]
    fn task_runs_coroutine() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();

        let result = engine
            .run_coroutine(async move {
                let slept = handle.sleep(Duration::from_millis(10)).await?;
                Ok(slept.as_millis() as u32)
            })
            .unwrap();

        assert_eq!(result, 10);
    }

    /// Tests if coroutine errors surface as the task's exception.
    #[test]
    fn task_propagates_errors() {
        let mut engine = Engine::new().unwrap();

        let result: Result<u32, Fail> =
            engine.run_coroutine(async move { Err(Fail::ConnectionReset {}) });

        assert_eq!(result, Err(Fail::ConnectionReset {}));
    }

    /// Tests if an externally cancelled task surfaces the cancellation.
    #[test]
    fn task_cancellation() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();

        let sleeper = handle.sleep(Duration::from_secs(5));
        let task = handle.ensure(async move {
            sleeper.await?;
            Ok(0u32)
        });

        let task_ = task.clone();
        handle.delay_for(Duration::from_millis(10), move || task_.cancel());

        let start = Instant::now();
        let result = engine.run_until_complete(task);
        assert_eq!(result, Err(Fail::Cancelled {}));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    /// Tests if the first of two sleeps wins and the loser is cancelled.
    #[test]
    fn task_first_of_sleeps() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();

        let quick = handle.sleep(Duration::from_millis(50));
        let slow = handle.sleep(Duration::from_millis(1000));
        let winner = first_of(quick, slow.clone());

        let start = Instant::now();
        let value = engine.run_until_complete(winner).unwrap();

        assert_eq!(value, Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(slow.cancelled());
    }

    /// Tests if a timed out future is cancelled and surfaces the timeout.
    #[test]
    fn task_timeout_expires() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();

        let pending = handle.build_future::<u32>();
        let bounded = timeout(&handle, pending.clone(), Duration::from_millis(20));

        let result = engine.run_until_complete(bounded);
        assert_eq!(result, Err(Fail::TimedOut {}));
        assert!(pending.cancelled());
    }
}
