// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    asynchronous::FutureHandle,
    conn::Connection,
    fail::Fail,
    poll::{Poller, Readiness},
    timer::{TimerHandle, TimerQueue},
};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use mio::{Registry, Token, Waker};
use slab::Slab;

use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, HashSet, VecDeque},
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Engine
///
/// The per-thread scheduler. One iteration drains the cross-thread inbox,
/// waits for readiness bounded by the nearest timer deadline, fans readiness
/// out to connections and acceptors, moves due timers into the ready queue
/// and then runs the ready queue against a snapshot bound so work scheduled
/// during the drain waits one iteration.
///
/// All mutation happens on the loop thread. The only cross-thread entry
/// points are the [RemoteHandle] inbox and the wake signal behind it.

/// Token reserved for the cross-thread wake signal.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// Callable scheduled on the ready queue.
pub type Callback = Box<dyn FnOnce()>;

/// Identifier of a task hosted by the loop.
pub type TaskId = usize;

/// Type-erased task step: advances the task, returns whether it finished.
pub(crate) type TaskStep = Rc<RefCell<Box<dyn FnMut() -> bool>>>;

/// Accept callback of a listening socket.
pub(crate) type Acceptor = Rc<RefCell<Box<dyn FnMut()>>>;

/// Message accepted by the cross-thread inbox.
pub(crate) enum InboxMessage {
    Run(Box<dyn FnOnce() + Send>),
    Step(TaskId),
}

/// Loop state shared between the engine and its handles.
struct Shared {
    ready: VecDeque<Callback>,
    keyed: HashSet<usize>,
    timers: TimerQueue,
    tasks: Slab<TaskStep>,
    conns: HashMap<Token, Connection>,
    acceptors: HashMap<Token, Acceptor>,
    waiters: HashMap<String, VecDeque<FutureHandle<Bytes>>>,
    next_token: usize,
}

/// Loop-local scheduling handle, cloneable and cheap. Holds no sockets.
pub struct EngineHandle {
    shared: Rc<RefCell<Shared>>,
    registry: Rc<Registry>,
    inbox_tx: Sender<InboxMessage>,
    waker: Arc<Waker>,
    wake_pending: Arc<AtomicBool>,
    stopped: Rc<Cell<bool>>,
}

/// Cross-thread handle: the inbox plus the wake signal.
#[derive(Clone)]
pub struct RemoteHandle {
    inbox_tx: Sender<InboxMessage>,
    waker: Arc<Waker>,
    wake_pending: Arc<AtomicBool>,
}

/// Engine
pub struct Engine {
    poller: Poller,
    handle: EngineHandle,
    inbox_rx: Receiver<InboxMessage>,
}

thread_local! {
    static CURRENT: RefCell<Option<EngineHandle>> = RefCell::new(None);
}

/// Restores the previously installed loop handle when dropped.
struct EnterGuard {
    previous: Option<EngineHandle>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Returns the handle of the loop running on the current thread. Forbidden
/// outside a running loop.
pub fn current() -> Result<EngineHandle, Fail> {
    CURRENT
        .with(|current| current.borrow().clone())
        .ok_or(Fail::LoopStopped {})
}

/// Associate functions for [Engine].
impl Engine {
    /// Creates an engine with an empty schedule.
    pub fn new() -> Result<Self, Fail> {
        let poller = Poller::new()?;
        let registry = Rc::new(poller.registry()?);
        let waker = Arc::new(poller.waker(WAKE_TOKEN)?);
        let (inbox_tx, inbox_rx) = crossbeam_channel::unbounded();
        let shared = Shared {
            ready: VecDeque::new(),
            keyed: HashSet::new(),
            timers: TimerQueue::new(),
            tasks: Slab::new(),
            conns: HashMap::new(),
            acceptors: HashMap::new(),
            waiters: HashMap::new(),
            next_token: WAKE_TOKEN.0 + 1,
        };
        let handle = EngineHandle {
            shared: Rc::new(RefCell::new(shared)),
            registry,
            inbox_tx,
            waker,
            wake_pending: Arc::new(AtomicBool::new(false)),
            stopped: Rc::new(Cell::new(false)),
        };
        Ok(Self {
            poller,
            handle,
            inbox_rx,
        })
    }

    /// Returns a scheduling handle to the target engine.
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Runs the loop until [EngineHandle::stop] is called. Starting is
    /// idempotent: a previous stop flag is cleared.
    pub fn start(&mut self) -> Result<(), Fail> {
        self.handle.stopped.set(false);
        let _guard = self.enter();
        debug!("loop started");
        while !self.handle.stopped.get() {
            self.run_once()?;
        }
        debug!("loop stopped");
        Ok(())
    }

    /// Runs the loop until the given future reaches a terminal state and
    /// surfaces its result or exception to the caller.
    pub fn run_until_complete<T: 'static>(
        &mut self,
        future: FutureHandle<T>,
    ) -> Result<T, Fail> {
        self.handle.stopped.set(false);
        let _guard = self.enter();
        while future.running() {
            if self.handle.stopped.get() {
                return Err(Fail::LoopStopped {});
            }
            self.run_once()?;
        }
        if let Some(exception) = future.exception() {
            return Err(exception);
        }
        future.take_result().ok_or(Fail::Cancelled {})
    }

    /// Hosts a coroutine as a task and runs the loop to its completion.
    pub fn run_coroutine<T: 'static>(
        &mut self,
        coroutine: impl std::future::Future<Output = Result<T, Fail>> + 'static,
    ) -> Result<T, Fail> {
        let future = self.handle.ensure(coroutine);
        self.run_until_complete(future)
    }

    /// Performs a single iteration of the loop.
    pub fn tick(&mut self) -> Result<(), Fail> {
        let _guard = self.enter();
        self.run_once()
    }

    /// One iteration, with the current-loop handle already installed.
    fn run_once(&mut self) -> Result<(), Fail> {
        // The wake signal was consumed; a new one is needed for new work.
        self.handle.wake_pending.store(false, Ordering::Release);

        // Drain the cross-thread inbox into the ready queue.
        {
            let handle = self.handle.clone();
            let mut shared = self.handle.shared.borrow_mut();
            while let Ok(message) = self.inbox_rx.try_recv() {
                match message {
                    InboxMessage::Run(callback) => shared.ready.push_back(callback),
                    InboxMessage::Step(id) => {
                        let handle = handle.clone();
                        shared
                            .ready
                            .push_back(Box::new(move || handle.step_task(id)));
                    }
                }
            }
        }

        // Wait for readiness, bounded by pending work: zero when the ready
        // queue holds callables, the nearest deadline when timers are armed,
        // indefinitely otherwise.
        let timeout = {
            let mut shared = self.handle.shared.borrow_mut();
            if !shared.ready.is_empty() {
                Some(Duration::from_millis(0))
            } else {
                shared
                    .timers
                    .next_deadline()
                    .map(|deadline| deadline.saturating_duration_since(Instant::now()))
            }
        };
        let ready = self.poller.poll(timeout)?;

        // Fan readiness out to acceptors and connections.
        for readiness in ready {
            self.dispatch(readiness);
        }

        // Move due timers into the ready queue, preserving deadline order.
        {
            let mut shared = self.handle.shared.borrow_mut();
            let due = shared.timers.drain_due(Instant::now());
            for callback in due {
                shared.ready.push_back(callback);
            }
        }

        // Run the ready queue against a snapshot length: callables scheduled
        // while draining wait for the next iteration, so timers and I/O
        // cannot be starved by a callable rescheduling itself.
        let count = self.handle.shared.borrow().ready.len();
        for _ in 0..count {
            let callback = self.handle.shared.borrow_mut().ready.pop_front();
            match callback {
                Some(callback) => callback(),
                None => break,
            }
        }

        Ok(())
    }

    /// Routes one readiness report to its owner.
    fn dispatch(&mut self, readiness: Readiness) {
        if readiness.token == WAKE_TOKEN {
            return;
        }
        let acceptor = {
            self.handle
                .shared
                .borrow()
                .acceptors
                .get(&readiness.token)
                .cloned()
        };
        if let Some(acceptor) = acceptor {
            let mut accept = acceptor.borrow_mut();
            (&mut *accept)();
            return;
        }
        let conn = {
            self.handle
                .shared
                .borrow()
                .conns
                .get(&readiness.token)
                .cloned()
        };
        if let Some(conn) = conn {
            if readiness.error {
                conn.on_error();
                return;
            }
            if readiness.writable {
                conn.on_writable();
            }
            if readiness.readable {
                conn.on_readable();
            }
        } else {
            trace!("readiness for unknown token {:?}", readiness.token);
        }
    }

    /// Installs the loop handle as the current one for this thread.
    fn enter(&self) -> EnterGuard {
        let previous =
            CURRENT.with(|current| current.borrow_mut().replace(self.handle.clone()));
        EnterGuard { previous }
    }
}

/// Associate functions for [EngineHandle].
impl EngineHandle {
    /// Schedules a callable on the ready queue for the next iteration.
    pub fn delay(&self, callback: impl FnOnce() + 'static) {
        self.shared.borrow_mut().ready.push_back(Box::new(callback));
    }

    /// Schedules a callable unless another one with the same key is already
    /// pending. Returns whether the callable was scheduled.
    pub fn delay_keyed(&self, key: usize, callback: impl FnOnce() + 'static) -> bool {
        {
            let mut shared = self.shared.borrow_mut();
            if !shared.keyed.insert(key) {
                return false;
            }
        }
        let this = self.clone();
        self.delay(move || {
            this.shared.borrow_mut().keyed.remove(&key);
            callback();
        });
        true
    }

    /// Schedules a callable to run after the given delay.
    pub fn delay_for(
        &self,
        timeout: Duration,
        callback: impl FnOnce() + 'static,
    ) -> TimerHandle {
        self.shared
            .borrow_mut()
            .timers
            .schedule_after(timeout, Box::new(callback))
    }

    /// Schedules a callable to run at the given deadline.
    pub fn delay_at(&self, deadline: Instant, callback: impl FnOnce() + 'static) -> TimerHandle {
        self.shared
            .borrow_mut()
            .timers
            .schedule_at(deadline, Box::new(callback))
    }

    /// Schedules a callable through the wake-signal-safe inbox. This is the
    /// only scheduling entry point valid from foreign threads.
    pub fn delay_safe(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), Fail> {
        self.remote().run(callback)
    }

    /// Returns the cross-thread handle of the target loop.
    pub fn remote(&self) -> RemoteHandle {
        RemoteHandle {
            inbox_tx: self.inbox_tx.clone(),
            waker: self.waker.clone(),
            wake_pending: self.wake_pending.clone(),
        }
    }

    /// Signals the poller so a blocked iteration returns.
    pub fn wakeup(&self, force: bool) {
        if force || !self.wake_pending.swap(true, Ordering::AcqRel) {
            if let Err(error) = self.waker.wake() {
                warn!("failed to wake the loop ({:?})", error);
            }
        }
    }

    /// Flags the loop to exit on its next iteration. Idempotent.
    pub fn stop(&self) {
        self.stopped.set(true);
        self.wakeup(true);
    }

    /// Returns whether the loop was flagged to stop.
    pub fn is_stopped(&self) -> bool {
        self.stopped.get()
    }

    /// Creates a future bound to the target loop.
    pub fn build_future<T: 'static>(&self) -> FutureHandle<T> {
        FutureHandle::new(Some(self.clone()))
    }

    /// Creates a future resolved by the timer queue after the given
    /// duration, carrying the duration as its result.
    pub fn sleep(&self, timeout: Duration) -> FutureHandle<Duration> {
        let future = self.build_future();
        let future_ = future.clone();
        self.delay_for(timeout, move || future_.set_result(timeout));
        future
    }

    /// Registers a future resolved by the next notification of the given
    /// event. Waiters are resolved in wait order.
    pub fn wait(&self, event: &str) -> FutureHandle<Bytes> {
        let future = self.build_future();
        self.shared
            .borrow_mut()
            .waiters
            .entry(event.to_string())
            .or_insert_with(VecDeque::new)
            .push_back(future.clone());
        future
    }

    /// Resolves every waiter of the given event with the given payload, in
    /// FIFO order. Returns the number of waiters notified.
    pub fn notify(&self, event: &str, data: Bytes) -> usize {
        let waiters = {
            self.shared
                .borrow_mut()
                .waiters
                .remove(event)
                .unwrap_or_default()
        };
        let count = waiters.len();
        for waiter in waiters {
            waiter.set_result(data.clone());
        }
        count
    }

    /// Returns the wall-clock time in seconds since the epoch.
    pub fn time(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Allocates a token for a new socket registration.
    pub(crate) fn alloc_token(&self) -> Token {
        let mut shared = self.shared.borrow_mut();
        let token = Token(shared.next_token);
        shared.next_token += 1;
        token
    }

    /// Returns the poller registry of the target loop.
    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Places a connection in the readiness registry.
    pub(crate) fn insert_connection(&self, token: Token, conn: Connection) {
        self.shared.borrow_mut().conns.insert(token, conn);
    }

    /// Removes a connection from the readiness registry.
    pub(crate) fn remove_connection(&self, token: Token) {
        self.shared.borrow_mut().conns.remove(&token);
    }

    /// Places an acceptor in the readiness registry.
    pub(crate) fn insert_acceptor(&self, token: Token, acceptor: impl FnMut() + 'static) {
        self.shared
            .borrow_mut()
            .acceptors
            .insert(token, Rc::new(RefCell::new(Box::new(acceptor))));
    }

    /// Removes an acceptor from the readiness registry.
    pub(crate) fn remove_acceptor(&self, token: Token) {
        self.shared.borrow_mut().acceptors.remove(&token);
    }

    /// Hosts a task step and returns its identifier.
    pub(crate) fn insert_task(&self, step: TaskStep) -> TaskId {
        self.shared.borrow_mut().tasks.insert(step)
    }

    /// Schedules a step of the given task on the ready queue.
    pub(crate) fn schedule_step(&self, id: TaskId) {
        let this = self.clone();
        self.delay(move || this.step_task(id));
    }

    /// Advances the given task by one step, retiring it when finished.
    pub(crate) fn step_task(&self, id: TaskId) {
        let step = { self.shared.borrow().tasks.get(id).cloned() };
        if let Some(step) = step {
            let finished = {
                let mut advance = step.borrow_mut();
                (&mut *advance)()
            };
            if finished {
                let mut shared = self.shared.borrow_mut();
                if shared.tasks.contains(id) {
                    shared.tasks.remove(id);
                }
            }
        }
    }
}

/// Associate functions for [RemoteHandle].
impl RemoteHandle {
    /// Enqueues a callable to run on the loop thread and wakes the loop.
    /// Fails when the loop was torn down.
    pub fn run(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), Fail> {
        self.inbox_tx
            .send(InboxMessage::Run(Box::new(callback)))
            .map_err(|_| Fail::LoopStopped {})?;
        self.wakeup(false);
        Ok(())
    }

    /// Requests a step of the given task from the loop thread.
    pub(crate) fn step(&self, id: TaskId) {
        if self.inbox_tx.send(InboxMessage::Step(id)).is_ok() {
            self.wakeup(false);
        }
    }

    /// Signals the poller so a blocked iteration returns. One signal is
    /// coalesced per iteration unless forced.
    pub fn wakeup(&self, force: bool) {
        if force || !self.wake_pending.swap(true, Ordering::AcqRel) {
            if let Err(error) = self.waker.wake() {
                warn!("failed to wake the loop ({:?})", error);
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Clone trait implementation for [EngineHandle].
impl Clone for EngineHandle {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            registry: self.registry.clone(),
            inbox_tx: self.inbox_tx.clone(),
            waker: self.waker.clone(),
            wake_pending: self.wake_pending.clone(),
            stopped: self.stopped.clone(),
        }
    }
}

/// Drop trait implementation for [EnterGuard].
impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::Engine;
    use bytes::Bytes;
    use std::{
        cell::RefCell,
        rc::Rc,
        time::{Duration, Instant},
    };

    /// Tests if ready callables run on the next iteration, in order.
    #[test]
    fn engine_ready_order() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();
        let seen: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

        for tag in 0..3u32 {
            let seen_ = seen.clone();
            handle.delay(move || seen_.borrow_mut().push(tag));
        }
        engine.tick().unwrap();

        assert_eq!(*seen.borrow(), vec![0, 1, 2]);
    }

    /// Tests if work scheduled during a drain waits one iteration.
    #[test]
    fn engine_drain_snapshot() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();
        let seen: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let handle_ = handle.clone();
        let seen_ = seen.clone();
        handle.delay(move || {
            seen_.borrow_mut().push("first");
            let seen__ = seen_.clone();
            handle_.delay(move || seen__.borrow_mut().push("second"));
        });

        engine.tick().unwrap();
        assert_eq!(*seen.borrow(), vec!["first"]);
        engine.tick().unwrap();
        assert_eq!(*seen.borrow(), vec!["first", "second"]);
    }

    /// Tests if keyed scheduling filters duplicate pending callables.
    #[test]
    fn engine_keyed_dedup() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();
        let count: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));

        let count_ = count.clone();
        assert!(handle.delay_keyed(7, move || *count_.borrow_mut() += 1));
        let count_ = count.clone();
        assert!(!handle.delay_keyed(7, move || *count_.borrow_mut() += 1));

        engine.tick().unwrap();
        assert_eq!(*count.borrow(), 1);

        // The key frees up once the callable ran.
        let count_ = count.clone();
        assert!(handle.delay_keyed(7, move || *count_.borrow_mut() += 1));
        engine.tick().unwrap();
        assert_eq!(*count.borrow(), 2);
    }

    /// Tests if a timer fires a scheduled callable after its delay.
    #[test]
    fn engine_timer_fires() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();
        let fired: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));

        let fired_ = fired.clone();
        handle.delay_for(Duration::from_millis(20), move || {
            *fired_.borrow_mut() = true
        });

        let start = Instant::now();
        while !*fired.borrow() && start.elapsed() < Duration::from_secs(2) {
            engine.tick().unwrap();
        }
        assert!(*fired.borrow());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    /// Tests if a cancelled timer never fires (the cancel entry fires before
    /// the victim's deadline).
    #[test]
    fn engine_timer_cancellation() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();
        let fired: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));

        let fired_ = fired.clone();
        let victim = handle.delay_for(Duration::from_millis(50), move || {
            *fired_.borrow_mut() = true
        });
        let victim_ = victim.clone();
        handle.delay_for(Duration::from_millis(10), move || victim_.cancel());

        // Drive the loop past the victim's deadline.
        let fence = handle.sleep(Duration::from_millis(100));
        engine.run_until_complete(fence).unwrap();
        assert!(!*fired.borrow());
    }

    /// Tests if notification resolves waiters in FIFO order.
    #[test]
    fn engine_wait_notify() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();

        let first = handle.wait("ready");
        let second = handle.wait("ready");
        assert_eq!(handle.notify("ready", Bytes::from_static(b"go")), 2);
        engine.tick().unwrap();

        assert!(first.done());
        assert!(second.done());
        assert_eq!(first.result(), Some(Bytes::from_static(b"go")));
        assert_eq!(handle.notify("ready", Bytes::new()), 0);
    }

    /// Tests if sleeping resolves with the requested duration.
    #[test]
    fn engine_sleep() {
        let mut engine = Engine::new().unwrap();
        let timeout = Duration::from_millis(30);
        let future = engine.handle().sleep(timeout);

        let start = Instant::now();
        let slept = engine.run_until_complete(future).unwrap();
        assert_eq!(slept, timeout);
        assert!(start.elapsed() >= timeout);
    }

    /// Tests if a callable rescheduling itself every iteration cannot
    /// starve the timer queue.
    #[test]
    fn engine_no_starvation() {
        fn hog(handle: super::EngineHandle, done: Rc<RefCell<bool>>) {
            if *done.borrow() {
                return;
            }
            let handle_ = handle.clone();
            let done_ = done.clone();
            handle.delay(move || hog(handle_, done_));
        }

        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();
        let fired: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));

        let fired_ = fired.clone();
        handle.delay_for(Duration::from_millis(50), move || {
            *fired_.borrow_mut() = true
        });
        hog(handle, fired.clone());

        let start = Instant::now();
        while !*fired.borrow() && start.elapsed() < Duration::from_secs(2) {
            engine.tick().unwrap();
        }
        assert!(*fired.borrow());
    }

    /// Tests if a stopped loop refuses to drive a future to completion.
    #[test]
    fn engine_stop_surfaces() {
        let mut engine = Engine::new().unwrap();
        let handle = engine.handle();

        let future = handle.build_future::<u32>();
        let handle_ = handle.clone();
        handle.delay(move || handle_.stop());
        assert!(engine.run_until_complete(future).is_err());
        assert!(handle.is_stopped());
    }
}
