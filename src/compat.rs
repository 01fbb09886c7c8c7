// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    asynchronous::FutureHandle,
    client::Client,
    conn::{ConnEvent, ConnEventKind},
    engine::{Engine, EngineHandle},
    fail::Fail,
    timer::TimerHandle,
    transport::{ProtocolRef, Transport},
};

use std::{
    net::{SocketAddr, ToSocketAddrs},
    time::Duration,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Compat
///
/// Façade presenting the loop under the conventions of the mainstream
/// single-threaded async runtimes: `call_soon`, `call_later`,
/// `create_task`, `create_connection` and friends, all dispatching to the
/// core engine.

/// Handle to a scheduled call. Immediate calls cannot be revoked, so their
/// handle's cancel is a no-op.
pub struct Handle {
    timer: Option<TimerHandle>,
}

/// Compat Loop
pub struct LoopCompat {
    engine: Engine,
    client: Client,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Handle].
impl Handle {
    /// Cancels the scheduled call when still possible.
    pub fn cancel(&self) {
        if let Some(timer) = &self.timer {
            timer.cancel();
        }
    }
}

/// Associate functions for [LoopCompat].
impl LoopCompat {
    /// Creates a compat façade over a fresh engine.
    pub fn new() -> Result<Self, Fail> {
        let engine = Engine::new()?;
        let client = Client::new(engine.handle());
        Ok(Self { engine, client })
    }

    /// Returns the wall-clock time in seconds since the epoch.
    pub fn time(&self) -> f64 {
        self.engine.handle().time()
    }

    /// Schedules a callback on the next loop iteration.
    pub fn call_soon(&self, callback: impl FnOnce() + 'static) -> Handle {
        self.engine.handle().delay(callback);
        Handle { timer: None }
    }

    /// Schedules a callback from any thread, waking a blocked loop.
    pub fn call_soon_threadsafe(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<Handle, Fail> {
        self.engine.handle().delay_safe(callback)?;
        Ok(Handle { timer: None })
    }

    /// Schedules a callback after the given delay.
    pub fn call_later(&self, delay: Duration, callback: impl FnOnce() + 'static) -> Handle {
        let timer = self.engine.handle().delay_for(delay, callback);
        Handle { timer: Some(timer) }
    }

    /// Schedules a callback at the given wall-clock time (seconds since the
    /// epoch, the scale of [LoopCompat::time]).
    pub fn call_at(&self, when: f64, callback: impl FnOnce() + 'static) -> Handle {
        let delay = (when - self.time()).max(0.0);
        self.call_later(Duration::from_secs_f64(delay), callback)
    }

    /// Creates a future bound to this loop.
    pub fn create_future<T: 'static>(&self) -> FutureHandle<T> {
        self.engine.handle().build_future()
    }

    /// Hosts a coroutine as a task on this loop.
    pub fn create_task<T: 'static>(
        &self,
        coroutine: impl std::future::Future<Output = Result<T, Fail>> + 'static,
    ) -> FutureHandle<T> {
        let handle = self.engine.handle();
        if handle.is_stopped() {
            let future = handle.build_future();
            future.set_exception(Fail::LoopStopped {});
            return future;
        }
        handle.ensure(coroutine)
    }

    /// Opens a stream connection and resolves with the transport/protocol
    /// pair once it is established.
    pub fn create_connection(
        &self,
        factory: impl FnOnce() -> ProtocolRef,
        host: &str,
        port: u16,
    ) -> FutureHandle<(Transport, ProtocolRef)> {
        let handle = self.engine.handle();
        let future = handle.build_future();
        if handle.is_stopped() {
            future.set_exception(Fail::LoopStopped {});
            return future;
        }
        let conn = match self.client.connect(host, port) {
            Ok(conn) => conn,
            Err(error) => {
                future.set_exception(error);
                return future;
            }
        };
        let protocol = factory();
        let transport = Transport::stream(handle, conn.clone());
        transport.set_compat(protocol.clone());

        let future_ = future.clone();
        let transport_ = transport.clone();
        let protocol_ = protocol.clone();
        conn.bind(ConnEventKind::Connect, move |_| {
            future_.set_result((transport_.clone(), protocol_.clone()));
        });

        let future_ = future.clone();
        conn.bind(ConnEventKind::Close, move |event| {
            if let ConnEvent::Close { error, .. } = event {
                if future_.running() {
                    future_
                        .set_exception(error.clone().unwrap_or(Fail::ConnectionRefused {}));
                }
            }
        });

        future
    }

    /// Resolves a host/port pair behind a future. Resolution itself is
    /// synchronous; the future resolves on the next iteration.
    pub fn getaddrinfo(&self, host: &str, port: u16) -> FutureHandle<Vec<SocketAddr>> {
        let handle = self.engine.handle();
        let future = handle.build_future();
        let outcome = (host, port)
            .to_socket_addrs()
            .map(|addrs| addrs.collect::<Vec<_>>());
        let future_ = future.clone();
        handle.delay(move || match outcome {
            Ok(addrs) => future_.set_result(addrs),
            Err(error) => future_.set_exception(error.into()),
        });
        future
    }

    /// Reverse resolution is not provided.
    pub fn getnameinfo(&self, addr: SocketAddr) -> Result<(String, String), Fail> {
        let _ = addr;
        Err(Fail::Unsupported {
            details: "getnameinfo",
        })
    }

    /// Runs the loop until the given future is terminal.
    pub fn run_until_complete<T: 'static>(&mut self, future: FutureHandle<T>) -> Result<T, Fail> {
        self.engine.run_until_complete(future)
    }

    /// Returns whether debug logging is enabled.
    pub fn get_debug(&self) -> bool {
        log_enabled!(log::Level::Debug)
    }

    /// Returns whether the loop was flagged to stop.
    pub fn is_closed(&self) -> bool {
        self.engine.handle().is_stopped()
    }

    /// Returns the scheduling handle of the underlying engine.
    pub fn handle(&self) -> EngineHandle {
        self.engine.handle()
    }

    /// Returns the underlying engine for direct driving.
    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::LoopCompat;
    use std::{cell::RefCell, rc::Rc, time::Duration};

    /// Tests if a later call can be cancelled through its handle.
    #[test]
    fn compat_call_later_cancel() {
        let mut compat = LoopCompat::new().unwrap();
        let fired: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));

        let fired_ = fired.clone();
        let handle = compat.call_later(Duration::from_millis(10), move || {
            *fired_.borrow_mut() = true
        });
        handle.cancel();

        let sleeper = compat.handle().sleep(Duration::from_millis(50));
        compat.run_until_complete(sleeper).unwrap();
        assert!(!*fired.borrow());
    }

    /// Tests if resolution resolves localhost behind a future.
    #[test]
    fn compat_getaddrinfo() {
        let mut compat = LoopCompat::new().unwrap();
        let future = compat.getaddrinfo("127.0.0.1", 80);
        let addrs = compat.run_until_complete(future).unwrap();
        assert!(!addrs.is_empty());
        assert_eq!(addrs[0].port(), 80);
    }

    /// Tests if reverse resolution reports the unsupported operation.
    #[test]
    fn compat_getnameinfo_unsupported() {
        let compat = LoopCompat::new().unwrap();
        assert!(compat
            .getnameinfo("127.0.0.1:80".parse().unwrap())
            .is_err());
    }

    /// Tests if immediate handles ignore cancellation.
    #[test]
    fn compat_call_soon_runs() {
        let mut compat = LoopCompat::new().unwrap();
        let fired: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));

        let fired_ = fired.clone();
        let handle = compat.call_soon(move || *fired_.borrow_mut() = true);
        handle.cancel();

        let sleeper = compat.handle().sleep(Duration::from_millis(10));
        compat.run_until_complete(sleeper).unwrap();
        assert!(*fired.borrow());
    }
}
