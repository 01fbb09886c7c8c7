// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    conn::SendCallback,
    fail::Fail,
    observer::{BindId, Event, Observer},
    timer::TimerHandle,
    transport::Transport,
};

use bytes::Bytes;

use std::{collections::VecDeque, net::SocketAddr, time::Duration};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Protocol
///
/// The capability implemented by the application layer. The loop and the
/// transport depend on this trait only, never on the concrete type: stream
/// protocols receive `data_received`, datagram protocols
/// `datagram_received`, and both are told about the write flow through
/// `pause_writing` / `resume_writing`.
///
/// Every method defaults to a no-op so implementations override exactly the
/// lifecycle they care about.
pub trait Protocol {
    /// The transport is ready; keep a clone for writing.
    fn connection_made(&mut self, transport: &Transport) {
        let _ = transport;
    }

    /// Stream bytes arrived, in socket order.
    fn data_received(&mut self, data: &[u8]) {
        let _ = data;
    }

    /// One datagram arrived from the given address.
    fn datagram_received(&mut self, data: &[u8], from: SocketAddr) {
        let _ = (data, from);
    }

    /// The peer finished writing (orderly end of stream).
    fn eof_received(&mut self) {}

    /// The send queue crossed the high watermark; stop writing.
    fn pause_writing(&mut self) {}

    /// The send queue drained below the low watermark; write again.
    fn resume_writing(&mut self) {}

    /// A datagram socket reported an asynchronous error.
    fn error_received(&mut self, error: Fail) {
        let _ = error;
    }

    /// The connection is gone, with the error that killed it if any.
    fn connection_lost(&mut self, error: Option<Fail>) {
        let _ = error;
    }
}

/// Kinds of events raised by a [ProtocolCore].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ProtocolEventKind {
    Open,
    Close,
}

/// Events raised by a [ProtocolCore].
pub enum ProtocolEvent {
    Open,
    Close,
}

/// Building block for [Protocol] implementations: holds the transport,
/// gates writes on the flow-control state and queues what cannot be written
/// while paused, flushing FIFO on resume.
pub struct ProtocolCore {
    transport: Option<Transport>,
    writing: bool,
    closed: bool,
    delayed: VecDeque<(Bytes, Option<SocketAddr>, Option<SendCallback>)>,
    observer: Observer<ProtocolEvent>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [ProtocolCore].
impl ProtocolCore {
    /// Creates a core with no transport attached.
    pub fn new() -> Self {
        Self {
            transport: None,
            writing: true,
            closed: true,
            delayed: VecDeque::new(),
            observer: Observer::new(),
        }
    }

    /// Stores the transport and opens the protocol. Call from
    /// [Protocol::connection_made].
    pub fn connection_made(&mut self, transport: &Transport) {
        self.transport = Some(transport.clone());
        self.open();
    }

    /// Marks the protocol open.
    pub fn open(&mut self) {
        if !self.closed {
            return;
        }
        self.closed = false;
        self.observer.trigger(&ProtocolEvent::Open);
    }

    /// Tears the protocol down, aborting the transport and dropping the
    /// paused queue. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if let Some(transport) = self.transport.take() {
            transport.abort();
        }
        self.delayed.clear();
        self.writing = true;
        self.closed = true;
        self.observer.trigger(&ProtocolEvent::Close);
    }

    /// Call from [Protocol::connection_lost].
    pub fn connection_lost(&mut self, error: Option<Fail>) {
        if let Some(error) = error {
            debug!("connection lost ({})", error);
        }
        // The transport is already closing; do not abort it again.
        self.transport = None;
        self.close();
    }

    /// Call from [Protocol::pause_writing].
    pub fn pause_writing(&mut self) {
        self.writing = false;
    }

    /// Call from [Protocol::resume_writing]: reopens the gate and flushes
    /// the queued sends in FIFO order.
    pub fn resume_writing(&mut self) {
        self.writing = true;
        self.flush_send();
    }

    /// Sends stream bytes, queueing them while the flow is paused. Returns
    /// the number of bytes accepted by the transport (zero when queued).
    pub fn send(&mut self, data: &[u8], callback: Option<SendCallback>) -> Result<usize, Fail> {
        if !self.writing {
            return self.delay_send(data, None, callback);
        }
        let transport = self.transport()?;
        match callback {
            Some(callback) => transport.write_with(data, callback),
            None => transport.write(data),
        }
    }

    /// Sends one datagram, queueing it while the flow is paused.
    pub fn send_to(
        &mut self,
        data: &[u8],
        address: SocketAddr,
        callback: Option<SendCallback>,
    ) -> Result<usize, Fail> {
        if !self.writing {
            return self.delay_send(data, Some(address), callback);
        }
        let transport = self.transport()?;
        let count = transport.sendto(data, address)?;
        if let Some(callback) = callback {
            transport.engine().delay(move || callback(Ok(())));
        }
        Ok(count)
    }

    /// Schedules a callable on the owning loop, immediately or after a
    /// timeout. Returns the timer handle for delayed schedules.
    pub fn delay(
        &self,
        callback: impl FnOnce() + 'static,
        timeout: Option<Duration>,
    ) -> Result<Option<TimerHandle>, Fail> {
        let engine = self.transport()?.engine();
        match timeout {
            Some(timeout) => Ok(Some(engine.delay_for(timeout, callback))),
            None => {
                engine.delay(callback);
                Ok(None)
            }
        }
    }

    /// Returns the transport, failing when the protocol is detached.
    pub fn transport(&self) -> Result<Transport, Fail> {
        self.transport.clone().ok_or(Fail::ConnectionClosed {})
    }

    /// Returns whether the protocol is open.
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Returns whether the protocol is closed.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns whether writes currently pass straight to the transport.
    pub fn is_writing(&self) -> bool {
        self.writing
    }

    /// Binds a listener to the protocol lifecycle events.
    pub fn bind(
        &self,
        kind: ProtocolEventKind,
        listener: impl FnMut(&ProtocolEvent) + 'static,
    ) -> BindId {
        self.observer.bind(kind, listener)
    }

    /// Unbinds a previously bound listener.
    pub fn unbind(&self, kind: ProtocolEventKind, id: BindId) -> bool {
        self.observer.unbind(kind, id)
    }

    /// Logging bridges, so protocol implementations log through the loop's
    /// sink without importing the macros themselves.
    pub fn debug(&self, message: &str) {
        debug!("{}", message);
    }

    pub fn info(&self, message: &str) {
        info!("{}", message);
    }

    pub fn warning(&self, message: &str) {
        warn!("{}", message);
    }

    pub fn error(&self, message: &str) {
        error!("{}", message);
    }

    pub fn critical(&self, message: &str) {
        error!("{}", message);
    }

    /// Queues a send until the flow is resumed.
    fn delay_send(
        &mut self,
        data: &[u8],
        address: Option<SocketAddr>,
        callback: Option<SendCallback>,
    ) -> Result<usize, Fail> {
        if self.closed {
            return Err(Fail::ConnectionClosed {});
        }
        self.delayed
            .push_back((Bytes::copy_from_slice(data), address, callback));
        Ok(0)
    }

    /// Flushes the paused queue while the gate stays open.
    fn flush_send(&mut self) {
        while self.writing {
            let (data, address, callback) = match self.delayed.pop_front() {
                Some(item) => item,
                None => break,
            };
            let outcome = match address {
                Some(address) => self.send_to(&data[..], address, callback),
                None => self.send(&data[..], callback),
            };
            if let Err(error) = outcome {
                warn!("dropped delayed send ({})", error);
                break;
            }
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Default trait implementation for [ProtocolCore].
impl Default for ProtocolCore {
    fn default() -> Self {
        Self::new()
    }
}

/// Event trait implementation for [ProtocolEvent].
impl Event for ProtocolEvent {
    type Kind = ProtocolEventKind;

    fn kind(&self) -> ProtocolEventKind {
        match self {
            ProtocolEvent::Open => ProtocolEventKind::Open,
            ProtocolEvent::Close => ProtocolEventKind::Close,
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================
