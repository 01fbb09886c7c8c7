// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    engine::EngineHandle,
    fail::Fail,
    observer::{BindId, Event, Observer},
    tls::{TlsRead, TlsSession},
};

use bytes::Bytes;
use derive_more::Display;
use mio::{
    net::{TcpStream, UdpSocket},
    Interest, Token,
};

use std::{
    cell::RefCell,
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
    rc::{Rc, Weak},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Connection
///
/// One socket, its send queue and its state machine. States only move
/// forward, `closed` is absorbing and releases the socket exactly once.
///
/// Flow control is a hysteresis over the unsent byte count: crossing the
/// high watermark upward raises `Exhausted`, draining below the low
/// watermark raises `Restored`, and nothing fires in between.

/// Low watermark default (bytes).
pub const MIN_PENDING_DEFAULT: usize = 16384;

/// High watermark default (bytes).
pub const MAX_PENDING_DEFAULT: usize = 65536;

/// Read size for draining a readable stream socket.
const RECV_CHUNK: usize = 4096;

/// Read size for a single datagram.
const DATAGRAM_CHUNK: usize = 65536;

/// Callback acknowledging one queued send, in submission order.
pub type SendCallback = Box<dyn FnOnce(Result<(), Fail>)>;

/// States of a [Connection].
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
pub enum ConnState {
    #[display(fmt = "pending")]
    Pending,
    #[display(fmt = "connecting")]
    Connecting,
    #[display(fmt = "open")]
    Open,
    #[display(fmt = "closed")]
    Closed,
}

/// Kinds of events raised by a [Connection].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConnEventKind {
    Connect,
    Data,
    Close,
    Exhausted,
    Restored,
    Upgrade,
}

/// Events raised by a [Connection].
pub enum ConnEvent {
    /// The connection completed its handshake and is open.
    Connect(Connection),
    /// Bytes arrived; datagrams carry the sender address.
    Data {
        conn: Connection,
        data: Bytes,
        from: Option<SocketAddr>,
    },
    /// The connection closed, with the error that caused it if any.
    Close {
        conn: Connection,
        error: Option<Fail>,
    },
    /// The unsent byte count crossed the high watermark upward.
    Exhausted(Connection),
    /// The unsent byte count drained below the low watermark.
    Restored(Connection),
    /// An in-place promotion to TLS completed its handshake.
    Upgrade(Connection),
}

/// Non-owning back-reference from a connection to its owner.
pub trait ConnOwner {
    /// Notifies the owner that one of its connections closed.
    fn connection_closed(&self, token: Token);
}

/// Socket behind a [Connection].
enum Sock {
    Stream(TcpStream),
    Datagram(UdpSocket),
}

/// One entry of the send queue.
struct SendItem {
    data: Bytes,
    offset: usize,
    address: Option<SocketAddr>,
    callback: Option<SendCallback>,
}

/// Connection Data
struct Inner {
    token: Token,
    sock: Option<Sock>,
    state: ConnState,
    send_queue: VecDeque<SendItem>,
    pending_s: usize,
    min_pending: usize,
    max_pending: usize,
    exhausted: bool,
    closing: bool,
    upgraded: bool,
    write_interest: bool,
    tls: Option<TlsSession>,
    engine: EngineHandle,
    owner: Option<Weak<dyn ConnOwner>>,
}

/// Connection
pub struct Connection {
    inner: Rc<RefCell<Inner>>,
    observer: Observer<ConnEvent>,
}

/// Deferred side effects of an I/O step, applied once the state borrow is
/// released so listeners may re-enter the connection.
#[derive(Default)]
struct Effects {
    connected: bool,
    upgraded: bool,
    data: Vec<(Bytes, Option<SocketAddr>)>,
    exhausted: bool,
    restored: bool,
    close: Option<Option<Fail>>,
    callbacks: Vec<(SendCallback, Result<(), Fail>)>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Connection].
impl Connection {
    /// Adopts a stream socket. Accepted sockets without TLS come up open;
    /// everything else stays short of open until its handshake completes.
    pub fn stream(
        engine: EngineHandle,
        mut sock: TcpStream,
        state: ConnState,
        tls: Option<TlsSession>,
        owner: Option<Weak<dyn ConnOwner>>,
    ) -> Result<Self, Fail> {
        let token = engine.alloc_token();
        let write = state == ConnState::Connecting
            || tls.as_ref().map(|t| t.wants_write()).unwrap_or(false);
        let interest = if write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        engine.registry().register(&mut sock, token, interest)?;
        let conn = Self::build(engine.clone(), token, Sock::Stream(sock), state, tls, owner);
        conn.inner.borrow_mut().write_interest = write;
        engine.insert_connection(token, conn.clone());
        Ok(conn)
    }

    /// Adopts a bound datagram socket, which is open by construction.
    pub fn datagram(
        engine: EngineHandle,
        mut sock: UdpSocket,
        owner: Option<Weak<dyn ConnOwner>>,
    ) -> Result<Self, Fail> {
        let token = engine.alloc_token();
        engine
            .registry()
            .register(&mut sock, token, Interest::READABLE)?;
        let conn = Self::build(
            engine.clone(),
            token,
            Sock::Datagram(sock),
            ConnState::Open,
            None,
            owner,
        );
        engine.insert_connection(token, conn.clone());
        Ok(conn)
    }

    /// Binds a listener to one of the connection's event kinds.
    pub fn bind(&self, kind: ConnEventKind, listener: impl FnMut(&ConnEvent) + 'static) -> BindId {
        self.observer.bind(kind, listener)
    }

    /// Unbinds a previously bound listener.
    pub fn unbind(&self, kind: ConnEventKind, id: BindId) -> bool {
        self.observer.unbind(kind, id)
    }

    /// Returns the state of the target connection.
    pub fn state(&self) -> ConnState {
        self.inner.borrow().state
    }

    /// Returns whether the target connection is open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnState::Open
    }

    /// Returns whether the target connection is closed or closing.
    pub fn is_closed(&self) -> bool {
        let inner = self.inner.borrow();
        inner.state == ConnState::Closed || inner.closing
    }

    /// Returns the number of unsent bytes across the send queue.
    pub fn pending_bytes(&self) -> usize {
        self.inner.borrow().pending_s
    }

    /// Returns the low and high watermarks.
    pub fn watermarks(&self) -> (usize, usize) {
        let inner = self.inner.borrow();
        (inner.min_pending, inner.max_pending)
    }

    /// Replaces the low and high watermarks.
    pub fn set_watermarks(&self, min_pending: usize, max_pending: usize) {
        let mut inner = self.inner.borrow_mut();
        inner.min_pending = min_pending;
        inner.max_pending = max_pending;
    }

    /// Returns whether the last watermark crossing was upward.
    pub fn is_exhausted(&self) -> bool {
        self.inner.borrow().exhausted
    }

    /// Returns whether the send queue is on the drained side of the
    /// hysteresis.
    pub fn is_restored(&self) -> bool {
        !self.inner.borrow().exhausted
    }

    /// Returns the local address of the underlying socket.
    pub fn local_addr(&self) -> Result<SocketAddr, Fail> {
        let inner = self.inner.borrow();
        match &inner.sock {
            Some(Sock::Stream(sock)) => Ok(sock.local_addr()?),
            Some(Sock::Datagram(sock)) => Ok(sock.local_addr()?),
            None => Err(Fail::ConnectionClosed {}),
        }
    }

    /// Returns the peer address of the underlying stream socket.
    pub fn peer_addr(&self) -> Result<SocketAddr, Fail> {
        let inner = self.inner.borrow();
        match &inner.sock {
            Some(Sock::Stream(sock)) => Ok(sock.peer_addr()?),
            Some(Sock::Datagram(_)) => Err(Fail::Unsupported {
                details: "datagram sockets are unconnected",
            }),
            None => Err(Fail::ConnectionClosed {}),
        }
    }

    /// Returns the ALPN protocol agreed during the TLS handshake, if any.
    pub fn alpn_protocol(&self) -> Option<Vec<u8>> {
        let inner = self.inner.borrow();
        inner.tls.as_ref().and_then(|tls| tls.alpn_protocol())
    }

    /// Enqueues bytes for delivery and returns how many were queued.
    ///
    /// With `delay` unset the socket is tried right away and only the
    /// leftover is queued; an exhausted connection skips that shortcut
    /// unless `force` is set. Queued bytes arm write interest and are
    /// acknowledged through `callback` in submission order.
    pub fn send(
        &self,
        data: &[u8],
        address: Option<SocketAddr>,
        delay: bool,
        force: bool,
        callback: Option<SendCallback>,
    ) -> Result<usize, Fail> {
        let mut effects = Effects::default();
        let enqueued = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ConnState::Closed || inner.closing {
                return Err(Fail::ConnectionClosed {});
            }

            let mut offset = 0;
            let immediate = !delay
                && address.is_none()
                && inner.tls.is_none()
                && inner.state == ConnState::Open
                && inner.send_queue.is_empty()
                && (force || !inner.exhausted);
            if immediate {
                offset = Self::write_now(&mut inner, data, &mut effects);
            }

            if effects.close.is_some() {
                0
            } else if offset == data.len() {
                if let Some(callback) = callback {
                    effects.callbacks.push((callback, Ok(())));
                }
                0
            } else {
                let remainder = data.len() - offset;
                inner.send_queue.push_back(SendItem {
                    data: Bytes::copy_from_slice(&data[offset..]),
                    offset: 0,
                    address,
                    callback,
                });
                inner.pending_s += remainder;
                if inner.pending_s >= inner.max_pending && !inner.exhausted {
                    inner.exhausted = true;
                    effects.exhausted = true;
                }
                Self::update_interest(&mut inner);
                remainder
            }
        };
        self.apply(effects);
        Ok(enqueued)
    }

    /// Enqueues one datagram towards the given address.
    pub fn send_to(
        &self,
        data: &[u8],
        address: SocketAddr,
        callback: Option<SendCallback>,
    ) -> Result<usize, Fail> {
        self.send(data, Some(address), true, false, callback)
    }

    /// Reads at most `size` bytes directly off the socket. Returns `None`
    /// when the socket has nothing available. Data normally arrives through
    /// the `Data` event instead.
    pub fn recv(&self, size: usize) -> Result<Option<Bytes>, Fail> {
        let mut inner = self.inner.borrow_mut();
        let sock = match &mut inner.sock {
            Some(Sock::Stream(sock)) => sock,
            Some(Sock::Datagram(_)) => {
                return Err(Fail::Unsupported {
                    details: "use the data event for datagrams",
                })
            }
            None => return Err(Fail::ConnectionClosed {}),
        };
        let mut buf = vec![0u8; size];
        loop {
            match sock.read(&mut buf) {
                Ok(count) => {
                    buf.truncate(count);
                    return Ok(Some(Bytes::from(buf)));
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Closes the target connection: graceful when the send queue still
    /// holds bytes (they are flushed first), immediate otherwise.
    /// Idempotent.
    pub fn close(&self) {
        let graceful = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ConnState::Closed || inner.closing {
                return;
            }
            // Bytes queued behind an in-flight connect are still flushed:
            // the promotion to open drains the queue before the teardown.
            let flushable = matches!(inner.state, ConnState::Connecting | ConnState::Open);
            if flushable && !inner.send_queue.is_empty() {
                inner.closing = true;
                Self::update_interest(&mut inner);
                true
            } else {
                false
            }
        };
        if !graceful {
            self.finish_close(None);
        }
    }

    /// Closes the target connection immediately, dropping queued bytes.
    pub fn abort(&self) {
        self.finish_close(None);
    }

    /// Promotes an open plaintext connection to TLS in place. The `Upgrade`
    /// event fires once the handshake completes.
    pub fn upgrade(&self, tls: TlsSession) -> Result<(), Fail> {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != ConnState::Open {
                return Err(Fail::Invalid {
                    details: "only open connections can be upgraded",
                });
            }
            if inner.tls.is_some() {
                return Err(Fail::Invalid {
                    details: "connection already upgraded",
                });
            }
            inner.tls = Some(tls);
            inner.state = ConnState::Connecting;
            inner.upgraded = true;
            Self::update_interest(&mut inner);
        }
        // Kick the handshake: the client side has records to push already.
        self.on_writable();
        Ok(())
    }

    /// Returns the token of the underlying registration.
    pub(crate) fn token(&self) -> Token {
        self.inner.borrow().token
    }

    /// Emits the `Connect` event for a connection that came up open on
    /// creation (plain accepted sockets have no handshake to wait for).
    pub(crate) fn announce(&self) {
        if self.is_open() {
            self.observer.trigger(&ConnEvent::Connect(self.clone()));
        }
    }

    /// Handles read readiness.
    pub(crate) fn on_readable(&self) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match inner.state {
                ConnState::Closed | ConnState::Pending => return,
                _ => (),
            }
            let datagram = match &inner.sock {
                Some(Sock::Datagram(_)) => true,
                Some(Sock::Stream(_)) => false,
                None => return,
            };
            if datagram {
                Self::read_datagram(inner, &mut effects);
            } else if inner.tls.is_some() {
                Self::read_tls(inner, &mut effects);
            } else {
                Self::read_stream(inner, &mut effects);
            }
        }
        self.apply(effects);
    }

    /// Handles write readiness: completes an in-flight connect, drives a
    /// pending handshake, then flushes the send queue.
    pub(crate) fn on_writable(&self) {
        let mut effects = Effects::default();
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            match inner.state {
                ConnState::Closed | ConnState::Pending => return,
                ConnState::Connecting => {
                    let mut fatal: Option<Fail> = None;
                    if let Some(Sock::Stream(sock)) = &mut inner.sock {
                        match sock.take_error() {
                            Ok(Some(error)) => fatal = Some(error.into()),
                            Err(error) => fatal = Some(error.into()),
                            Ok(None) => (),
                        }
                    }
                    if let Some(error) = fatal {
                        effects.close = Some(Some(error));
                        Self::teardown(inner, &mut effects);
                    } else if inner.tls.is_some() {
                        Self::pump_tls(inner, &mut effects);
                    } else {
                        Self::promote(inner, &mut effects);
                    }
                }
                ConnState::Open => Self::flush(inner, &mut effects),
            }
        }
        self.apply(effects);
    }

    /// Handles an error report from the poller.
    pub(crate) fn on_error(&self) {
        let error = {
            let mut inner = self.inner.borrow_mut();
            if inner.state == ConnState::Closed {
                return;
            }
            match &mut inner.sock {
                Some(Sock::Stream(sock)) => match sock.take_error() {
                    Ok(Some(error)) => error.into(),
                    _ => Fail::ConnectionReset {},
                },
                _ => Fail::ConnectionReset {},
            }
        };
        self.finish_close(Some(error));
    }

    /// Assembles a connection around an already registered socket.
    fn build(
        engine: EngineHandle,
        token: Token,
        sock: Sock,
        state: ConnState,
        tls: Option<TlsSession>,
        owner: Option<Weak<dyn ConnOwner>>,
    ) -> Self {
        let inner = Inner {
            token,
            sock: Some(sock),
            state,
            send_queue: VecDeque::new(),
            pending_s: 0,
            min_pending: MIN_PENDING_DEFAULT,
            max_pending: MAX_PENDING_DEFAULT,
            exhausted: false,
            closing: false,
            upgraded: false,
            write_interest: false,
            tls,
            engine,
            owner,
        };
        Self {
            inner: Rc::new(RefCell::new(inner)),
            observer: Observer::new(),
        }
    }

    /// Attempts one immediate write of `data`, returning how many bytes the
    /// socket took.
    fn write_now(inner: &mut Inner, data: &[u8], effects: &mut Effects) -> usize {
        let mut offset = 0;
        let mut fatal: Option<Fail> = None;
        {
            let sock = match &mut inner.sock {
                Some(Sock::Stream(sock)) => sock,
                _ => return 0,
            };
            while offset < data.len() {
                match sock.write(&data[offset..]) {
                    Ok(count) => offset += count,
                    Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => {
                        fatal = Some(error.into());
                        break;
                    }
                }
            }
        }
        if let Some(error) = fatal {
            effects.close = Some(Some(error));
            Self::teardown(inner, effects);
        }
        offset
    }

    /// Drains a readable plaintext stream.
    fn read_stream(inner: &mut Inner, effects: &mut Effects) {
        let mut data: Vec<u8> = Vec::new();
        let mut eof = false;
        let mut fatal: Option<Fail> = None;
        {
            let sock = match &mut inner.sock {
                Some(Sock::Stream(sock)) => sock,
                _ => return,
            };
            let mut chunk = [0u8; RECV_CHUNK];
            loop {
                match sock.read(&mut chunk) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(count) => data.extend_from_slice(&chunk[..count]),
                    Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    Err(error) => {
                        fatal = Some(error.into());
                        break;
                    }
                }
            }
        }
        if !data.is_empty() {
            effects.data.push((Bytes::from(data), None));
        }
        if let Some(error) = fatal {
            effects.close = Some(Some(error));
            Self::teardown(inner, effects);
        } else if eof {
            effects.close = Some(None);
            Self::teardown(inner, effects);
        }
    }

    /// Drains a readable TLS stream through the record layer.
    fn read_tls(inner: &mut Inner, effects: &mut Effects) {
        let handshaking = match &inner.tls {
            Some(tls) => tls.is_handshaking(),
            None => return,
        };
        let mut plain: Vec<u8> = Vec::new();
        let mut outcome = TlsRead::Open;
        let mut fatal: Option<Fail> = None;
        {
            let (tls, sock) = match (&mut inner.tls, &mut inner.sock) {
                (Some(tls), Some(Sock::Stream(sock))) => (tls, sock),
                _ => return,
            };
            match tls.read_records(sock, &mut plain) {
                Ok(read) => {
                    outcome = read;
                    // Answer handshake records right away.
                    if let Err(error) = tls.write_records(sock) {
                        fatal = Some(error);
                    }
                }
                Err(error) => fatal = Some(error),
            }
        }
        if let Some(error) = fatal {
            effects.close = Some(Some(error));
            Self::teardown(inner, effects);
            return;
        }
        if handshaking {
            let done = inner
                .tls
                .as_ref()
                .map(|tls| !tls.is_handshaking())
                .unwrap_or(false);
            if done && inner.state == ConnState::Connecting {
                Self::promote(inner, effects);
            }
        }
        if !plain.is_empty() {
            effects.data.push((Bytes::from(plain), None));
        }
        if outcome == TlsRead::Eof {
            effects.close = Some(None);
            Self::teardown(inner, effects);
            return;
        }
        Self::update_interest(inner);
    }

    /// Drains a readable datagram socket, one event per datagram.
    fn read_datagram(inner: &mut Inner, effects: &mut Effects) {
        let mut fatal: Option<Fail> = None;
        {
            let sock = match &mut inner.sock {
                Some(Sock::Datagram(sock)) => sock,
                _ => return,
            };
            let mut chunk = [0u8; DATAGRAM_CHUNK];
            loop {
                match sock.recv_from(&mut chunk) {
                    Ok((count, from)) => effects
                        .data
                        .push((Bytes::copy_from_slice(&chunk[..count]), Some(from))),
                    Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                    Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                    // Asynchronous errors (ICMP rejections) do not
                    // invalidate an unconnected socket.
                    Err(ref error) if error.kind() == io::ErrorKind::ConnectionRefused => {
                        continue
                    }
                    Err(error) => {
                        fatal = Some(error.into());
                        break;
                    }
                }
            }
        }
        if let Some(error) = fatal {
            effects.close = Some(Some(error));
            Self::teardown(inner, effects);
        }
    }

    /// Drives a pending TLS handshake from write readiness.
    fn pump_tls(inner: &mut Inner, effects: &mut Effects) {
        let mut fatal: Option<Fail> = None;
        {
            let (tls, sock) = match (&mut inner.tls, &mut inner.sock) {
                (Some(tls), Some(Sock::Stream(sock))) => (tls, sock),
                _ => return,
            };
            if let Err(error) = tls.write_records(sock) {
                fatal = Some(error);
            }
        }
        if let Some(error) = fatal {
            effects.close = Some(Some(error));
            Self::teardown(inner, effects);
            return;
        }
        let done = inner
            .tls
            .as_ref()
            .map(|tls| !tls.is_handshaking())
            .unwrap_or(false);
        if done {
            Self::promote(inner, effects);
        } else {
            Self::update_interest(inner);
        }
    }

    /// Marks the connection open and flushes anything queued meanwhile.
    fn promote(inner: &mut Inner, effects: &mut Effects) {
        inner.state = ConnState::Open;
        if inner.upgraded {
            effects.upgraded = true;
        } else {
            effects.connected = true;
        }
        Self::flush(inner, effects);
    }

    /// Flushes the send queue head-first, acknowledging completed entries in
    /// submission order and applying the restored side of the hysteresis.
    fn flush(inner: &mut Inner, effects: &mut Effects) {
        loop {
            // The payload handle is cloned out so no queue borrow spans the
            // socket I/O below.
            let (data, offset, address) = match inner.send_queue.front() {
                Some(item) => (item.data.clone(), item.offset, item.address),
                None => break,
            };
            let remaining = data.len() - offset;

            let mut wrote: usize = 0;
            let mut blocked = false;
            let mut dropped: Option<Fail> = None;
            let mut fatal: Option<Fail> = None;

            match (&mut inner.sock, &mut inner.tls) {
                (Some(Sock::Stream(sock)), None) => loop {
                    match sock.write(&data[offset..]) {
                        Ok(count) => {
                            wrote = count;
                            break;
                        }
                        Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {
                            blocked = true;
                            break;
                        }
                        Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                        Err(error) => {
                            fatal = Some(error.into());
                            break;
                        }
                    }
                },
                (Some(Sock::Stream(sock)), Some(tls)) => {
                    match tls.write_plain(&data[offset..]) {
                        Ok(count) => wrote = count,
                        Err(error) => fatal = Some(error),
                    }
                    if fatal.is_none() {
                        if let Err(error) = tls.write_records(sock) {
                            fatal = Some(error);
                        }
                    }
                    if fatal.is_none() && wrote == 0 {
                        // Record layer is full until the socket drains.
                        blocked = true;
                    }
                }
                (Some(Sock::Datagram(sock)), _) => match address {
                    None => {
                        dropped = Some(Fail::Invalid {
                            details: "datagram without destination",
                        })
                    }
                    Some(address) => loop {
                        match sock.send_to(&data[offset..], address) {
                            Ok(_) => {
                                wrote = remaining;
                                break;
                            }
                            Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => {
                                blocked = true;
                                break;
                            }
                            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => {
                                continue
                            }
                            // The datagram is dropped, the socket survives.
                            Err(error) => {
                                dropped = Some(error.into());
                                break;
                            }
                        }
                    },
                },
                (None, _) => return,
            }

            if let Some(error) = fatal {
                effects.close = Some(Some(error));
                Self::teardown(inner, effects);
                return;
            }
            if let Some(error) = dropped {
                if let Some(item) = inner.send_queue.pop_front() {
                    inner.pending_s -= remaining;
                    if let Some(callback) = item.callback {
                        effects.callbacks.push((callback, Err(error)));
                    }
                }
                continue;
            }
            if blocked {
                break;
            }

            inner.pending_s -= wrote;
            let complete = match inner.send_queue.front_mut() {
                Some(item) => {
                    item.offset += wrote;
                    item.offset == item.data.len()
                }
                None => false,
            };
            if complete {
                if let Some(item) = inner.send_queue.pop_front() {
                    if let Some(callback) = item.callback {
                        effects.callbacks.push((callback, Ok(())));
                    }
                }
            } else if wrote == 0 {
                break;
            }
        }
        if inner.exhausted && inner.pending_s <= inner.min_pending {
            inner.exhausted = false;
            effects.restored = true;
        }
        if inner.closing && inner.send_queue.is_empty() {
            effects.close = Some(None);
            Self::teardown(inner, effects);
            return;
        }
        Self::update_interest(inner);
    }

    /// Releases the socket and cancels queued acknowledgements. The `Close`
    /// event itself is emitted by [Connection::apply], exactly once.
    fn teardown(inner: &mut Inner, effects: &mut Effects) {
        if inner.state == ConnState::Closed {
            effects.close = None;
            return;
        }
        inner.state = ConnState::Closed;
        inner.closing = false;
        if let Some(mut sock) = inner.sock.take() {
            let registry = inner.engine.registry();
            let outcome = match &mut sock {
                Sock::Stream(sock) => registry.deregister(sock),
                Sock::Datagram(sock) => registry.deregister(sock),
            };
            if let Err(error) = outcome {
                trace!("deregister on close failed ({:?})", error);
            }
        }
        let error = effects
            .close
            .clone()
            .flatten()
            .unwrap_or(Fail::ConnectionClosed {});
        while let Some(item) = inner.send_queue.pop_front() {
            if let Some(callback) = item.callback {
                effects.callbacks.push((callback, Err(error.clone())));
            }
        }
        inner.pending_s = 0;
        inner.engine.remove_connection(inner.token);
    }

    /// Recomputes the interest mask and reregisters when it changed.
    fn update_interest(inner: &mut Inner) {
        let mut write = !inner.send_queue.is_empty() || inner.closing;
        if inner.state == ConnState::Connecting {
            write = true;
        }
        if let Some(tls) = &inner.tls {
            write = write || tls.wants_write();
        }
        if write == inner.write_interest {
            return;
        }
        let token = inner.token;
        let interest = if write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let registry = inner.engine.registry();
        let outcome = match &mut inner.sock {
            Some(Sock::Stream(sock)) => registry.reregister(sock, token, interest),
            Some(Sock::Datagram(sock)) => registry.reregister(sock, token, interest),
            None => return,
        };
        match outcome {
            Ok(()) => inner.write_interest = write,
            Err(error) => warn!("interest update failed ({:?})", error),
        }
    }

    /// Applies deferred side effects: acknowledgements are scheduled on the
    /// loop, events fire with no state borrow held.
    fn apply(&self, effects: Effects) {
        let engine = self.inner.borrow().engine.clone();
        for (callback, outcome) in effects.callbacks {
            engine.delay(move || callback(outcome));
        }
        if effects.connected {
            self.observer.trigger(&ConnEvent::Connect(self.clone()));
        }
        if effects.upgraded {
            self.observer.trigger(&ConnEvent::Upgrade(self.clone()));
        }
        for (data, from) in effects.data {
            self.observer.trigger(&ConnEvent::Data {
                conn: self.clone(),
                data,
                from,
            });
        }
        if effects.exhausted {
            self.observer.trigger(&ConnEvent::Exhausted(self.clone()));
        }
        if effects.restored {
            self.observer.trigger(&ConnEvent::Restored(self.clone()));
        }
        if let Some(error) = effects.close {
            self.notify_owner();
            self.observer.trigger(&ConnEvent::Close {
                conn: self.clone(),
                error,
            });
        }
    }

    /// Closes immediately with the given error.
    fn finish_close(&self, error: Option<Fail>) {
        let mut effects = Effects::default();
        effects.close = Some(error);
        {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if inner.state == ConnState::Closed {
                return;
            }
            Self::teardown(inner, &mut effects);
        }
        self.apply(effects);
    }

    /// Tells the owner, if still alive, that this connection is gone.
    fn notify_owner(&self) {
        let (owner, token) = {
            let inner = self.inner.borrow();
            (inner.owner.clone(), inner.token)
        };
        if let Some(owner) = owner.and_then(|weak| weak.upgrade()) {
            owner.connection_closed(token);
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Clone trait implementation for [Connection].
impl Clone for Connection {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            observer: self.observer.clone(),
        }
    }
}

/// Event trait implementation for [ConnEvent].
impl Event for ConnEvent {
    type Kind = ConnEventKind;

    fn kind(&self) -> ConnEventKind {
        match self {
            ConnEvent::Connect(..) => ConnEventKind::Connect,
            ConnEvent::Data { .. } => ConnEventKind::Data,
            ConnEvent::Close { .. } => ConnEventKind::Close,
            ConnEvent::Exhausted(..) => ConnEventKind::Exhausted,
            ConnEvent::Restored(..) => ConnEventKind::Restored,
            ConnEvent::Upgrade(..) => ConnEventKind::Upgrade,
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::{ConnEvent, ConnEventKind, Connection};
    use crate::engine::Engine;
    use mio::net::UdpSocket;
    use std::{cell::RefCell, rc::Rc, time::Duration, time::Instant};

    fn bound_pair(engine: &mut Engine) -> (Connection, std::net::SocketAddr) {
        let sock = UdpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = sock.local_addr().unwrap();
        let conn = Connection::datagram(engine.handle(), sock, None).unwrap();
        (conn, addr)
    }

    /// Tests the hysteresis: one `Exhausted` on the upward crossing, one
    /// `Restored` after the drain, regardless of how many sends happened.
    #[test]
    fn conn_watermark_hysteresis() {
        let mut engine = Engine::new().unwrap();
        let (conn, addr) = bound_pair(&mut engine);
        conn.set_watermarks(16, 64);

        let exhausted: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
        let restored: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
        let exhausted_ = exhausted.clone();
        conn.bind(ConnEventKind::Exhausted, move |_| {
            *exhausted_.borrow_mut() += 1
        });
        let restored_ = restored.clone();
        conn.bind(ConnEventKind::Restored, move |_| {
            *restored_.borrow_mut() += 1
        });

        // Four delayed sends of 32 bytes: the queue crosses 64 on the
        // second one and only then.
        for _ in 0..4 {
            conn.send(&[0u8; 32], Some(addr), true, false, None).unwrap();
        }
        assert_eq!(*exhausted.borrow(), 1);
        assert_eq!(conn.pending_bytes(), 128);
        assert!(conn.is_exhausted());

        // Draining the queue crosses the low watermark downward once.
        let start = Instant::now();
        while conn.pending_bytes() > 0 && start.elapsed() < Duration::from_secs(2) {
            engine.tick().unwrap();
        }
        assert_eq!(*exhausted.borrow(), 1);
        assert_eq!(*restored.borrow(), 1);
        assert!(conn.is_restored());
    }

    /// Tests if closing N times emits exactly one `Close` event.
    #[test]
    fn conn_close_idempotent() {
        let mut engine = Engine::new().unwrap();
        let (conn, _) = bound_pair(&mut engine);

        let closes: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
        let closes_ = closes.clone();
        conn.bind(ConnEventKind::Close, move |_| *closes_.borrow_mut() += 1);

        // Events fire synchronously on the closing call itself.
        conn.close();
        conn.close();
        conn.abort();

        assert_eq!(*closes.borrow(), 1);
        assert!(conn.is_closed());
    }

    /// Tests if sending on a closed connection fails synchronously.
    #[test]
    fn conn_send_after_close() {
        let mut engine = Engine::new().unwrap();
        let (conn, addr) = bound_pair(&mut engine);

        conn.close();
        assert!(conn.send(b"x", Some(addr), true, false, None).is_err());
    }

    /// Tests if queued acknowledgements are cancelled with an error on an
    /// immediate close.
    #[test]
    fn conn_close_cancels_callbacks() {
        let mut engine = Engine::new().unwrap();
        let (conn, addr) = bound_pair(&mut engine);

        let outcome: Rc<RefCell<Option<bool>>> = Rc::new(RefCell::new(None));
        let outcome_ = outcome.clone();
        conn.send(
            b"payload",
            Some(addr),
            true,
            false,
            Some(Box::new(move |result| {
                *outcome_.borrow_mut() = Some(result.is_ok())
            })),
        )
        .unwrap();

        conn.abort();
        engine.tick().unwrap();

        assert_eq!(*outcome.borrow(), Some(false));
        assert_eq!(conn.pending_bytes(), 0);
    }

    /// Tests if a queued datagram reaches the wire and the ack fires.
    #[test]
    fn conn_datagram_roundtrip() {
        let mut engine = Engine::new().unwrap();
        let (sender, _) = bound_pair(&mut engine);
        let (receiver, receiver_addr) = bound_pair(&mut engine);

        let seen: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let seen_ = seen.clone();
        receiver.bind(ConnEventKind::Data, move |event| {
            if let ConnEvent::Data { data, .. } = event {
                seen_.borrow_mut().extend_from_slice(&data[..]);
            }
        });

        let acked: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
        let acked_ = acked.clone();
        sender
            .send_to(
                b"x",
                receiver_addr,
                Some(Box::new(move |result| {
                    *acked_.borrow_mut() = result.is_ok()
                })),
            )
            .unwrap();

        let start = Instant::now();
        while seen.borrow().is_empty() && start.elapsed() < Duration::from_secs(2) {
            engine.tick().unwrap();
        }
        assert_eq!(&seen.borrow()[..], b"x");
        assert!(*acked.borrow());
    }
}
