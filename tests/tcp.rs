// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use catloop::{
    Client, ConnEventKind, Engine, Fail, LoopCompat, Protocol, ProtocolCore, ProtocolRef,
    Server, ServerOptions, Transport,
};

use std::{
    cell::RefCell,
    rc::Rc,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

//==============================================================================
// Helpers
//==============================================================================

const DEADLINE: Duration = Duration::from_secs(5);

/// Server side protocol writing every received byte back.
struct EchoProtocol {
    core: ProtocolCore,
}

impl EchoProtocol {
    fn factory() -> ProtocolRef {
        Rc::new(RefCell::new(EchoProtocol {
            core: ProtocolCore::new(),
        }))
    }
}

impl Protocol for EchoProtocol {
    fn connection_made(&mut self, transport: &Transport) {
        self.core.connection_made(transport);
    }

    fn data_received(&mut self, data: &[u8]) {
        self.core.send(data, None).unwrap();
    }

    fn connection_lost(&mut self, error: Option<Fail>) {
        self.core.connection_lost(error);
    }
}

/// Client side protocol recording whatever arrives.
struct Probe {
    core: ProtocolCore,
    received: Rc<RefCell<Vec<u8>>>,
    data_events: Rc<RefCell<u32>>,
    lost: Rc<RefCell<u32>>,
}

impl Probe {
    #[allow(clippy::type_complexity)]
    fn new() -> (
        ProtocolRef,
        Rc<RefCell<Vec<u8>>>,
        Rc<RefCell<u32>>,
        Rc<RefCell<u32>>,
    ) {
        let received = Rc::new(RefCell::new(Vec::new()));
        let data_events = Rc::new(RefCell::new(0));
        let lost = Rc::new(RefCell::new(0));
        let probe: ProtocolRef = Rc::new(RefCell::new(Probe {
            core: ProtocolCore::new(),
            received: received.clone(),
            data_events: data_events.clone(),
            lost: lost.clone(),
        }));
        (probe, received, data_events, lost)
    }
}

impl Protocol for Probe {
    fn connection_made(&mut self, transport: &Transport) {
        self.core.connection_made(transport);
    }

    fn data_received(&mut self, data: &[u8]) {
        self.received.borrow_mut().extend_from_slice(data);
        *self.data_events.borrow_mut() += 1;
    }

    fn connection_lost(&mut self, error: Option<Fail>) {
        *self.lost.borrow_mut() += 1;
        self.core.connection_lost(error);
    }
}

/// Ticks the engine until the predicate holds or the deadline passes. A
/// short heartbeat timer per iteration keeps every poll bounded.
fn tick_until(engine: &mut Engine, mut predicate: impl FnMut() -> bool) {
    let handle = engine.handle();
    let start = Instant::now();
    while !predicate() && start.elapsed() < DEADLINE {
        handle.delay_for(Duration::from_millis(20), || ());
        engine.tick().unwrap();
    }
}

//==============================================================================
// Echo
//==============================================================================

/// Tests if bytes sent over a connection come back intact through the echo
/// server, with the connection surviving the exchange.
#[test]
fn tcp_echo_roundtrip() {
    let mut engine = Engine::new().unwrap();
    let handle = engine.handle();

    let server = Server::serve(
        handle.clone(),
        &ServerOptions::new("127.0.0.1", 0),
        EchoProtocol::factory,
    )
    .unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new(handle.clone());
    let conn = client.connect("127.0.0.1", port).unwrap();
    let transport = Transport::stream(handle, conn.clone());
    let (probe, received, data_events, _) = Probe::new();
    transport.set_compat(probe);

    // Queued while connecting, flushed once the connect completes.
    transport.write(b"ping").unwrap();

    tick_until(&mut engine, || received.borrow().len() >= 4);

    assert_eq!(&received.borrow()[..], b"ping");
    assert_eq!(*data_events.borrow(), 1);
    assert!(conn.is_open());
    assert_eq!(server.connections(), 1);
}

/// Tests if chunked writes arrive in order regardless of coalescing.
#[test]
fn tcp_echo_ordering() {
    let mut engine = Engine::new().unwrap();
    let handle = engine.handle();

    let server = Server::serve(
        handle.clone(),
        &ServerOptions::new("127.0.0.1", 0),
        EchoProtocol::factory,
    )
    .unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new(handle.clone());
    let conn = client.connect("127.0.0.1", port).unwrap();
    let transport = Transport::stream(handle, conn);
    let (probe, received, _, _) = Probe::new();
    transport.set_compat(probe);

    for chunk in &[&b"he"[..], &b"llo "[..], &b"world"[..]] {
        transport.write(chunk).unwrap();
    }

    tick_until(&mut engine, || received.borrow().len() >= 11);
    assert_eq!(&received.borrow()[..], b"hello world");
}

//==============================================================================
// Close
//==============================================================================

/// Tests if a graceful close flushes queued bytes before the FIN, and if
/// the peer observes exactly one lost connection.
#[test]
fn tcp_close_flushes() {
    let mut engine = Engine::new().unwrap();
    let handle = engine.handle();

    let (server_probe, received, _, lost) = Probe::new();
    let server = Server::serve(
        handle.clone(),
        &ServerOptions::new("127.0.0.1", 0),
        move || server_probe.clone(),
    )
    .unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new(handle.clone());
    let conn = client.connect("127.0.0.1", port).unwrap();
    let transport = Transport::stream(handle, conn.clone());
    let (probe, _, _, _) = Probe::new();
    transport.set_compat(probe);

    let closes: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    let closes_ = closes.clone();
    conn.bind(ConnEventKind::Close, move |_| *closes_.borrow_mut() += 1);

    transport.write(b"parting words").unwrap();
    transport.close();

    tick_until(&mut engine, || *lost.borrow() > 0);

    assert_eq!(&received.borrow()[..], b"parting words");
    assert_eq!(*lost.borrow(), 1);
    assert_eq!(*closes.borrow(), 1);
    assert!(conn.is_closed());
}

//==============================================================================
// Compat
//==============================================================================

/// Tests if the compat connection factory resolves with a working
/// transport/protocol pair.
#[test]
fn tcp_create_connection_compat() {
    let mut compat = LoopCompat::new().unwrap();

    let server = Server::serve(
        compat.handle(),
        &ServerOptions::new("127.0.0.1", 0),
        EchoProtocol::factory,
    )
    .unwrap();
    let port = server.local_addr().unwrap().port();

    let (probe, received, _, _) = Probe::new();
    let probe_ = probe.clone();
    let future = compat.create_connection(move || probe_, "127.0.0.1", port);
    let (transport, _protocol) = compat.run_until_complete(future).unwrap();

    transport.write(b"ping").unwrap();
    {
        let handle = compat.handle();
        let engine = compat.engine_mut();
        let start = Instant::now();
        while received.borrow().len() < 4 && start.elapsed() < DEADLINE {
            handle.delay_for(Duration::from_millis(20), || ());
            engine.tick().unwrap();
        }
    }
    assert_eq!(&received.borrow()[..], b"ping");
}

/// Tests if a connect towards a dead port surfaces as an exception on the
/// compat future rather than a panic or a hang.
#[test]
fn tcp_create_connection_refused() {
    let mut compat = LoopCompat::new().unwrap();

    // Bind-then-drop to find a port with no listener behind it.
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };

    let (probe, _, _, _) = Probe::new();
    let future = compat.create_connection(move || probe, "127.0.0.1", port);
    assert!(compat.run_until_complete(future).is_err());
}

//==============================================================================
// Threading
//==============================================================================

/// Tests if a foreign thread can schedule work on a loop blocked in its
/// readiness wait.
#[test]
fn tcp_threadsafe_wakeup() {
    let mut engine = Engine::new().unwrap();
    let handle = engine.handle();
    let remote = handle.remote();

    let fired = Arc::new(AtomicBool::new(false));
    let fired_ = fired.clone();
    let pusher = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        let fired__ = fired_.clone();
        remote
            .run(move || fired__.store(true, Ordering::SeqCst))
            .unwrap();
    });

    // No timers and no ready work: every iteration parks in the poller
    // until the remote wake arrives.
    let start = Instant::now();
    while !fired.load(Ordering::SeqCst) && start.elapsed() < DEADLINE {
        engine.tick().unwrap();
    }

    pusher.join().unwrap();
    assert!(fired.load(Ordering::SeqCst));
}

//==============================================================================
// Events
//==============================================================================

/// Tests if an event bound to a connection can be unbound again.
#[test]
fn tcp_bind_unbind() {
    let mut engine = Engine::new().unwrap();
    let handle = engine.handle();

    let server = Server::serve(
        handle.clone(),
        &ServerOptions::new("127.0.0.1", 0),
        EchoProtocol::factory,
    )
    .unwrap();
    let port = server.local_addr().unwrap().port();

    let client = Client::new(handle.clone());
    let conn = client.connect("127.0.0.1", port).unwrap();

    let connects: Rc<RefCell<u32>> = Rc::new(RefCell::new(0));
    let connects_ = connects.clone();
    let id = conn.bind(ConnEventKind::Connect, move |_| {
        *connects_.borrow_mut() += 1
    });
    assert!(conn.unbind(ConnEventKind::Connect, id));

    tick_until(&mut engine, || conn.is_open());
    assert!(conn.is_open());
    assert_eq!(*connects.borrow(), 0);
}
