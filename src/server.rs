// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    conn::{ConnOwner, ConnState, Connection},
    engine::EngineHandle,
    fail::Fail,
    tls::{TlsContext, TlsSession},
    transport::{ProtocolRef, Transport},
};

use mio::{
    net::{TcpListener, UdpSocket},
    Interest, Token,
};
use rustls::ServerConfig;

use std::{
    cell::RefCell,
    env,
    io,
    net::{SocketAddr, ToSocketAddrs},
    rc::{Rc, Weak},
    sync::Arc,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Server
///
/// Listener owner: binds a stream socket, accepts peers on readiness and
/// wires each accepted connection to a fresh protocol through a stream
/// transport. The server only back-references its connections weakly; a
/// closing connection reports back so the roster stays accurate.

/// Default bind host when the environment does not name one.
const HOST_DEFAULT: &str = "0.0.0.0";

/// Builds one protocol instance per accepted connection.
pub type ProtocolFactory = Box<dyn FnMut() -> ProtocolRef>;

/// Bind options, optionally read from the environment.
#[derive(Clone, Debug)]
pub struct ServerOptions {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub key_file: Option<String>,
    pub cer_file: Option<String>,
    pub alpn: Vec<String>,
}

/// Server Data
struct Inner {
    listener: Option<TcpListener>,
    token: Option<Token>,
    engine: EngineHandle,
    factory: ProtocolFactory,
    tls: Option<Arc<ServerConfig>>,
    conns: Vec<Connection>,
}

/// Owner cell shared with the connections.
struct Core {
    inner: RefCell<Inner>,
}

/// Server
pub struct Server {
    core: Rc<Core>,
}

/// A bound datagram socket wired to a protocol: the datagram-side
/// equivalent of a served connection.
pub struct DatagramEndpoint {
    conn: Connection,
    transport: Transport,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [ServerOptions].
impl ServerOptions {
    /// Creates options for the given endpoint, TLS off.
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
            ssl: false,
            key_file: None,
            cer_file: None,
            alpn: Vec::new(),
        }
    }

    /// Reads options from the environment: `HOST`, `PORT`, `SSL`,
    /// `KEY_FILE` and `CER_FILE`. Missing variables keep their defaults.
    pub fn from_env() -> Self {
        let host = env::var("HOST").unwrap_or_else(|_| HOST_DEFAULT.to_string());
        let port = env::var("PORT")
            .ok()
            .and_then(|port| port.parse().ok())
            .unwrap_or(0);
        let ssl = env::var("SSL")
            .map(|ssl| ssl == "1" || ssl.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        Self {
            host,
            port,
            ssl,
            key_file: env::var("KEY_FILE").ok(),
            cer_file: env::var("CER_FILE").ok(),
            alpn: Vec::new(),
        }
    }

    /// Resolves the configured endpoint to a socket address.
    fn resolve(&self) -> Result<SocketAddr, Fail> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or(Fail::ResolveFailed {
                details: format!("{}:{}", self.host, self.port),
            })
    }

    /// Builds the TLS acceptor configuration when requested.
    fn tls_config(&self) -> Result<Option<Arc<ServerConfig>>, Fail> {
        if !self.ssl {
            return Ok(None);
        }
        let cer_file = self.cer_file.as_deref().ok_or(Fail::Invalid {
            details: "SSL requested without a certificate file",
        })?;
        let key_file = self.key_file.as_deref().ok_or(Fail::Invalid {
            details: "SSL requested without a key file",
        })?;
        let alpn: Vec<&str> = self.alpn.iter().map(|p| p.as_str()).collect();
        Ok(Some(TlsContext::server(cer_file, key_file, &alpn)?))
    }
}

/// Associate functions for [Server].
impl Server {
    /// Binds a listener and starts accepting connections, one protocol per
    /// peer.
    pub fn serve(
        engine: EngineHandle,
        options: &ServerOptions,
        factory: impl FnMut() -> ProtocolRef + 'static,
    ) -> Result<Self, Fail> {
        let addr = options.resolve()?;
        let tls = options.tls_config()?;
        let mut listener = TcpListener::bind(addr)?;
        let token = engine.alloc_token();
        engine
            .registry()
            .register(&mut listener, token, Interest::READABLE)?;

        let inner = Inner {
            listener: Some(listener),
            token: Some(token),
            engine: engine.clone(),
            factory: Box::new(factory),
            tls,
            conns: Vec::new(),
        };
        let server = Self {
            core: Rc::new(Core {
                inner: RefCell::new(inner),
            }),
        };

        let server_ = server.clone();
        engine.insert_acceptor(token, move || server_.accept());
        info!("serving on {}", server.local_addr()?);
        Ok(server)
    }

    /// Returns the bound address of the listener.
    pub fn local_addr(&self) -> Result<SocketAddr, Fail> {
        let inner = self.core.inner.borrow();
        match &inner.listener {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(Fail::ConnectionClosed {}),
        }
    }

    /// Returns the number of live connections owned by the server.
    pub fn connections(&self) -> usize {
        self.core.inner.borrow().conns.len()
    }

    /// Stops accepting and closes every owned connection. Idempotent.
    pub fn close(&self) {
        let (engine, token, listener, conns) = {
            let mut inner = self.core.inner.borrow_mut();
            (
                inner.engine.clone(),
                inner.token.take(),
                inner.listener.take(),
                std::mem::take(&mut inner.conns),
            )
        };
        if let (Some(token), Some(mut listener)) = (token, listener) {
            engine.remove_acceptor(token);
            if let Err(error) = engine.registry().deregister(&mut listener) {
                trace!("listener deregister failed ({:?})", error);
            }
        }
        for conn in conns {
            conn.close();
        }
    }

    /// Drains the accept queue of the listener.
    fn accept(&self) {
        loop {
            let accepted = {
                let inner = self.core.inner.borrow();
                match &inner.listener {
                    Some(listener) => listener.accept(),
                    None => return,
                }
            };
            match accepted {
                Ok((stream, addr)) => {
                    debug!("accepted connection from {}", addr);
                    if let Err(error) = self.adopt(stream) {
                        warn!("failed to adopt connection ({})", error);
                    }
                }
                Err(ref error) if error.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref error) if error.kind() == io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    warn!("accept failed ({:?})", error);
                    break;
                }
            }
        }
    }

    /// Wires one accepted socket: connection, transport, fresh protocol.
    fn adopt(&self, stream: mio::net::TcpStream) -> Result<(), Fail> {
        let (engine, tls, protocol) = {
            let mut inner = self.core.inner.borrow_mut();
            let tls = match &inner.tls {
                Some(config) => Some(TlsSession::server(config.clone())?),
                None => None,
            };
            (inner.engine.clone(), tls, (inner.factory)())
        };
        let state = if tls.is_some() {
            ConnState::Connecting
        } else {
            ConnState::Open
        };
        let core_dyn: Rc<dyn ConnOwner> = self.core.clone();
        let owner: Weak<dyn ConnOwner> = Rc::downgrade(&core_dyn);
        let conn = Connection::stream(engine.clone(), stream, state, tls, Some(owner))?;
        let transport = Transport::stream(engine, conn.clone());
        transport.set_compat(protocol);
        self.core.inner.borrow_mut().conns.push(conn.clone());
        conn.announce();
        Ok(())
    }
}

/// Associate functions for [DatagramEndpoint].
impl DatagramEndpoint {
    /// Binds a datagram socket and wires it to the given protocol.
    pub fn bind(
        engine: EngineHandle,
        options: &ServerOptions,
        protocol: ProtocolRef,
    ) -> Result<Self, Fail> {
        let addr = options.resolve()?;
        let sock = UdpSocket::bind(addr)?;
        let conn = Connection::datagram(engine.clone(), sock, None)?;
        let transport = Transport::datagram(engine, conn.clone());
        transport.set_compat(protocol);
        Ok(Self { conn, transport })
    }

    /// Returns the bound address of the socket.
    pub fn local_addr(&self) -> Result<SocketAddr, Fail> {
        self.conn.local_addr()
    }

    /// Returns the transport of the endpoint.
    pub fn transport(&self) -> Transport {
        self.transport.clone()
    }

    /// Returns the connection of the endpoint.
    pub fn conn(&self) -> Connection {
        self.conn.clone()
    }

    /// Closes the endpoint.
    pub fn close(&self) {
        self.conn.close();
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Clone trait implementation for [Server].
impl Clone for Server {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

/// ConnOwner trait implementation for the server core.
impl ConnOwner for Core {
    /// Drops a closed connection from the roster.
    fn connection_closed(&self, token: Token) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.conns.retain(|conn| conn.token() != token);
        }
    }
}
