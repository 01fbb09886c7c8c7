// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::{
    conn::{ConnOwner, ConnState, Connection},
    engine::EngineHandle,
    fail::Fail,
    tls::{TlsContext, TlsSession},
};

use mio::{net::TcpStream, Token};
use rustls::ClientConfig;

use std::{
    cell::RefCell,
    net::{SocketAddr, ToSocketAddrs},
    rc::{Rc, Weak},
    sync::Arc,
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Client
///
/// Connector owner: resolves an endpoint, starts a non-blocking connect and
/// hands back the connection in its `connecting` state. Write readiness
/// completes the connect (and the TLS handshake when one is requested)
/// before the `Connect` event fires.

/// Client Data
struct Inner {
    engine: EngineHandle,
    tls: Option<Arc<ClientConfig>>,
    conns: Vec<Connection>,
}

/// Owner cell shared with the connections.
struct Core {
    inner: RefCell<Inner>,
}

/// Client
pub struct Client {
    core: Rc<Core>,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Client].
impl Client {
    /// Creates a plaintext client.
    pub fn new(engine: EngineHandle) -> Self {
        Self::build(engine, None)
    }

    /// Creates a client whose connections negotiate TLS against the anchors
    /// in the given PEM file.
    pub fn with_tls(engine: EngineHandle, ca_file: &str, alpn: &[&str]) -> Result<Self, Fail> {
        let config = TlsContext::client(ca_file, alpn)?;
        Ok(Self::build(engine, Some(config)))
    }

    /// Starts a non-blocking connect towards `host:port`. Resolution is
    /// synchronous; the connect itself completes on readiness.
    pub fn connect(&self, host: &str, port: u16) -> Result<Connection, Fail> {
        let addr = Self::resolve(host, port)?;
        let (engine, tls) = {
            let inner = self.core.inner.borrow();
            let tls = match &inner.tls {
                Some(config) => Some(TlsSession::client(config.clone(), host)?),
                None => None,
            };
            (inner.engine.clone(), tls)
        };
        let stream = TcpStream::connect(addr)?;
        let core_dyn: Rc<dyn ConnOwner> = self.core.clone();
        let owner: Weak<dyn ConnOwner> = Rc::downgrade(&core_dyn);
        let conn = Connection::stream(engine, stream, ConnState::Connecting, tls, Some(owner))?;
        self.core.inner.borrow_mut().conns.push(conn.clone());
        debug!("connecting to {}", addr);
        Ok(conn)
    }

    /// Returns the number of live connections owned by the client.
    pub fn connections(&self) -> usize {
        self.core.inner.borrow().conns.len()
    }

    /// Closes every owned connection.
    pub fn close(&self) {
        let conns = std::mem::take(&mut self.core.inner.borrow_mut().conns);
        for conn in conns {
            conn.close();
        }
    }

    /// Assembles a client around an optional TLS configuration.
    fn build(engine: EngineHandle, tls: Option<Arc<ClientConfig>>) -> Self {
        let inner = Inner {
            engine,
            tls,
            conns: Vec::new(),
        };
        Self {
            core: Rc::new(Core {
                inner: RefCell::new(inner),
            }),
        }
    }

    /// Resolves `host:port` to the first reported address.
    fn resolve(host: &str, port: u16) -> Result<SocketAddr, Fail> {
        (host, port)
            .to_socket_addrs()?
            .next()
            .ok_or(Fail::ResolveFailed {
                details: format!("{}:{}", host, port),
            })
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Clone trait implementation for [Client].
impl Clone for Client {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

/// ConnOwner trait implementation for the client core.
impl ConnOwner for Core {
    /// Drops a closed connection from the roster.
    fn connection_closed(&self, token: Token) {
        if let Ok(mut inner) = self.inner.try_borrow_mut() {
            inner.conns.retain(|conn| conn.token() != token);
        }
    }
}
