// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Single-threaded, readiness-driven network runtime: one engine per thread
//! multiplexes sockets, timers and tasks, connections carry buffered sends
//! under watermark flow control, and transports feed user protocols.

#[macro_use]
extern crate log;

pub mod asynchronous;
pub mod client;
pub mod compat;
pub mod conn;
pub mod engine;
pub mod fail;
pub mod observer;
pub mod poll;
pub mod protocol;
pub mod server;
pub mod timer;
pub mod tls;
pub mod transport;

pub use crate::{
    asynchronous::{first_of, timeout, FutureHandle, FutureStatus},
    client::Client,
    compat::{Handle, LoopCompat},
    conn::{ConnEvent, ConnEventKind, ConnState, Connection, SendCallback},
    engine::{current, Engine, EngineHandle, RemoteHandle},
    fail::Fail,
    protocol::{Protocol, ProtocolCore, ProtocolEvent, ProtocolEventKind},
    server::{DatagramEndpoint, ProtocolFactory, Server, ServerOptions},
    timer::TimerHandle,
    tls::{TlsContext, TlsSession},
    transport::{ExtraInfo, ProtocolRef, Transport, TransportMode},
};

/// Installs the human-readable logger, honoring the `LEVEL` environment
/// variable (defaults to `info`). The returned handle keeps the logger
/// flushing; hold on to it for the lifetime of the process.
pub fn init_logging() -> Result<flexi_logger::LoggerHandle, Fail> {
    let spec = std::env::var("LEVEL").unwrap_or_else(|_| "info".to_string());
    flexi_logger::Logger::try_with_str(&spec)
        .and_then(|logger| logger.start())
        .map_err(|_| Fail::Invalid {
            details: "invalid log level specification",
        })
}
