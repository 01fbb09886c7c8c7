// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::fail::Fail;

use mio::{event::Source, Events, Interest, Registry, Token, Waker};

use std::{env, io, time::Duration};

//==============================================================================
// Constants & Structures
//==============================================================================

/// # Poller
///
/// Wrapper over the OS readiness multiplexer. Registration is edge-capable
/// underneath but consumed level-triggered by the loop: a readiness report is
/// a hint, spurious wakeups are tolerated and every I/O site retries until
/// the OS reports would-block.

/// Default capacity for the readiness event buffer.
const EVENTS_CAPACITY: usize = 1024;

/// Environment variable naming the preferred readiness mechanism.
const POLL_ENV: &str = "POLL";

/// Readiness report for a single registered source.
#[derive(Clone, Copy, Debug)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

/// Poller
pub struct Poller {
    poll: mio::Poll,
    events: Events,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Poller].
impl Poller {
    /// Creates a poller over the best available OS mechanism.
    pub fn new() -> Result<Self, Fail> {
        // The preferred mechanism may be requested through the environment,
        // but the selector bundled for this platform is the only backend.
        if let Ok(name) = env::var(POLL_ENV) {
            if !name.is_empty() && name != Self::selector_name() {
                warn!(
                    "poller '{}' not available, using '{}'",
                    name,
                    Self::selector_name()
                );
            }
        }
        let poll = mio::Poll::new()?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
        })
    }

    /// Returns the name of the selector backing this platform.
    pub fn selector_name() -> &'static str {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            "epoll"
        } else if cfg!(any(
            target_os = "macos",
            target_os = "freebsd",
            target_os = "netbsd",
            target_os = "openbsd"
        )) {
            "kqueue"
        } else {
            "poll"
        }
    }

    /// Hands out an owned registry so connections can flip their own
    /// interest without re-entering the loop.
    pub fn registry(&self) -> Result<Registry, Fail> {
        let registry = self.poll.registry().try_clone()?;
        Ok(registry)
    }

    /// Builds the cross-thread wake signal associated with the given token.
    pub fn waker(&self, token: Token) -> Result<Waker, Fail> {
        let waker = Waker::new(self.poll.registry(), token)?;
        Ok(waker)
    }

    /// Registers a source for the given interest set.
    pub fn register(&self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<(), Fail> {
        self.poll.registry().register(source, token, interest)?;
        Ok(())
    }

    /// Replaces the interest set of a registered source.
    pub fn reregister(&self, source: &mut dyn Source, token: Token, interest: Interest) -> Result<(), Fail> {
        self.poll.registry().reregister(source, token, interest)?;
        Ok(())
    }

    /// Removes a source from the poller. Removing a source whose descriptor
    /// was already closed is a no-op.
    pub fn deregister(&self, source: &mut dyn Source) -> Result<(), Fail> {
        match self.poll.registry().deregister(source) {
            Ok(()) => Ok(()),
            Err(ref error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    /// Blocks for at most `timeout` (`None` blocks indefinitely) and returns
    /// the readiness reports gathered. An interrupted wait surfaces as an
    /// empty report set so the caller simply runs another iteration.
    pub fn poll(&mut self, timeout: Option<Duration>) -> Result<Vec<Readiness>, Fail> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => (),
            Err(ref error) if error.kind() == io::ErrorKind::Interrupted => {
                return Ok(Vec::new())
            }
            Err(error) => return Err(error.into()),
        }
        let mut ready: Vec<Readiness> = Vec::with_capacity(self.events.iter().count());
        for event in self.events.iter() {
            ready.push(Readiness {
                token: event.token(),
                readable: event.is_readable() || event.is_read_closed(),
                writable: event.is_writable(),
                error: event.is_error(),
            });
        }
        Ok(ready)
    }
}
