// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use custom_error::custom_error;

use std::io;

//==============================================================================
// Constants & Structures
//==============================================================================

custom_error! {#[derive(Clone, PartialEq, Eq)] pub Fail
    ConnectionRefused{} = "connection refused",
    ConnectionAborted{} = "connection aborted",
    ConnectionReset{} = "connection reset by peer",
    ConnectionClosed{} = "connection closed",
    HandshakeFailed{ details: String } = "handshake failed ({details})",
    Invalid{ details: &'static str } = "invalid argument ({details})",
    Unsupported{ details: &'static str } = "operation not supported ({details})",
    Cancelled{} = "operation cancelled",
    LoopStopped{} = "event loop is not running",
    TimedOut{} = "operation timed out",
    Ignored{ details: &'static str } = "operation ignored ({details})",
    ResolveFailed{ details: String } = "address resolution failed ({details})",
    IoError{ errno: i32 } = "I/O error (errno {errno})",
    Malformed{ details: &'static str } = "malformed payload ({details})",
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Fail].
impl Fail {
    /// Maps the target [Fail] to an OS error number.
    pub fn errno(&self) -> i32 {
        match self {
            Fail::ConnectionRefused {} => libc::ECONNREFUSED,
            Fail::ConnectionAborted {} => libc::ECONNABORTED,
            Fail::ConnectionReset {} => libc::ECONNRESET,
            Fail::ConnectionClosed {} => libc::EPIPE,
            Fail::HandshakeFailed { .. } => libc::EPROTO,
            Fail::Invalid { .. } => libc::EINVAL,
            Fail::Unsupported { .. } => libc::ENOTSUP,
            Fail::Cancelled {} => libc::ECANCELED,
            Fail::LoopStopped {} => libc::ESHUTDOWN,
            Fail::TimedOut {} => libc::ETIMEDOUT,
            Fail::Ignored { .. } => libc::EAGAIN,
            Fail::ResolveFailed { .. } => libc::EADDRNOTAVAIL,
            Fail::IoError { errno } => *errno,
            Fail::Malformed { .. } => libc::EBADMSG,
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Conversion trait implementation for [Fail]. Transient conditions
/// (would-block, interrupted) are retried at the I/O sites and must never
/// reach this conversion.
impl From<io::Error> for Fail {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionRefused => Fail::ConnectionRefused {},
            io::ErrorKind::ConnectionAborted => Fail::ConnectionAborted {},
            io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe => {
                Fail::ConnectionReset {}
            }
            io::ErrorKind::TimedOut => Fail::TimedOut {},
            _ => Fail::IoError {
                errno: error.raw_os_error().unwrap_or(libc::EIO),
            },
        }
    }
}
