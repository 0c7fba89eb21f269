// src/error.rs - Crate-wide error taxonomy
//
// Every OS-level failure is normalized into a small set of kinds so that
// callers can match on behavior instead of raw errno values:
// - INTERRUPTED is retried at the call site and never escapes a Socket method
// - WOULD_BLOCK is absorbed by the send queue in write()/flush()
// - everything else carries enough context (address, size, flags) to be
//   actionable in a log line

use std::io;
use thiserror::Error;

/// Normalized network error kinds.
///
/// `Other` keeps the raw OS code for the cases the taxonomy does not name.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetError {
    /// Non-blocking operation would block; caller waits on readiness.
    #[error("operation would block")]
    WouldBlock,
    /// Interrupted syscall; retried locally, never surfaced.
    #[error("operation interrupted")]
    Interrupted,
    /// connect() on a socket already connected to a different address.
    #[error("already connected{0}")]
    AlreadyConnected(String),
    /// Send/receive on a socket with no peer.
    #[error("not connected{0}")]
    NotConnected(String),
    /// Peer refused the connection (includes connect-timeout).
    #[error("connection refused{0}")]
    ConnectionRefused(String),
    /// Connection reset by peer (or broken pipe).
    #[error("connection reset{0}")]
    Reset(String),
    /// Operation on a socket whose send side has been shut down.
    #[error("socket shutdown{0}")]
    Shutdown(String),
    /// Stream name has no live publication.
    #[error("{0} unfound")]
    Unfound(String),
    /// Requested operation or format is not supported.
    #[error("{0} unsupported")]
    Unsupported(String),
    /// Any other OS error, with its raw code and call context.
    #[error("net error {code}{context}")]
    Other { code: i32, context: String },
}

impl NetError {
    /// Normalize an `io::Error`, attaching `context` to the kinds that keep one.
    ///
    /// Context strings follow the " (key=value, ...)" convention so they
    /// concatenate cleanly after the kind message.
    pub fn from_io(error: &io::Error, context: String) -> NetError {
        match error.kind() {
            io::ErrorKind::WouldBlock => NetError::WouldBlock,
            io::ErrorKind::Interrupted => NetError::Interrupted,
            io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut => {
                NetError::ConnectionRefused(context)
            }
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => NetError::Reset(context),
            io::ErrorKind::NotConnected => NetError::NotConnected(context),
            _ => match error.raw_os_error() {
                Some(code) if code == libc::EISCONN => NetError::AlreadyConnected(context),
                Some(code) if code == libc::ENOTCONN => NetError::NotConnected(context),
                Some(code) if code == libc::ECONNREFUSED => NetError::ConnectionRefused(context),
                Some(code) if code == libc::ESHUTDOWN => NetError::Shutdown(context),
                Some(code) => NetError::Other { code, context },
                None => NetError::Other { code: 0, context },
            },
        }
    }

    /// True for the kinds a sender may absorb by queueing.
    pub fn is_transient(&self) -> bool {
        matches!(self, NetError::WouldBlock | NetError::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, NetError>;
