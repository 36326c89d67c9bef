//! Error types for the engine.
//!
//! Startup failures abort `Engine::start` and roll back everything that was
//! created. Transport failures are local to one connection and reach the
//! handler exactly once through `on_connection_error`.

use crate::runtime::OpKind;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors returned by [`Engine::start`](crate::Engine::start).
#[derive(Debug, Error)]
pub enum StartupError {
    /// The engine is already running; call `stop` first.
    #[error("engine is already running")]
    AlreadyRunning,
    /// The configured host and port do not form a socket address.
    #[error("invalid listen address '{0}'")]
    InvalidAddress(String),
    /// Creating the poll instance or its waker failed.
    #[error("failed to create poller: {0}")]
    Poll(#[source] io::Error),
    /// Binding or listening on the address failed.
    #[error("failed to listen on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// Spawning the reactor or a worker thread failed.
    #[error("failed to spawn thread: {0}")]
    Thread(#[source] io::Error),
}

/// Errors returned when posting a send.
///
/// These only describe the post itself; delivery failures surface later as a
/// [`TransportError`] on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendError {
    /// The engine that owns the connection has been stopped.
    #[error("engine is not running")]
    NotRunning,
    /// The connection has been closed or is closing.
    #[error("connection is closed")]
    ConnectionClosed,
    /// Nothing to send.
    #[error("empty payload")]
    EmptyPayload,
}

/// A failed accept, recv or send on one connection.
#[derive(Debug, Error)]
#[error("{op} failed: {source}")]
pub struct TransportError {
    op: OpKind,
    #[source]
    source: io::Error,
}

impl TransportError {
    pub fn new(op: OpKind, source: io::Error) -> Self {
        Self { op, source }
    }

    /// The kind of operation that failed.
    pub fn op(&self) -> OpKind {
        self.op
    }

    /// Nonzero error code: the OS errno when there is one, otherwise -1.
    pub fn code(&self) -> i32 {
        match self.source.raw_os_error() {
            Some(code) if code != 0 => code,
            _ => -1,
        }
    }

    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }

    pub fn io_error(&self) -> &io::Error {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_uses_os_errno() {
        let err = TransportError::new(OpKind::Recv, io::Error::from_raw_os_error(104));
        assert_eq!(err.code(), 104);
        assert_eq!(err.op(), OpKind::Recv);
    }

    #[test]
    fn test_code_is_never_zero() {
        let err = TransportError::new(OpKind::Send, io::Error::new(io::ErrorKind::WriteZero, "x"));
        assert_eq!(err.code(), -1);

        let err = TransportError::new(OpKind::Accept, io::Error::from_raw_os_error(0));
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn test_display() {
        let err = TransportError::new(OpKind::Send, io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_string(), "send failed: boom");
        assert_eq!(SendError::ConnectionClosed.to_string(), "connection is closed");
    }
}
