//! Messages exchanged between the reactor and the workers.
//!
//! Posting an operation sends a `Submission` to the reactor thread. When the
//! reactor finishes the syscall it pushes a `Completion` onto the shared
//! queue, and whichever worker is idle picks it up.

use crate::error::TransportError;
use crate::runtime::{Connection, ConnectionId, IoOperation};
use std::io;
use std::sync::Arc;

/// Request handed to the reactor.
pub(crate) enum Submission {
    /// Park an accept operation on the listener.
    Accept(IoOperation),
    /// Receive into the operation buffer.
    Recv {
        conn: Arc<Connection>,
        op: IoOperation,
    },
    /// Write the operation payload.
    Send {
        conn: Arc<Connection>,
        op: IoOperation,
    },
    /// Close the socket and release its pending operations.
    Close(ConnectionId),
    /// Release everything and exit the reactor loop.
    Shutdown,
}

/// Result of an operation as seen by the reactor.
pub(crate) enum Outcome {
    /// A client was accepted and registered with the reactor.
    Accepted(Arc<Connection>),
    /// Bytes moved; zero means the peer shut down its side.
    Transferred(usize),
    Failed(io::Error),
}

/// Why a connection is being torn down.
#[derive(Debug)]
pub(crate) enum CloseReason {
    /// Peer shutdown, explicit close, or engine stop.
    Graceful,
    Failed(TransportError),
}

/// A unit of per-connection work, run by whichever worker currently owns
/// dispatch for that connection.
pub(crate) enum Work {
    /// Admit a freshly accepted connection.
    Promote,
    /// A finished recv or send.
    Io { op: IoOperation, outcome: Outcome },
    /// Tear the connection down.
    Close(CloseReason),
    /// Report a failed accept on the listening connection.
    AcceptFailed(TransportError),
}

/// Message consumed by the worker pool.
pub(crate) enum Completion {
    /// A finished operation together with the connection that owns it.
    Io {
        conn: Arc<Connection>,
        op: IoOperation,
        outcome: Outcome,
    },
    /// Tear down a connection on a worker thread.
    Close {
        id: ConnectionId,
        reason: CloseReason,
    },
    /// Wake sentinel: the receiving worker exits.
    Exit,
}
