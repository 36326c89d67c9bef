//! Per-connection state and the registry of live connections.
//!
//! A `Connection` is created by the reactor when an accept completes and is
//! shared (`Arc`) between the reactor, the workers and the handler. It tracks
//! the handles of operations it currently owns so teardown can account for
//! every one of them.
//!
//! At most one worker dispatches a connection at a time. A worker that finds
//! the connection busy parks its work on the connection's queue and moves on;
//! the owning worker drains the queue before letting go.

use crate::error::SendError;
use crate::runtime::completion::Work;
use crate::runtime::dispatcher::Shared;
use crate::runtime::operation::OpId;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Identity of a connection: reactor slot index plus a generation so that a
/// reused slot is never mistaken for the connection that used it before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    index: usize,
    generation: u32,
}

impl ConnectionId {
    /// Placeholder owner for pooled operations.
    pub const NONE: ConnectionId = ConnectionId {
        index: usize::MAX,
        generation: 0,
    };

    /// The listening connection.
    pub const LISTENER: ConnectionId = ConnectionId {
        index: usize::MAX - 1,
        generation: 0,
    };

    pub(crate) fn new(index: usize, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Reactor slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ConnectionId::LISTENER => f.write_str("listener"),
            ConnectionId::NONE => f.write_str("none"),
            id => write!(f, "{}.{}", id.index, id.generation),
        }
    }
}

/// A single client connection, or the listening socket.
pub struct Connection {
    id: ConnectionId,
    peer_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    /// Handles of operations this connection currently owns.
    operations: Mutex<Vec<OpId>>,
    dispatch: Mutex<DispatchQueue>,
    closing: AtomicBool,
    closed: AtomicBool,
    shared: Weak<Shared>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer_addr: Option<SocketAddr>,
        local_addr: Option<SocketAddr>,
        shared: Weak<Shared>,
    ) -> Self {
        Self {
            id,
            peer_addr,
            local_addr,
            operations: Mutex::new(Vec::new()),
            dispatch: Mutex::new(DispatchQueue::default()),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            shared,
        }
    }

    pub(crate) fn listener(local_addr: SocketAddr, shared: Weak<Shared>) -> Self {
        Self::new(ConnectionId::LISTENER, None, Some(local_addr), shared)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote address; `None` for the listening connection.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_listener(&self) -> bool {
        self.id == ConnectionId::LISTENER
    }

    /// True once a close has been requested or completed.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire) || self.is_closed()
    }

    /// True once teardown has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of operations currently owned by this connection.
    pub fn outstanding_operations(&self) -> usize {
        self.operations.lock().len()
    }

    /// Post `data` for sending on this connection.
    ///
    /// Returns once the data is copied into pooled operations and handed to the
    /// reactor. Delivery failures are reported later through the handler.
    pub fn send(self: &Arc<Self>, data: &[u8]) -> Result<(), SendError> {
        let shared = self.shared.upgrade().ok_or(SendError::NotRunning)?;
        shared.post_send(self, data)
    }

    /// Request a graceful close.
    ///
    /// Teardown happens on a worker thread; the handler then receives
    /// `on_connection_closed`. Safe to call from inside a callback.
    pub fn close(&self) {
        if self.is_listener() || self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.request_close(self.id);
        }
    }

    pub(crate) fn track(&self, op: OpId) {
        self.operations.lock().push(op);
    }

    pub(crate) fn untrack(&self, op: OpId) {
        let mut ops = self.operations.lock();
        if let Some(pos) = ops.iter().position(|&o| o == op) {
            ops.swap_remove(pos);
        }
    }

    /// Claim dispatch of this connection for `work`.
    ///
    /// Returns the work back if the caller now owns dispatch and must run it.
    /// Otherwise the work is queued for the current owner.
    pub(crate) fn acquire(&self, work: Work) -> Option<Work> {
        let mut dispatch = self.dispatch.lock();
        if dispatch.busy {
            dispatch.pending.push_back(work);
            return None;
        }
        dispatch.busy = true;
        Some(work)
    }

    /// Next queued work for the owner, or `None` after giving up ownership.
    pub(crate) fn next_work(&self) -> Option<Work> {
        let mut dispatch = self.dispatch.lock();
        let work = dispatch.pending.pop_front();
        if work.is_none() {
            dispatch.busy = false;
        }
        work
    }

    /// Mark the connection closed. Returns `false` if it already was.
    pub(crate) fn mark_closed(&self) -> bool {
        self.closing.store(true, Ordering::Release);
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dispatch ownership and the work parked while it is held.
#[derive(Default)]
struct DispatchQueue {
    busy: bool,
    pending: VecDeque<Work>,
}

/// Registry of live connections keyed by id.
///
/// Refuses new connections beyond `max_connections`.
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Arc<Connection>>,
    max_connections: usize,
}

impl ConnectionRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: HashMap::new(),
            max_connections,
        }
    }

    /// Insert a connection. Returns `false` if the registry is at capacity.
    pub fn insert(&mut self, conn: Arc<Connection>) -> bool {
        if self.connections.len() >= self.max_connections {
            return false;
        }
        self.connections.insert(conn.id(), conn);
        true
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Arc<Connection>> {
        self.connections.get(&id)
    }

    pub fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections.remove(&id)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_connections
    }

    /// Ids of all live connections.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }
}
