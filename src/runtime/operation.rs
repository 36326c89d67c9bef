//! Per-operation descriptors.
//!
//! Every posted accept, recv or send travels as an owned `IoOperation`:
//! from the pool to the poster, to the reactor while it is in flight, back
//! through the completion queue to a worker, and finally back to the pool.
//! Ownership moves at every step, so two threads never touch the same buffer.

use crate::runtime::ConnectionId;
use std::fmt;

/// Type of a posted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Sitting in the pool, not posted.
    Idle,
    /// Accept on the listening socket.
    Accept,
    /// Receive into the operation buffer.
    Recv,
    /// Send the payload held in the operation buffer.
    Send,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpKind::Idle => "idle",
            OpKind::Accept => "accept",
            OpKind::Recv => "recv",
            OpKind::Send => "send",
        };
        f.write_str(name)
    }
}

/// Stable handle of an operation within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpId(pub(crate) usize);

impl OpId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// One reusable I/O request: a fixed-capacity buffer plus completion metadata.
pub struct IoOperation {
    id: OpId,
    kind: OpKind,
    buf: Box<[u8]>,
    /// Payload length for sends.
    len: usize,
    transferred: usize,
    token: u64,
    conn: ConnectionId,
}

impl IoOperation {
    pub(crate) fn new(id: OpId, capacity: usize) -> Self {
        Self {
            id,
            kind: OpKind::Idle,
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            transferred: 0,
            token: 0,
            conn: ConnectionId::NONE,
        }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Opaque token stamped when the operation was checked out.
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Connection that owns this operation.
    pub fn connection(&self) -> ConnectionId {
        self.conn
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes moved by the completed operation.
    pub fn transferred(&self) -> usize {
        self.transferred
    }

    /// Payload posted with a send.
    pub fn payload(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Bytes filled in by a completed recv.
    pub fn received(&self) -> &[u8] {
        &self.buf[..self.transferred]
    }

    pub(crate) fn stamp(&mut self, token: u64) {
        self.token = token;
    }

    pub(crate) fn prepare(&mut self, kind: OpKind, conn: ConnectionId) {
        self.kind = kind;
        self.conn = conn;
        self.len = 0;
        self.transferred = 0;
    }

    /// Copy a send payload into the buffer, returning how many bytes fit.
    pub(crate) fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&data[..n]);
        self.len = n;
        n
    }

    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub(crate) fn set_transferred(&mut self, n: usize) {
        self.transferred = n;
    }

    /// Blank the buffer and metadata before the operation is pooled again.
    pub(crate) fn reset(&mut self) {
        let dirty = self.len.max(self.transferred).min(self.buf.len());
        self.buf[..dirty].fill(0);
        self.kind = OpKind::Idle;
        self.len = 0;
        self.transferred = 0;
        self.token = 0;
        self.conn = ConnectionId::NONE;
    }
}

impl fmt::Debug for IoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoOperation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("conn", &self.conn)
            .field("len", &self.len)
            .field("transferred", &self.transferred)
            .field("token", &self.token)
            .finish()
    }
}
