//! Reactor thread: performs the syscalls for posted operations.
//!
//! Readiness-based model underneath a completion-based interface. Posted
//! operations arrive as submissions; the reactor attempts the syscall right
//! away and again on every readiness edge until it finishes, then hands the
//! operation to the workers as a completion. mio is edge-triggered, so an
//! operation that hits `WouldBlock` simply waits for the next event.

use crate::runtime::completion::{Completion, Outcome, Submission};
use crate::runtime::dispatcher::Shared;
use crate::runtime::{Connection, ConnectionId, IoOperation};
use crossbeam_channel::{Receiver, TryRecvError};
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use slab::Slab;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

pub(crate) const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

/// A send operation and how much of its payload has been written.
struct PendingSend {
    op: IoOperation,
    written: usize,
}

/// An accepted socket and the operations parked on it.
struct Socket {
    stream: TcpStream,
    conn: Arc<Connection>,
    recv: Option<IoOperation>,
    /// Written strictly in post order.
    sends: VecDeque<PendingSend>,
}

impl Socket {
    fn drive_recv(&mut self, shared: &Shared) {
        let Some(mut op) = self.recv.take() else {
            return;
        };

        loop {
            match self.stream.read(op.buf_mut()) {
                Ok(n) => {
                    op.set_transferred(n);
                    complete(shared, &self.conn, op, Outcome::Transferred(n));
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.recv = Some(op);
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    complete(shared, &self.conn, op, Outcome::Failed(e));
                    return;
                }
            }
        }
    }

    /// Write queued sends until the socket would block.
    ///
    /// Stops after the first failure; the teardown that follows releases the
    /// rest of the queue.
    fn drive_sends(&mut self, shared: &Shared) {
        while let Some(pending) = self.sends.front_mut() {
            let len = pending.op.payload().len();
            let result = self.stream.write(&pending.op.payload()[pending.written..]);

            let outcome = match result {
                Ok(0) => Outcome::Failed(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                )),
                Ok(n) => {
                    pending.written += n;
                    if pending.written < len {
                        continue;
                    }
                    Outcome::Transferred(len)
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => Outcome::Failed(e),
            };

            let Some(PendingSend { mut op, written }) = self.sends.pop_front() else {
                return;
            };
            let failed = matches!(outcome, Outcome::Failed(_));
            op.set_transferred(written);
            complete(shared, &self.conn, op, outcome);
            if failed {
                return;
            }
        }
    }
}

fn complete(shared: &Shared, conn: &Arc<Connection>, op: IoOperation, outcome: Outcome) {
    shared.complete(Completion::Io {
        conn: Arc::clone(conn),
        op,
        outcome,
    });
}

pub(crate) struct Reactor {
    poll: Poll,
    listener: TcpListener,
    sockets: Slab<Socket>,
    /// Accept operations waiting for a client.
    accepts: VecDeque<IoOperation>,
    generation: u32,
    submissions: Receiver<Submission>,
    shared: Arc<Shared>,
    events_capacity: usize,
}

impl Reactor {
    /// Register the listener with `poll`. The waker must already be
    /// registered under [`WAKER_TOKEN`].
    pub(crate) fn new(
        poll: Poll,
        mut listener: TcpListener,
        submissions: Receiver<Submission>,
        shared: Arc<Shared>,
        events_capacity: usize,
    ) -> io::Result<Self> {
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            sockets: Slab::new(),
            accepts: VecDeque::new(),
            generation: 0,
            submissions,
            shared,
            events_capacity: events_capacity.max(1),
        })
    }

    /// Run until a shutdown submission arrives, then release everything.
    ///
    /// If polling fails the engine is halted: every socket is dropped and
    /// each live connection is closed through the workers.
    pub(crate) fn run(mut self) {
        let mut events = Events::with_capacity(self.events_capacity);
        debug!("Reactor started");

        let failed = loop {
            if let Err(e) = self.poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Reactor poll failed");
                break true;
            }

            for event in events.iter() {
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => self.drive_accepts(),
                    token => self.handle_socket_event(token, event),
                }
            }

            if !self.drain_submissions() {
                break false;
            }
        };

        self.release_all();
        if failed {
            let closing = self.shared.halt();
            warn!(closing, "Engine halted after reactor failure");
        }
        debug!("Reactor exited");
    }

    /// Apply every queued submission. Returns `false` on shutdown.
    fn drain_submissions(&mut self) -> bool {
        loop {
            match self.submissions.try_recv() {
                Ok(Submission::Shutdown) => return false,
                Ok(Submission::Accept(op)) => {
                    self.accepts.push_back(op);
                    self.drive_accepts();
                }
                Ok(Submission::Recv { conn, op }) => self.start_recv(conn, op),
                Ok(Submission::Send { conn, op }) => self.start_send(conn, op),
                Ok(Submission::Close(id)) => self.close_socket(id),
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    fn handle_socket_event(&mut self, token: Token, event: &Event) {
        let shared = Arc::clone(&self.shared);
        let Some(socket) = self.sockets.get_mut(token.0) else {
            return;
        };

        if event.is_readable() || event.is_read_closed() || event.is_error() {
            socket.drive_recv(&shared);
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            socket.drive_sends(&shared);
        }
    }

    /// Match waiting accept operations with pending clients.
    fn drive_accepts(&mut self) {
        while let Some(op) = self.accepts.pop_front() {
            match self.listener.accept() {
                Ok((stream, peer_addr)) => self.admit(op, stream, peer_addr),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.accepts.push_front(op);
                    return;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {
                    self.accepts.push_front(op);
                }
                Err(e) => self.fail_accept(op, e),
            }
        }
    }

    fn admit(&mut self, op: IoOperation, mut stream: TcpStream, peer_addr: SocketAddr) {
        let entry = self.sockets.vacant_entry();
        let token = Token(entry.key());

        if let Err(e) = self.poll.registry().register(
            &mut stream,
            token,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            debug!(peer = %peer_addr, "Failed to register accepted socket");
            self.fail_accept(op, e);
            return;
        }

        self.generation = self.generation.wrapping_add(1);
        let id = ConnectionId::new(entry.key(), self.generation);
        let conn = Arc::new(Connection::new(
            id,
            Some(peer_addr),
            stream.local_addr().ok(),
            Arc::downgrade(&self.shared),
        ));
        trace!(conn = %id, peer = %peer_addr, "Accepted socket");

        entry.insert(Socket {
            stream,
            conn: Arc::clone(&conn),
            recv: None,
            sends: VecDeque::new(),
        });
        complete(&self.shared, &self.shared.listener, op, Outcome::Accepted(conn));
    }

    /// Hand a failed accept back to the workers on the listener.
    fn fail_accept(&self, op: IoOperation, e: io::Error) {
        warn!(error = %e, "Accept failed");
        complete(&self.shared, &self.shared.listener, op, Outcome::Failed(e));
    }

    /// Find the live socket for `id`, ignoring slots reused by a newer client.
    fn socket_mut(&mut self, id: ConnectionId) -> Option<&mut Socket> {
        self.sockets
            .get_mut(id.index())
            .filter(|socket| socket.conn.id() == id)
    }

    fn start_recv(&mut self, conn: Arc<Connection>, op: IoOperation) {
        let shared = Arc::clone(&self.shared);
        let Some(socket) = self.socket_mut(conn.id()) else {
            // Already closed
            shared.release(&conn, op);
            return;
        };

        if socket.recv.is_some() {
            warn!(conn = %conn.id(), "Recv already pending, dropping duplicate");
            shared.release(&conn, op);
            return;
        }
        socket.recv = Some(op);
        socket.drive_recv(&shared);
    }

    fn start_send(&mut self, conn: Arc<Connection>, op: IoOperation) {
        let shared = Arc::clone(&self.shared);
        let Some(socket) = self.socket_mut(conn.id()) else {
            shared.release(&conn, op);
            return;
        };

        socket.sends.push_back(PendingSend { op, written: 0 });
        if socket.sends.len() == 1 {
            socket.drive_sends(&shared);
        }
    }

    /// Drop the socket and return its parked operations to the pool.
    fn close_socket(&mut self, id: ConnectionId) {
        if self.socket_mut(id).is_none() {
            return;
        }
        let socket = self.sockets.remove(id.index());
        self.discard(socket);
        trace!(conn = %id, "Closed socket");
    }

    fn discard(&self, mut socket: Socket) {
        let _ = self.poll.registry().deregister(&mut socket.stream);
        if let Some(op) = socket.recv.take() {
            self.shared.release(&socket.conn, op);
        }
        for pending in socket.sends.drain(..) {
            self.shared.release(&socket.conn, pending.op);
        }
    }

    fn release_all(&mut self) {
        let _ = self.poll.registry().deregister(&mut self.listener);

        while let Some(op) = self.accepts.pop_front() {
            self.shared.release(&self.shared.listener, op);
        }

        let sockets: Vec<Socket> = self.sockets.drain().collect();
        let count = sockets.len();
        for socket in sockets {
            self.discard(socket);
        }
        debug!(sockets = count, "Reactor released all sockets");
    }
}
