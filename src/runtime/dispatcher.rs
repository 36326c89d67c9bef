//! Completion dispatch: posting operations and the worker loop.
//!
//! Workers all block on one completion queue. Each completion carries the
//! operation and its connection; the worker runs the accept/recv/send/close
//! state machine and invokes the handler. A worker never waits on a
//! connection: if another worker is already dispatching it, the work is
//! parked on the connection and run by that worker before it lets go. This
//! keeps callbacks for one connection sequential, and teardown runs in the
//! same sequence, so a connection is never handed to the handler after it
//! closed.

use crate::error::{SendError, TransportError};
use crate::handler::Handler;
use crate::runtime::completion::{CloseReason, Completion, Outcome, Submission, Work};
use crate::runtime::{
    Connection, ConnectionId, ConnectionRegistry, IoOperation, OpKind, OperationPool,
};
use crossbeam_channel::{Receiver, Sender};
use mio::Waker;
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// Counters that outlive a single start/stop cycle.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) connections: AtomicUsize,
    pub(crate) pending_accepts: AtomicUsize,
    /// Cleared by `stop` or when the reactor fails.
    pub(crate) running: AtomicBool,
}

/// State shared by the reactor, the workers and every connection of one
/// running instance.
pub(crate) struct Shared {
    pub(crate) pool: Arc<OperationPool>,
    pub(crate) counters: Arc<Counters>,
    pub(crate) listener: Arc<Connection>,
    registry: Mutex<ConnectionRegistry>,
    submissions: Sender<Submission>,
    waker: Waker,
    completions: Sender<Completion>,
    accept_depth: usize,
    shutdown: AtomicBool,
}

/// Why a freshly accepted connection was not admitted.
#[derive(Debug, Clone, Copy)]
enum Refusal {
    ShuttingDown,
    AtCapacity,
}

impl Shared {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pool: Arc<OperationPool>,
        counters: Arc<Counters>,
        local_addr: SocketAddr,
        max_connections: usize,
        accept_depth: usize,
        submissions: Sender<Submission>,
        waker: Waker,
        completions: Sender<Completion>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Shared {
            pool,
            counters,
            listener: Arc::new(Connection::listener(local_addr, weak.clone())),
            registry: Mutex::new(ConnectionRegistry::new(max_connections)),
            submissions,
            waker,
            completions,
            accept_depth,
            shutdown: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Refuse new connections from now on.
    ///
    /// The flag flips under the registry lock, so every connection is either
    /// already registered (and seen by `live_connections`) or refused.
    pub(crate) fn begin_shutdown(&self) {
        let _registry = self.registry.lock();
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub(crate) fn live_connections(&self) -> Vec<ConnectionId> {
        self.registry.lock().ids()
    }

    /// Stop serving after the reactor failed.
    ///
    /// New posts are refused and every live connection is closed through the
    /// workers so the handler hears about it. Returns how many were closed.
    pub(crate) fn halt(&self) -> usize {
        self.counters.running.store(false, Ordering::Release);
        self.begin_shutdown();
        self.close_all()
    }

    /// Queue a graceful close for every live connection. Returns how many.
    pub(crate) fn close_all(&self) -> usize {
        let live = self.live_connections();
        for &id in &live {
            self.request_close(id);
        }
        live.len()
    }

    fn register(&self, conn: &Arc<Connection>) -> Result<(), Refusal> {
        let mut registry = self.registry.lock();
        if self.is_shutting_down() {
            return Err(Refusal::ShuttingDown);
        }
        if !registry.insert(Arc::clone(conn)) {
            return Err(Refusal::AtCapacity);
        }
        self.counters.connections.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unregister(&self, id: ConnectionId) {
        if self.registry.lock().remove(id).is_some() {
            self.counters.connections.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn lookup(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.registry.lock().get(id).cloned()
    }

    /// Hand a request to the reactor and wake it.
    pub(crate) fn submit(&self, submission: Submission) -> Result<(), Submission> {
        self.submissions.send(submission).map_err(|e| e.into_inner())?;
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake reactor");
        }
        Ok(())
    }

    pub(crate) fn complete(&self, completion: Completion) {
        if let Err(e) = self.completions.send(completion) {
            self.discard_completion(e.into_inner());
        }
    }

    pub(crate) fn request_close(&self, id: ConnectionId) {
        self.complete(Completion::Close {
            id,
            reason: CloseReason::Graceful,
        });
    }

    /// Return an operation owned by `conn` to the pool.
    pub(crate) fn release(&self, conn: &Connection, op: IoOperation) {
        conn.untrack(op.id());
        if op.kind() == OpKind::Accept {
            self.counters.pending_accepts.fetch_sub(1, Ordering::AcqRel);
        }
        self.pool.release(op);
    }

    /// Post accepts until `accept_depth` are outstanding.
    pub(crate) fn replenish_accepts(&self) {
        let pending = &self.counters.pending_accepts;
        loop {
            let current = pending.load(Ordering::Acquire);
            if current >= self.accept_depth || self.is_shutting_down() {
                return;
            }
            if pending
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }

            let mut op = self.pool.allocate();
            op.prepare(OpKind::Accept, ConnectionId::LISTENER);
            self.listener.track(op.id());
            trace!(op = op.id().index(), "Posting accept");
            if let Err(Submission::Accept(op)) = self.submit(Submission::Accept(op)) {
                self.release(&self.listener, op);
                return;
            }
        }
    }

    pub(crate) fn post_recv(&self, conn: &Arc<Connection>) -> Result<(), SendError> {
        if self.is_shutting_down() {
            return Err(SendError::NotRunning);
        }

        let mut op = self.pool.allocate();
        op.prepare(OpKind::Recv, conn.id());
        conn.track(op.id());
        let submission = Submission::Recv {
            conn: Arc::clone(conn),
            op,
        };
        if let Err(Submission::Recv { op, .. }) = self.submit(submission) {
            self.release(conn, op);
            return Err(SendError::NotRunning);
        }
        Ok(())
    }

    /// Copy `data` into pooled operations and post them in order.
    pub(crate) fn post_send(
        &self,
        conn: &Arc<Connection>,
        data: &[u8],
    ) -> Result<(), SendError> {
        if data.is_empty() {
            return Err(SendError::EmptyPayload);
        }
        if self.is_shutting_down() {
            return Err(SendError::NotRunning);
        }
        if conn.is_listener() || conn.is_closing() {
            return Err(SendError::ConnectionClosed);
        }

        for chunk in data.chunks(self.pool.buffer_size()) {
            let mut op = self.pool.allocate();
            op.prepare(OpKind::Send, conn.id());
            op.fill(chunk);
            conn.track(op.id());
            trace!(conn = %conn.id(), bytes = chunk.len(), "Posting send");
            let submission = Submission::Send {
                conn: Arc::clone(conn),
                op,
            };
            if let Err(Submission::Send { op, .. }) = self.submit(submission) {
                self.release(conn, op);
                return Err(SendError::NotRunning);
            }
        }
        Ok(())
    }

    /// Release whatever a leftover submission holds.
    pub(crate) fn discard_submission(&self, submission: Submission) {
        match submission {
            Submission::Accept(op) => self.release(&self.listener, op),
            Submission::Recv { conn, op } | Submission::Send { conn, op } => {
                self.release(&conn, op)
            }
            Submission::Close(_) | Submission::Shutdown => {}
        }
    }

    /// Release whatever a leftover completion holds.
    pub(crate) fn discard_completion(&self, completion: Completion) {
        if let Completion::Io { conn, op, .. } = completion {
            self.release(&conn, op);
        }
    }
}

/// Worker thread body: dispatch completions until the exit sentinel arrives.
pub(crate) fn run_worker<H: Handler>(
    worker_id: usize,
    shared: Arc<Shared>,
    handler: Arc<H>,
    completions: Receiver<Completion>,
) {
    let dispatcher = Dispatcher {
        shared: &shared,
        handler: &*handler,
    };
    debug!(worker = worker_id, "Worker started");

    while let Ok(completion) = completions.recv() {
        match completion {
            Completion::Exit => break,
            Completion::Close { id, reason } => {
                if let Some(conn) = shared.lookup(id) {
                    dispatcher.schedule(&conn, Work::Close(reason));
                }
            }
            Completion::Io { conn, op, outcome } => match op.kind() {
                OpKind::Accept => dispatcher.on_accept(op, outcome),
                OpKind::Recv | OpKind::Send => {
                    dispatcher.schedule(&conn, Work::Io { op, outcome })
                }
                OpKind::Idle => {
                    warn!(op = op.id().index(), "Completion for an idle operation");
                    shared.release(&conn, op);
                }
            },
        }
    }

    debug!(worker = worker_id, "Worker exited");
}

struct Dispatcher<'a, H> {
    shared: &'a Shared,
    handler: &'a H,
}

impl<H: Handler> Dispatcher<'_, H> {
    /// Run `work` now, or park it if another worker is dispatching `conn`.
    fn schedule(&self, conn: &Arc<Connection>, work: Work) {
        let Some(work) = conn.acquire(work) else {
            trace!(conn = %conn.id(), "Connection busy, work deferred");
            return;
        };

        let mut next = Some(work);
        while let Some(work) = next {
            self.run(conn, work);
            next = conn.next_work();
        }
    }

    fn run(&self, conn: &Arc<Connection>, work: Work) {
        match work {
            Work::Promote => self.promote(conn),
            Work::Io { op, outcome } if op.kind() == OpKind::Recv => {
                self.on_recv(conn, op, outcome)
            }
            Work::Io { op, outcome } => self.on_send(conn, op, outcome),
            Work::Close(reason) => self.teardown(conn, reason),
            Work::AcceptFailed(error) => {
                let _ = self.invoke(conn, OpKind::Accept, |h| {
                    h.on_connection_error(conn, &error)
                });
            }
        }
    }

    fn on_accept(&self, op: IoOperation, outcome: Outcome) {
        let listener = &self.shared.listener;
        self.shared.release(listener, op);
        self.shared.replenish_accepts();

        match outcome {
            Outcome::Accepted(conn) => self.schedule(&conn, Work::Promote),
            Outcome::Failed(err) => {
                let error = TransportError::new(OpKind::Accept, err);
                warn!(error = %error, code = error.code(), "Accept failed");
                self.schedule(listener, Work::AcceptFailed(error));
            }
            Outcome::Transferred(n) => {
                warn!(bytes = n, "Accept completed without a connection");
            }
        }
    }

    /// Admit an accepted socket as a live connection and post its first recv.
    fn promote(&self, conn: &Arc<Connection>) {
        if let Err(refusal) = self.shared.register(conn) {
            warn!(conn = %conn.id(), peer = ?conn.peer_addr(), ?refusal, "Rejecting connection");
            conn.mark_closed();
            let _ = self.shared.submit(Submission::Close(conn.id()));
            return;
        }

        debug!(conn = %conn.id(), peer = ?conn.peer_addr(), "Accepted connection");
        let accepted = self.invoke(conn, OpKind::Accept, |h| h.on_connection_accepted(conn));
        let failure = match accepted {
            Ok(()) => self.repost_recv(conn),
            Err(error) => Some(error),
        };
        if let Some(error) = failure {
            self.teardown(conn, CloseReason::Failed(error));
        }
    }

    fn on_recv(&self, conn: &Arc<Connection>, op: IoOperation, outcome: Outcome) {
        if conn.is_closed() {
            self.shared.release(conn, op);
            return;
        }

        match outcome {
            Outcome::Transferred(n) if n > 0 => {
                trace!(conn = %conn.id(), bytes = n, "Recv completed");
                let delivered = self.invoke(conn, OpKind::Recv, |h| {
                    h.on_recv_completed(conn, op.received())
                });
                self.shared.release(conn, op);

                let failure = match delivered {
                    Ok(()) => self.repost_recv(conn),
                    Err(error) => Some(error),
                };
                if let Some(error) = failure {
                    self.teardown(conn, CloseReason::Failed(error));
                }
            }
            outcome => {
                self.shared.release(conn, op);
                self.teardown(conn, close_reason(OpKind::Recv, outcome));
            }
        }
    }

    fn on_send(&self, conn: &Arc<Connection>, op: IoOperation, outcome: Outcome) {
        if conn.is_closed() {
            self.shared.release(conn, op);
            return;
        }

        match outcome {
            Outcome::Transferred(n) if n > 0 => {
                trace!(conn = %conn.id(), bytes = n, "Send completed");
                let result = self.invoke(conn, OpKind::Send, |h| h.on_send_completed(conn, &op));
                self.shared.release(conn, op);
                if let Err(error) = result {
                    self.teardown(conn, CloseReason::Failed(error));
                }
            }
            outcome => {
                self.shared.release(conn, op);
                self.teardown(conn, close_reason(OpKind::Send, outcome));
            }
        }
    }

    /// Post the next recv unless the connection is on its way out.
    fn repost_recv(&self, conn: &Arc<Connection>) -> Option<TransportError> {
        if conn.is_closing() {
            return None;
        }
        match self.shared.post_recv(conn) {
            Ok(()) => None,
            Err(_) if self.shared.is_shutting_down() => None,
            Err(e) => Some(TransportError::new(
                OpKind::Recv,
                io::Error::new(io::ErrorKind::NotConnected, e),
            )),
        }
    }

    /// Close a connection exactly once and report why.
    fn teardown(&self, conn: &Arc<Connection>, reason: CloseReason) {
        if !conn.mark_closed() {
            return;
        }

        self.shared.unregister(conn.id());
        // The reactor drops the socket and returns its in-flight operations
        let _ = self.shared.submit(Submission::Close(conn.id()));

        match reason {
            CloseReason::Graceful => {
                debug!(conn = %conn.id(), peer = ?conn.peer_addr(), "Connection closed");
                let _ = self.invoke(conn, OpKind::Idle, |h| h.on_connection_closed(conn));
            }
            CloseReason::Failed(error) => {
                debug!(conn = %conn.id(), error = %error, code = error.code(), "Connection error");
                let _ = self.invoke(conn, OpKind::Idle, |h| {
                    h.on_connection_error(conn, &error)
                });
            }
        }
    }

    /// Run a callback, turning a panic into a transport error.
    fn invoke(
        &self,
        conn: &Connection,
        op: OpKind,
        f: impl FnOnce(&H),
    ) -> Result<(), TransportError> {
        panic::catch_unwind(AssertUnwindSafe(|| f(self.handler))).map_err(|_| {
            error!(conn = %conn.id(), %op, "Handler panicked");
            TransportError::new(op, io::Error::other("handler panicked"))
        })
    }
}

/// Zero bytes is an orderly shutdown; anything else that is not a transfer
/// is a transport failure.
fn close_reason(op: OpKind, outcome: Outcome) -> CloseReason {
    match outcome {
        Outcome::Failed(err) => CloseReason::Failed(TransportError::new(op, err)),
        _ => CloseReason::Graceful,
    }
}
