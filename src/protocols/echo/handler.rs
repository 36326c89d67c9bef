//! Echo handler: writes every received byte back to the sender.

use crate::error::TransportError;
use crate::handler::Handler;
use crate::runtime::{Connection, IoOperation};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Counters kept by [`EchoHandler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EchoStats {
    pub accepted: u64,
    pub closed: u64,
    pub errors: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

#[derive(Debug, Default)]
pub struct EchoHandler {
    accepted: AtomicU64,
    closed: AtomicU64,
    errors: AtomicU64,
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
}

impl EchoHandler {
    pub fn stats(&self) -> EchoStats {
        EchoStats {
            accepted: self.accepted.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }
}

impl Handler for EchoHandler {
    fn on_connection_accepted(&self, conn: &Arc<Connection>) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        info!(conn = %conn.id(), peer = ?conn.peer_addr(), "Client connected");
    }

    fn on_connection_closed(&self, conn: &Arc<Connection>) {
        self.closed.fetch_add(1, Ordering::Relaxed);
        info!(conn = %conn.id(), peer = ?conn.peer_addr(), "Client disconnected");
    }

    fn on_connection_error(&self, conn: &Arc<Connection>, error: &TransportError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        warn!(conn = %conn.id(), code = error.code(), error = %error, "Connection error");
    }

    fn on_recv_completed(&self, conn: &Arc<Connection>, data: &[u8]) {
        self.bytes_received
            .fetch_add(data.len() as u64, Ordering::Relaxed);
        if let Err(e) = conn.send(data) {
            debug!(conn = %conn.id(), error = %e, "Dropping echo");
        }
    }

    fn on_send_completed(&self, _conn: &Arc<Connection>, op: &IoOperation) {
        self.bytes_sent
            .fetch_add(op.transferred() as u64, Ordering::Relaxed);
    }
}
