//! Callback boundary between the engine and a protocol implementation.

use crate::error::TransportError;
use crate::runtime::{Connection, IoOperation};
use std::sync::Arc;

/// Notifications delivered by the engine.
///
/// Every method runs on a worker thread, and any worker may deliver events for
/// any connection, so per-connection state kept by the handler needs its own
/// synchronization. Callbacks for one connection never overlap, and
/// `on_recv_completed` calls for one connection arrive in stream order.
///
/// Callbacks occupy a shared worker and should return promptly. A panic is
/// caught at the boundary and closes the affected connection with an error.
pub trait Handler: Send + Sync + 'static {
    /// A client connected. The first recv is posted after this returns.
    fn on_connection_accepted(&self, _conn: &Arc<Connection>) {}

    /// The connection closed gracefully. No further callbacks follow.
    fn on_connection_closed(&self, _conn: &Arc<Connection>) {}

    /// An operation failed. For a failed accept `conn` is the listening
    /// connection and the listener stays open; otherwise the connection has
    /// been torn down and no further callbacks follow.
    fn on_connection_error(&self, _conn: &Arc<Connection>, _error: &TransportError) {}

    /// Bytes arrived. Returning does not close the connection; call
    /// [`Connection::close`] to do that.
    fn on_recv_completed(&self, conn: &Arc<Connection>, data: &[u8]);

    /// A posted send was fully written.
    fn on_send_completed(&self, _conn: &Arc<Connection>, _op: &IoOperation) {}
}
