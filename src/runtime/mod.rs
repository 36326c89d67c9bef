//! Completion-driven I/O runtime.
//!
//! A single reactor thread owns the mio poll, the listener and every accepted
//! socket. Operations are checked out of an `OperationPool`, posted to the
//! reactor, and come back as completions consumed by a pool of worker
//! threads:
//! - `OperationPool`: free list of reusable operation buffers
//! - `Connection`: per-client state and the operations it owns
//! - `reactor`: non-blocking syscalls driven by readiness events
//! - `dispatcher`: the worker loop and accept/recv/send/close state machine

mod completion;
mod connection;
pub(crate) mod dispatcher;
mod operation;
mod pool;
pub(crate) mod reactor;

pub use connection::{Connection, ConnectionId, ConnectionRegistry};
pub use operation::{IoOperation, OpId, OpKind};
pub use pool::OperationPool;

pub(crate) use completion::{Completion, Submission};
