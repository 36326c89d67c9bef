//! completion-server: a completion-driven TCP server engine.
//!
//! Many client connections are multiplexed over a fixed pool of worker
//! threads. Every I/O request is an operation checked out of a shared pool,
//! posted to a reactor thread, and delivered back to a worker as a
//! completion. Protocols plug in by implementing [`Handler`].
//!
//! Features:
//! - Pooled fixed-size operation buffers with most-recently-used reuse
//! - A configurable number of accepts kept outstanding on the listener
//! - Ordered, non-overlapping callbacks per connection
//! - Large sends split across operations and resumed after partial writes
//! - Restartable engine: `start`/`stop` may be cycled

pub mod config;
pub mod engine;
pub mod error;
pub mod handler;
pub mod protocols;
pub mod runtime;

pub use config::{CliArgs, Config, ConfigError};
pub use engine::Engine;
pub use error::{SendError, StartupError, TransportError};
pub use handler::Handler;
pub use protocols::echo::{EchoHandler, EchoStats};
pub use runtime::{Connection, ConnectionId, IoOperation, OpId, OpKind, OperationPool};
