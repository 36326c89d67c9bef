//! Echo protocol.
//!
//! No framing: each chunk the engine receives is sent back as-is, so the
//! client sees its byte stream mirrored in order. Useful for throughput and
//! correctness testing of the runtime without any protocol overhead.

pub mod handler;

pub use handler::{EchoHandler, EchoStats};
