//! Protocol handlers built on the engine.
//!
//! - `echo`: mirrors received bytes back to the client

pub mod echo;
