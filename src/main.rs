//! completion-server: echo server on the completion engine.
//!
//! Serves the echo protocol until told to quit. An operator console on stdin
//! accepts:
//! - `stats` - print connection and pool counters
//! - `stop` - stop serving, keeping the process alive
//! - `start` - start serving again on the configured port
//! - `quit` - stop and exit
//!
//! When stdin closes the server keeps running.

use completion_server::{Config, EchoHandler, Engine};
use std::io::{self, BufRead};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        workers = config.worker_threads(),
        accept_depth = config.accept_depth,
        buffer_size = config.buffer_size,
        max_connections = config.max_connections,
        "Starting completion-server"
    );

    let port = config.port;
    let handler = Arc::new(EchoHandler::default());
    let engine = Engine::with_handler(config, Arc::clone(&handler));
    engine.start(port)?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match line.trim() {
            "" => {}
            "stats" => print_stats(&engine, &handler),
            "stop" => engine.stop(),
            "start" => {
                if let Err(e) = engine.start(port) {
                    error!(error = %e, "Failed to start");
                }
            }
            "quit" | "exit" => {
                engine.stop();
                return Ok(());
            }
            other => warn!(command = other, "Unknown command (stats, stop, start, quit)"),
        }
    }

    info!("Console closed; serving until the process is terminated");
    loop {
        std::thread::park();
    }
}

fn print_stats(engine: &Engine<EchoHandler>, handler: &EchoHandler) {
    let stats = handler.stats();
    let pool = engine.pool();
    info!(
        running = engine.is_running(),
        port = engine.port(),
        connections = engine.connection_count(),
        pending_accepts = engine.pending_accepts(),
        accepted = stats.accepted,
        closed = stats.closed,
        errors = stats.errors,
        bytes_received = stats.bytes_received,
        bytes_sent = stats.bytes_sent,
        pool_allocated = pool.allocated(),
        pool_available = pool.available(),
        pool_outstanding = pool.outstanding(),
        "Stats"
    );
}
