//! The server engine: lifecycle, listener setup and the public API.
//!
//! `start` builds a running instance (listener, reactor thread, worker
//! threads, queues); `stop` drains it and tears it down. The operation pool
//! and counters belong to the engine and survive start/stop cycles.

use crate::config::Config;
use crate::error::{SendError, StartupError};
use crate::handler::Handler;
use crate::runtime::dispatcher::{run_worker, Counters, Shared};
use crate::runtime::reactor::{Reactor, WAKER_TOKEN};
use crate::runtime::{Completion, Connection, OperationPool, Submission};
use crossbeam_channel::{unbounded, Receiver};
use mio::{Poll, Waker};
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};

/// Completion-driven TCP server engine.
///
/// ```no_run
/// use completion_server::{Config, Engine, EchoHandler};
///
/// let engine = Engine::new(Config::default(), EchoHandler::default());
/// engine.start(0)?;
/// println!("listening on {}", engine.port());
/// engine.stop();
/// # Ok::<(), completion_server::StartupError>(())
/// ```
pub struct Engine<H: Handler> {
    config: Config,
    handler: Arc<H>,
    pool: Arc<OperationPool>,
    counters: Arc<Counters>,
    running: Mutex<Option<Running>>,
    port: AtomicU16,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// Everything owned by one start/stop cycle.
struct Running {
    shared: Arc<Shared>,
    reactor: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
    /// Kept so leftovers can be drained once the reactor is gone.
    submissions: Receiver<Submission>,
    completions: Receiver<Completion>,
}

impl<H: Handler> Engine<H> {
    pub fn new(config: Config, handler: H) -> Self {
        Self::with_handler(config, Arc::new(handler))
    }

    /// Create an engine around a handler the caller keeps a reference to.
    pub fn with_handler(config: Config, handler: Arc<H>) -> Self {
        let pool = Arc::new(OperationPool::new(
            config.initial_operations,
            config.buffer_size,
        ));

        Self {
            config,
            handler,
            pool,
            counters: Arc::new(Counters::default()),
            running: Mutex::new(None),
            port: AtomicU16::new(0),
            local_addr: Mutex::new(None),
        }
    }

    /// Bind `port` on the configured host and start serving.
    ///
    /// Port 0 binds an ephemeral port; see [`port`](Self::port). On failure
    /// everything created so far is released and the engine stays stopped.
    pub fn start(&self, port: u16) -> Result<(), StartupError> {
        let mut running = self.running.lock();
        if running.is_some() {
            if self.is_running() {
                return Err(StartupError::AlreadyRunning);
            }
            if let Some(halted) = running.take() {
                warn!("Reclaiming an instance halted by a reactor failure");
                halted.shutdown();
            }
        }

        let addr = resolve(&self.config.host, port)?;

        let poll = Poll::new().map_err(StartupError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(StartupError::Poll)?;

        let listener = create_listener(addr, self.config.listen_backlog)
            .map_err(|source| StartupError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| StartupError::Bind { addr, source })?;
        let listener = mio::net::TcpListener::from_std(listener);

        let (submission_tx, submission_rx) = unbounded();
        let (completion_tx, completion_rx) = unbounded();

        let shared = Shared::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.counters),
            local_addr,
            self.config.max_connections,
            self.config.accept_depth,
            submission_tx,
            waker,
            completion_tx,
        );

        let reactor = Reactor::new(
            poll,
            listener,
            submission_rx.clone(),
            Arc::clone(&shared),
            self.config.events_capacity,
        )
        .map_err(StartupError::Poll)?;

        let reactor = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || reactor.run())
            .map_err(StartupError::Thread)?;

        let mut instance = Running {
            shared,
            reactor: Some(reactor),
            workers: Vec::new(),
            submissions: submission_rx,
            completions: completion_rx,
        };

        let num_workers = self.config.worker_threads();
        for worker_id in 0..num_workers {
            let shared = Arc::clone(&instance.shared);
            let handler = Arc::clone(&self.handler);
            let completions = instance.completions.clone();

            let spawned = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || run_worker(worker_id, shared, handler, completions));

            match spawned {
                Ok(handle) => instance.workers.push(handle),
                Err(e) => {
                    error!(worker = worker_id, error = %e, "Failed to spawn worker");
                    instance.shutdown();
                    return Err(StartupError::Thread(e));
                }
            }
        }

        instance.shared.replenish_accepts();

        info!(
            addr = %local_addr,
            workers = num_workers,
            accept_depth = self.config.accept_depth,
            buffer_size = self.pool.buffer_size(),
            "Engine started"
        );

        self.port.store(local_addr.port(), Ordering::Release);
        *self.local_addr.lock() = Some(local_addr);
        self.counters.running.store(true, Ordering::Release);
        *running = Some(instance);
        Ok(())
    }

    /// Close every connection, join all threads and release the listener.
    ///
    /// Every live connection receives its closed (or error) callback before
    /// this returns. Does nothing when the engine was never started. Must not
    /// be called from inside a handler callback.
    pub fn stop(&self) {
        let mut running = self.running.lock();
        let Some(instance) = running.take() else {
            return;
        };

        self.counters.running.store(false, Ordering::Release);
        instance.shutdown();

        self.port.store(0, Ordering::Release);
        *self.local_addr.lock() = None;
        info!(
            connections = self.connection_count(),
            outstanding_operations = self.pool.outstanding(),
            "Engine stopped"
        );
    }

    /// Post `data` on `conn`. See [`Connection::send`].
    pub fn send(&self, conn: &Arc<Connection>, data: &[u8]) -> Result<(), SendError> {
        if !self.is_running() {
            return Err(SendError::NotRunning);
        }
        conn.send(data)
    }

    /// Request a graceful close of `conn`.
    pub fn close(&self, conn: &Connection) {
        conn.close();
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.counters.connections.load(Ordering::Acquire)
    }

    /// Number of accepts currently outstanding on the listener.
    pub fn pending_accepts(&self) -> usize {
        self.counters.pending_accepts.load(Ordering::Acquire)
    }

    /// Bound port while running, 0 otherwise.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// False once stopped, or after the reactor failed and halted the engine.
    pub fn is_running(&self) -> bool {
        self.counters.running.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &Arc<OperationPool> {
        &self.pool
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

impl<H: Handler> Drop for Engine<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Running {
    fn shutdown(mut self) {
        let shared = Arc::clone(&self.shared);
        shared.begin_shutdown();

        // Stop the reactor first: it closes every socket and returns the
        // operations parked on them.
        let _ = shared.submit(Submission::Shutdown);
        if let Some(reactor) = self.reactor.take() {
            if reactor.join().is_err() {
                error!("Reactor thread panicked");
            }
        }

        let closing = shared.close_all();

        for _ in &self.workers {
            shared.complete(Completion::Exit);
        }
        let workers = self.workers.len();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }

        let mut leftovers = 0;
        while let Ok(submission) = self.submissions.try_recv() {
            shared.discard_submission(submission);
            leftovers += 1;
        }
        while let Ok(completion) = self.completions.try_recv() {
            shared.discard_completion(completion);
            leftovers += 1;
        }

        info!(closing, workers, leftovers, "Engine drained");
    }
}

fn resolve(host: &str, port: u16) -> Result<SocketAddr, StartupError> {
    let invalid = || StartupError::InvalidAddress(format!("{host}:{port}"));
    (host, port)
        .to_socket_addrs()
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

/// Create a non-blocking listening socket.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    #[cfg(unix)]
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
