//! Integration tests: a real engine driven over loopback TCP.
//!
//! Each test starts an engine on an ephemeral port with a recording handler,
//! connects with std TCP clients, and checks the callbacks it observed.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use completion_server::{
    Config, Connection, ConnectionId, Engine, Handler, IoOperation, SendError, StartupError,
    TransportError,
};
use parking_lot::Mutex;

// ── Recording handler ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Accepted(ConnectionId),
    Closed(ConnectionId),
    Error(ConnectionId, i32),
    Recv(ConnectionId, Vec<u8>),
    Sent(ConnectionId, usize),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    in_callback: Mutex<HashSet<ConnectionId>>,
    overlapped: AtomicBool,
    echo: bool,
    greeting: Option<Vec<u8>>,
    recv_delay: Option<Duration>,
}

impl Recorder {
    fn echo() -> Self {
        Self {
            echo: true,
            ..Self::default()
        }
    }

    fn enter(&self, conn: &Connection) {
        if !self.in_callback.lock().insert(conn.id()) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
    }

    fn exit(&self, conn: &Connection) {
        self.in_callback.lock().remove(&conn.id());
    }

    fn record(&self, event: Event) {
        self.events.lock().push(event);
    }

    fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|e| pred(e)).count()
    }

    fn accepted(&self) -> usize {
        self.count(|e| matches!(e, Event::Accepted(_)))
    }

    fn closed(&self) -> usize {
        self.count(|e| matches!(e, Event::Closed(_)))
    }

    fn errors(&self) -> usize {
        self.count(|e| matches!(e, Event::Error(..)))
    }

    fn received(&self, id: ConnectionId) -> Vec<u8> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Recv(c, data) if *c == id => Some(data.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn bytes_sent(&self) -> usize {
        self.events
            .lock()
            .iter()
            .map(|e| match e {
                Event::Sent(_, n) => *n,
                _ => 0,
            })
            .sum()
    }

    fn connected(&self) -> usize {
        self.connections.lock().len()
    }

    fn connection(&self, index: usize) -> Arc<Connection> {
        Arc::clone(&self.connections.lock()[index])
    }
}

impl Handler for Recorder {
    fn on_connection_accepted(&self, conn: &Arc<Connection>) {
        self.enter(conn);
        self.record(Event::Accepted(conn.id()));
        self.connections.lock().push(Arc::clone(conn));
        if let Some(greeting) = &self.greeting {
            conn.send(greeting).unwrap();
        }
        self.exit(conn);
    }

    fn on_connection_closed(&self, conn: &Arc<Connection>) {
        self.enter(conn);
        self.record(Event::Closed(conn.id()));
        self.exit(conn);
    }

    fn on_connection_error(&self, conn: &Arc<Connection>, error: &TransportError) {
        self.enter(conn);
        self.record(Event::Error(conn.id(), error.code()));
        self.exit(conn);
    }

    fn on_recv_completed(&self, conn: &Arc<Connection>, data: &[u8]) {
        self.enter(conn);
        self.record(Event::Recv(conn.id(), data.to_vec()));
        if let Some(delay) = self.recv_delay {
            thread::sleep(delay);
        }
        if data.starts_with(b"slow") {
            let _ = conn.send(data);
            thread::sleep(SLOW_CALLBACK);
            self.exit(conn);
            return;
        }
        if data.starts_with(b"panic") {
            self.exit(conn);
            panic!("handler asked to panic");
        }
        if data.ends_with(b"bye") {
            conn.close();
        } else if self.echo {
            let _ = conn.send(data);
        }
        self.exit(conn);
    }

    fn on_send_completed(&self, conn: &Arc<Connection>, op: &IoOperation) {
        self.enter(conn);
        self.record(Event::Sent(conn.id(), op.transferred()));
        self.exit(conn);
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// How long a recv callback for a payload starting with `slow` blocks.
const SLOW_CALLBACK: Duration = Duration::from_millis(1500);

fn test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        workers: Some(2),
        accept_depth: 2,
        ..Config::default()
    }
}

fn start(recorder: Recorder) -> (Engine<Recorder>, Arc<Recorder>) {
    start_with(test_config(), recorder)
}

fn start_with(config: Config, recorder: Recorder) -> (Engine<Recorder>, Arc<Recorder>) {
    let recorder = Arc::new(recorder);
    let engine = Engine::with_handler(config, Arc::clone(&recorder));
    engine.start(0).expect("start failed");
    (engine, recorder)
}

fn connect(engine: &Engine<Recorder>) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", engine.port())).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Read until EOF or error; true if the server closed the stream.
fn closed_by_server(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 64];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => return true,
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                return e.kind() != io::ErrorKind::WouldBlock && e.kind() != io::ErrorKind::TimedOut
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn echo_round_trip() {
    let (engine, recorder) = start(Recorder::echo());
    let mut stream = connect(&engine);

    let msg = b"Hello, completion engine!";
    stream.write_all(msg).unwrap();

    let mut buf = vec![0u8; msg.len()];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(buf, msg);

    assert!(wait_until(|| recorder.bytes_sent() == msg.len()));
    engine.stop();
}

#[test]
fn connects_and_disconnects_return_count_to_zero() {
    let (engine, recorder) = start(Recorder::echo());

    let streams: Vec<TcpStream> = (0..10).map(|_| connect(&engine)).collect();
    assert!(wait_until(|| recorder.connected() == 10));
    assert_eq!(engine.connection_count(), 10);

    drop(streams);
    assert!(wait_until(|| engine.connection_count() == 0));
    assert!(wait_until(|| recorder.closed() == 10));
    assert_eq!(recorder.errors(), 0);

    // Only the accept pipeline still holds operations
    assert!(wait_until(|| engine.pool().outstanding() == engine.pending_accepts()));
    assert_eq!(engine.pending_accepts(), 2);
    for i in 0..10 {
        assert_eq!(recorder.connection(i).outstanding_operations(), 0);
    }

    engine.stop();
    assert_eq!(engine.pool().outstanding(), 0);
}

#[test]
fn graceful_close_reports_closed_once() {
    let (engine, recorder) = start(Recorder::echo());

    let stream = connect(&engine);
    assert!(wait_until(|| recorder.connected() == 1));
    let id = recorder.connection(0).id();
    drop(stream);

    assert!(wait_until(|| recorder.closed() == 1));
    thread::sleep(Duration::from_millis(100));

    let events = recorder.events();
    assert_eq!(events, vec![Event::Accepted(id), Event::Closed(id)]);
    assert!(recorder.connection(0).is_closed());
    engine.stop();
}

#[test]
fn abortive_close_reports_error_once() {
    let (engine, recorder) = start(Recorder::echo());

    let stream = connect(&engine);
    assert!(wait_until(|| engine.connection_count() == 1));

    // Linger of zero turns close into a reset
    let socket = socket2::Socket::from(stream);
    socket.set_linger(Some(Duration::ZERO)).unwrap();
    drop(socket);

    assert!(wait_until(|| recorder.errors() == 1));
    thread::sleep(Duration::from_millis(100));

    assert_eq!(recorder.errors(), 1);
    assert_eq!(recorder.closed(), 0);
    let code = recorder
        .events()
        .iter()
        .find_map(|e| match e {
            Event::Error(_, code) => Some(*code),
            _ => None,
        })
        .unwrap();
    assert_ne!(code, 0);
    assert_eq!(engine.connection_count(), 0);
    engine.stop();
}

#[test]
fn receives_are_ordered_and_never_overlap() {
    let recorder = Recorder {
        recv_delay: Some(Duration::from_millis(2)),
        ..Recorder::default()
    };
    let (engine, recorder) = start(recorder);

    let mut stream = connect(&engine);
    assert!(wait_until(|| recorder.connected() == 1));
    let id = recorder.connection(0).id();

    let mut expected = Vec::new();
    for i in 0..50 {
        let msg = format!("M{i};");
        stream.write_all(msg.as_bytes()).unwrap();
        expected.extend_from_slice(msg.as_bytes());
        if i % 10 == 0 {
            thread::sleep(Duration::from_millis(5));
        }
    }

    assert!(wait_until(|| recorder.received(id).len() == expected.len()));
    assert_eq!(recorder.received(id), expected);
    assert!(!recorder.overlapped.load(Ordering::SeqCst));
    engine.stop();
}

#[test]
fn busy_connection_does_not_starve_others() {
    let (engine, recorder) = start(Recorder::echo());

    let mut slow = connect(&engine);
    assert!(wait_until(|| recorder.connected() == 1));
    let slow_id = recorder.connection(0).id();
    slow.write_all(b"slow").unwrap();
    assert!(wait_until(|| recorder.received(slow_id) == b"slow"));

    // The echo's send completion for the sleeping connection lands on the
    // other worker, which must go on serving other clients
    let mut echo = [0u8; 4];
    slow.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, b"slow");

    let started = Instant::now();
    let mut fast = connect(&engine);
    fast.write_all(b"ping").unwrap();
    fast.read_exact(&mut echo).unwrap();
    assert_eq!(&echo, b"ping");
    assert!(
        started.elapsed() < SLOW_CALLBACK / 2,
        "unrelated connection waited {:?}",
        started.elapsed()
    );

    // The deferred send completion is delivered once the callback returns
    assert!(wait_until(|| recorder.count(|e| *e == Event::Sent(slow_id, 4)) == 1));
    assert!(!recorder.overlapped.load(Ordering::SeqCst));
    engine.stop();
}

#[test]
fn second_start_fails_without_disturbing_first() {
    let (engine, recorder) = start(Recorder::echo());

    let _stream = connect(&engine);
    assert!(wait_until(|| recorder.connected() == 1));
    let port = engine.port();

    assert!(matches!(engine.start(0), Err(StartupError::AlreadyRunning)));
    assert_eq!(engine.connection_count(), 1);
    assert_eq!(engine.port(), port);
    assert!(engine.is_running());
    assert_eq!(recorder.accepted(), 1);
    engine.stop();
}

#[test]
fn accept_pipeline_is_replenished() {
    let (engine, recorder) = start(Recorder::echo());
    assert!(wait_until(|| engine.pending_accepts() == 2));

    let a = connect(&engine);
    let b = connect(&engine);

    assert!(wait_until(|| recorder.accepted() == 2));
    assert!(wait_until(|| engine.pending_accepts() == 2));
    assert_eq!(engine.connection_count(), 2);

    drop((a, b));
    engine.stop();
}

#[test]
fn stop_closes_every_connection() {
    let (engine, recorder) = start(Recorder::echo());

    let mut streams: Vec<TcpStream> = (0..5).map(|_| connect(&engine)).collect();
    assert!(wait_until(|| engine.connection_count() == 5));

    engine.stop();

    // Delivered before stop returned
    assert_eq!(recorder.closed() + recorder.errors(), 5);
    assert_eq!(engine.connection_count(), 0);
    assert_eq!(engine.pending_accepts(), 0);
    assert_eq!(engine.pool().outstanding(), 0);
    assert!(!engine.is_running());

    for stream in &mut streams {
        assert!(closed_by_server(stream));
    }
}

#[test]
fn large_send_survives_slow_reader() {
    const SIZE: usize = 1024 * 1024;
    let payload: Vec<u8> = (0..SIZE).map(|i| (i % 251) as u8).collect();

    let recorder = Recorder {
        greeting: Some(payload.clone()),
        ..Recorder::default()
    };
    let (engine, recorder) = start(recorder);

    let mut stream = connect(&engine);
    thread::sleep(Duration::from_millis(300));

    let mut received = Vec::with_capacity(SIZE);
    let mut chunk = vec![0u8; 16 * 1024];
    while received.len() < SIZE {
        let n = stream.read(&mut chunk).unwrap();
        assert_ne!(n, 0, "server closed early");
        received.extend_from_slice(&chunk[..n]);
        thread::sleep(Duration::from_millis(1));
    }

    assert_eq!(received.len(), SIZE);
    assert!(received == payload);
    assert!(wait_until(|| recorder.bytes_sent() == SIZE));
    assert_eq!(recorder.errors(), 0);
    engine.stop();
}

#[test]
fn send_after_close_is_rejected() {
    let (engine, recorder) = start(Recorder::echo());

    let mut stream = connect(&engine);
    assert!(wait_until(|| recorder.connected() == 1));
    let conn = recorder.connection(0);

    assert_eq!(conn.send(b""), Err(SendError::EmptyPayload));

    engine.close(&conn);
    assert_eq!(conn.send(b"late"), Err(SendError::ConnectionClosed));
    assert!(wait_until(|| recorder.closed() == 1));
    assert!(closed_by_server(&mut stream));

    engine.stop();
    assert_eq!(engine.send(&conn, b"later"), Err(SendError::NotRunning));
    assert_eq!(conn.send(b"later"), Err(SendError::NotRunning));
}

#[test]
fn handler_can_close_from_callback() {
    let (engine, recorder) = start(Recorder::echo());

    let mut stream = connect(&engine);
    stream.write_all(b"bye").unwrap();

    assert!(closed_by_server(&mut stream));
    assert!(wait_until(|| recorder.closed() == 1));
    assert_eq!(recorder.errors(), 0);
    assert_eq!(engine.connection_count(), 0);
    engine.stop();
}

#[test]
fn handler_panic_becomes_connection_error() {
    let (engine, recorder) = start(Recorder::echo());

    let mut stream = connect(&engine);
    stream.write_all(b"panic").unwrap();

    assert!(wait_until(|| recorder.errors() == 1));
    assert_eq!(recorder.closed(), 0);
    assert!(closed_by_server(&mut stream));

    // Other connections are unaffected
    let mut other = connect(&engine);
    other.write_all(b"still here").unwrap();
    let mut buf = [0u8; 10];
    other.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"still here");
    engine.stop();
}

#[test]
fn connections_beyond_limit_are_refused() {
    let config = Config {
        max_connections: 1,
        ..test_config()
    };
    let (engine, recorder) = start_with(config, Recorder::echo());

    let _first = connect(&engine);
    assert!(wait_until(|| recorder.connected() == 1));

    let mut second = connect(&engine);
    assert!(closed_by_server(&mut second));
    assert_eq!(engine.connection_count(), 1);
    assert_eq!(recorder.accepted(), 1);
    assert_eq!(recorder.closed() + recorder.errors(), 0);
    engine.stop();
}

#[test]
fn restart_serves_again() {
    let (engine, recorder) = start(Recorder::echo());
    engine.stop();
    assert!(!engine.is_running());

    engine.start(0).unwrap();
    let mut stream = connect(&engine);
    stream.write_all(b"again").unwrap();
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"again");
    assert_eq!(recorder.accepted(), 1);
    engine.stop();
}
