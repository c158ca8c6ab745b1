// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Single-threaded readiness-based event loop.
//!
//! The reactor owns the multiplexer, the `Slab` of live connections, and the listener's accept
//! loop. Parsing and response construction (`Connection::process`) run directly on this thread by
//! default; the worker pool exists for the case where a dispatch handler does real work (a
//! database round trip), so a slow request can't stall every other connection's I/O.
//!
//! Re-arming a connection after a worker finishes is the one place this design departs from doing
//! everything inline: a worker thread must never call back into `Registry::reregister` itself,
//! since the `Poll` and its `Slab` are only ever touched from the reactor thread. Instead each
//! worker result flows back over an MPSC channel, and a [`mio::Waker`] token wakes the reactor's
//! `poll()` call so it can drain that channel and re-arm promptly even with no socket readiness
//! events pending.

use std::{
    io::ErrorKind,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex,
    },
    time::Duration,
};

use mio::{net::TcpListener, Events, Interest, Poll, Token, Waker};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v0_8::Signals;
use slab::Slab;
use tracing::{debug, info, warn};

use crate::{
    config::TriggerMode,
    connection::{Connection, ProcessOutcome, RequestContext},
    timer::{TimerKey, TimerKeyGenerator, TimerWheel},
    workerpool::WorkerPool,
};

const LISTENER_TOKEN: Token = Token(usize::MAX - 1);
const WAKER_TOKEN: Token = Token(usize::MAX - 2);
const SIGNAL_TOKEN: Token = Token(usize::MAX - 3);

/// Events that reach the reactor thread from somewhere other than socket readiness: a worker
/// finishing `Process()`, or the timer wheel declaring a connection idle. Both arrive on the same
/// channel and both wake the same `Waker`, but they are handled differently — a finished worker
/// re-arms for `WRITABLE`, an idle timeout closes the connection outright.
enum WakeEvent {
    ProcessDone(Token),
    IdleTimeout(Token),
}

/// The reactor's live state: multiplexer, connection table, and the channels used to hear back
/// from the worker pool and the timer wheel.
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    connections: Slab<Arc<Mutex<Connection>>>,
    waker: Arc<Waker>,
    completed_rx: Receiver<WakeEvent>,
    completed_tx: Sender<WakeEvent>,
    signals: Signals,
    timer_keys: TimerKeyGenerator,
    timer: Arc<TimerWheel>,
    workers: WorkerPool,
    ctx: RequestContext,
    trigger_mode: TriggerMode,
    timeout_ms: u64,
    max_fd: usize,
    max_events: usize,
    shutting_down: bool,
    shutdown_flag: Arc<AtomicBool>,
}

/// A cheap, cloneable handle that can request the reactor stop, from any thread — used for
/// programmatic shutdown (tests, embedders) alongside the OS-signal path.
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Requests the reactor stop after its current batch of events finishes processing.
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

impl std::fmt::Debug for ShutdownHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownHandle").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("connections", &self.connections.len())
            .field("trigger_mode", &self.trigger_mode)
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}

impl Reactor {
    /// Builds a reactor bound to `addr`, wiring in the timer wheel and worker pool it will drive.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listener: TcpListener,
        ctx: RequestContext,
        timer: Arc<TimerWheel>,
        workers: WorkerPool,
        trigger_mode: TriggerMode,
        timeout_ms: u64,
        max_fd: usize,
        max_events: usize,
    ) -> Result<Self, crate::error::ServerError> {
        let poll = Poll::new().map_err(crate::error::ServerError::PollCreate)?;

        let mut listener = listener;
        let listener_interest = if trigger_mode.listener_is_edge_triggered() {
            Interest::READABLE.add(Interest::WRITABLE)
        } else {
            Interest::READABLE
        };
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, listener_interest)
            .map_err(crate::error::ServerError::Bind)?;

        let waker =
            Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(crate::error::ServerError::PollCreate)?);

        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(crate::error::ServerError::SignalHandler)?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)
            .map_err(crate::error::ServerError::SignalHandler)?;

        let (completed_tx, completed_rx) = mpsc::channel();

        Ok(Self {
            poll,
            listener,
            connections: Slab::new(),
            waker,
            completed_rx,
            completed_tx,
            signals,
            timer_keys: TimerKeyGenerator::default(),
            timer,
            workers,
            ctx,
            trigger_mode,
            timeout_ms,
            max_fd,
            max_events,
            shutting_down: false,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns a cloneable handle other threads can use to stop this reactor.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            flag: Arc::clone(&self.shutdown_flag),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Runs the event loop until a shutdown signal arrives, or a [`ShutdownHandle`] is used.
    pub fn run(&mut self) {
        let mut events = Events::with_capacity(self.max_events);

        while !self.shutting_down && !self.shutdown_flag.load(Ordering::SeqCst) {
            match self.poll.poll(&mut events, None) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "poll() failed");
                    break;
                }
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept(),
                    WAKER_TOKEN => self.drain_completed(),
                    SIGNAL_TOKEN => self.drain_signals(),
                    token => self.on_connection_event(token, event.is_readable(), event.is_writable()),
                }
            }
        }

        info!("reactor shutting down");
    }

    fn drain_signals(&mut self) {
        for signal in self.signals.pending() {
            info!(signal, "shutdown signal received");
            self.shutting_down = true;
        }
    }

    /// Drains the worker-completion channel and re-arms each finished connection for the next
    /// write attempt. This is the only path by which a worker's result touches the `Poll`
    /// registry; the worker thread itself never does.
    fn drain_completed(&mut self) {
        while let Ok(event) = self.completed_rx.try_recv() {
            match event {
                WakeEvent::ProcessDone(token) => {
                    if let Some(conn) = self.connections.get(token.0) {
                        let conn = Arc::clone(conn);
                        self.rearm(token, &conn, Interest::WRITABLE);
                    }
                }
                WakeEvent::IdleTimeout(token) => {
                    debug!(token = token.0, "closing connection: idle timeout");
                    self.close_conn(token);
                }
            }
        }
    }

    fn accept(&mut self) {
        loop {
            let (stream, addr) = match self.listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if matches!(e.raw_os_error(), Some(libc_emfile) if is_fd_exhaustion(libc_emfile)) => {
                    warn!(error = %e, "fd exhaustion accepting connection, backing off");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "accept() failed");
                    return;
                }
            };

            if self.connections.len() >= self.max_fd {
                debug!(peer = %addr, "rejecting connection: at max_fd capacity");
                self.reject_busy(stream);
                continue;
            }

            self.add_client(stream, addr);
        }
    }

    fn reject_busy(&self, mut stream: mio::net::TcpStream) {
        use parser::{response::Response, status::Status, version::Version};
        use std::io::Write as _;

        let response = Response::status_only(Version::Http11, Status::ServiceUnavailable);
        let mut out = Vec::new();
        response.serialize_into(&mut out);
        let _ = stream.write_all(&out);
    }

    fn add_client(&mut self, stream: mio::net::TcpStream, addr: SocketAddr) {
        let entry = self.connections.vacant_entry();
        let token = Token(entry.key());
        let timer_key = self.timer_keys.next();

        let mut conn = Connection::new(
            stream,
            addr,
            token,
            timer_key,
            self.trigger_mode.connection_is_edge_triggered(),
        );

        // A fresh socket has nothing queued to write yet; arming `WRITABLE` here would have epoll
        // fire immediately (a new socket is always writable) before `Process()` has produced a
        // response, tearing the connection down before it serves anything. `WRITABLE` is added
        // later, in `rearm`, once a worker actually has output ready.
        if self
            .poll
            .registry()
            .register(conn.stream_mut(), token, Interest::READABLE)
            .is_err()
        {
            return;
        }

        if self.timeout_ms != 0 {
            let waker = Arc::clone(&self.waker);
            let tx = self.completed_tx.clone();
            self.timer.schedule(timer_key, self.timeout_ms, move || {
                let _ = tx.send(WakeEvent::IdleTimeout(token));
                let _ = waker.wake();
            });
        }
        entry.insert(Arc::new(Mutex::new(conn)));
        debug!(peer = %addr, token = token.0, "accepted connection");
    }

    fn extend_timeout(&self, token: Token, timer_key: TimerKey) {
        if self.timeout_ms == 0 {
            return;
        }
        let waker = Arc::clone(&self.waker);
        let tx = self.completed_tx.clone();
        self.timer.schedule(timer_key, self.timeout_ms, move || {
            let _ = tx.send(WakeEvent::IdleTimeout(token));
            let _ = waker.wake();
        });
    }

    fn on_connection_event(&mut self, token: Token, readable: bool, writable: bool) {
        let Some(conn) = self.connections.get(token.0).cloned() else {
            return;
        };

        self.extend_timeout(token, conn.lock().unwrap().timer_key());

        if readable {
            self.on_read(token, &conn);
        }
        if writable && self.connections.contains(token.0) {
            self.on_write(token, &conn);
        }
    }

    fn on_read(&mut self, token: Token, conn: &Arc<Mutex<Connection>>) {
        let mut guard = conn.lock().unwrap();
        match guard.read() {
            Ok(_) if guard.is_closed() => {
                drop(guard);
                self.close_conn(token);
                return;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(_) => {
                drop(guard);
                self.close_conn(token);
                return;
            }
        }
        drop(guard);
        self.on_process(token, conn);
    }

    /// Enqueues a `Process()` call, unless one is already in flight for this connection. At most
    /// one worker task per connection runs at a time — otherwise a second, racing `Process()` call
    /// could overwrite the first response's `output`/`pending_body` before it gets written. The
    /// bytes behind a skipped call stay in `input` and are retried on the next readable event, once
    /// the in-flight task's response has been written (see `on_write`).
    fn on_process(&mut self, token: Token, conn: &Arc<Mutex<Connection>>) {
        {
            let mut guard = conn.lock().unwrap();
            if guard.is_processing() {
                return;
            }
            guard.mark_processing();
        }

        let conn_for_worker = Arc::clone(conn);
        let ctx = self.ctx.clone();
        let tx = self.completed_tx.clone();
        let waker = Arc::clone(&self.waker);

        let enqueue_result = self.workers.enqueue(Box::new(move || {
            let outcome = conn_for_worker.lock().unwrap().process(&ctx);
            match outcome {
                ProcessOutcome::ReadyToWrite => {
                    let _ = tx.send(WakeEvent::ProcessDone(token));
                    let _ = waker.wake();
                }
                ProcessOutcome::WantMoreData => {
                    // Nothing to write; the connection is immediately eligible for another
                    // `Process()` call once more bytes arrive.
                    conn_for_worker.lock().unwrap().clear_processing();
                }
            }
        }));

        if enqueue_result.is_err() {
            conn.lock().unwrap().clear_processing();
            self.close_conn(token);
        }
    }

    fn on_write(&mut self, token: Token, conn: &Arc<Mutex<Connection>>) {
        let (result, write_complete, keep_alive) = {
            let mut guard = conn.lock().unwrap();
            let result = guard.write();
            (result, guard.write_complete(), guard.is_keep_alive())
        };

        match result {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return,
            Err(_) => {
                self.close_conn(token);
                return;
            }
        }

        if !write_complete {
            return;
        }

        if keep_alive {
            {
                let mut guard = conn.lock().unwrap();
                guard.reset_for_next_request();
                // The response is fully on the wire; the connection is eligible for another
                // `Process()` call again.
                guard.clear_processing();
            }
            self.rearm(token, conn, Interest::READABLE);
        } else {
            self.close_conn(token);
        }
    }

    /// Re-registers a connection's interest set, used both after a keep-alive response drains and
    /// after a worker finishes processing and the connection needs `WRITABLE` readiness. `WRITABLE`
    /// is only ever requested by the caller when there is actually output pending — never added
    /// blanket here, since a writable-but-idle socket would otherwise fire immediately.
    fn rearm(&self, token: Token, conn: &Arc<Mutex<Connection>>, interest: Interest) {
        let interest = if self.trigger_mode.connection_is_edge_triggered() {
            interest.add(Interest::READABLE)
        } else {
            interest
        };
        let mut guard = conn.lock().unwrap();
        let _ = self.poll.registry().reregister(guard.stream_mut(), token, interest);
    }

    fn close_conn(&mut self, token: Token) {
        if !self.connections.contains(token.0) {
            return;
        }
        let conn = self.connections.remove(token.0);
        let mut guard = conn.lock().unwrap();
        let _ = self.poll.registry().deregister(guard.stream_mut());
        self.timer.cancel(guard.timer_key());
        guard.close();
    }
}

fn is_fd_exhaustion(errno: i32) -> bool {
    const EMFILE: i32 = 24;
    const ENFILE: i32 = 23;
    errno == EMFILE || errno == ENFILE
}

/// Blocks the calling thread briefly; used only when backing off from transient fd exhaustion.
#[allow(dead_code)]
fn backoff() {
    std::thread::sleep(Duration::from_millis(10));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::TriggerMode, dbpool::DbPool, static_files::StaticFiles};
    use std::{
        io::{Read as _, Write as _},
        net::TcpStream as StdTcpStream,
        time::Duration as StdDuration,
    };

    #[test]
    fn fd_exhaustion_errnos_are_recognized() {
        assert!(is_fd_exhaustion(24));
        assert!(is_fd_exhaustion(23));
        assert!(!is_fd_exhaustion(32));
    }

    fn temp_static_dir(file_name: &str, contents: &[u8]) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "rask-reactor-test-{}-{}",
            std::process::id(),
            file_name
        ));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::File::create(dir.join(file_name))
            .unwrap()
            .write_all(contents)
            .unwrap();
        dir
    }

    struct TestReactor {
        addr: SocketAddr,
        shutdown: ShutdownHandle,
        join: std::thread::JoinHandle<()>,
        timer: Arc<TimerWheel>,
        dir: std::path::PathBuf,
    }

    impl TestReactor {
        fn stop(self) {
            self.shutdown.shutdown();
            self.join.join().unwrap();
            self.timer.close();
            std::fs::remove_dir_all(&self.dir).unwrap();
        }
    }

    fn spawn_reactor(trigger_mode: TriggerMode, timeout_ms: u64, static_dir: std::path::PathBuf) -> TestReactor {
        spawn_reactor_with_max_fd(trigger_mode, timeout_ms, static_dir, 16)
    }

    fn spawn_reactor_with_max_fd(
        trigger_mode: TriggerMode,
        timeout_ms: u64,
        static_dir: std::path::PathBuf,
        max_fd: usize,
    ) -> TestReactor {
        let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();

        let ctx = RequestContext {
            static_files: Arc::new(StaticFiles::new(static_dir.clone())),
            db_pool: DbPool::empty_for_tests(1),
        };
        let timer = Arc::new(TimerWheel::new(10, 64));
        timer.run();
        let workers = WorkerPool::new(1, 8);

        let mut reactor = Reactor::new(
            listener,
            ctx,
            Arc::clone(&timer),
            workers,
            trigger_mode,
            timeout_ms,
            max_fd,
            128,
        )
        .unwrap();
        let shutdown = reactor.shutdown_handle();

        let join = std::thread::Builder::new()
            .name("test-reactor".into())
            .spawn(move || reactor.run())
            .unwrap();

        TestReactor {
            addr,
            shutdown,
            join,
            timer,
            dir: static_dir,
        }
    }

    #[test]
    fn serves_static_file_over_loopback() {
        let dir = temp_static_dir("hello.txt", b"hello reactor");
        let reactor = spawn_reactor(TriggerMode::LevelLevel, 0, dir);

        let mut client = StdTcpStream::connect(reactor.addr).unwrap();
        client
            .write_all(b"GET /hello.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        let text = String::from_utf8_lossy(&response);

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 13\r\n"));
        assert!(text.ends_with("hello reactor"));

        reactor.stop();
    }

    #[test]
    fn keep_alive_serves_two_requests_on_one_connection() {
        let dir = temp_static_dir("a.txt", b"AAA");
        let reactor = spawn_reactor(TriggerMode::EdgeEdge, 0, dir);

        let mut client = StdTcpStream::connect(reactor.addr).unwrap();
        client
            .write_all(b"GET /a.txt HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let mut buf = [0u8; 4096];
        let n = client.read(&mut buf).unwrap();
        let first = String::from_utf8_lossy(&buf[..n]);
        assert!(first.contains("200 OK"));
        assert!(first.ends_with("AAA"));

        client
            .write_all(b"GET /a.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut second_buf = Vec::new();
        client.read_to_end(&mut second_buf).unwrap();
        let second = String::from_utf8_lossy(&second_buf);
        assert!(second.contains("200 OK"));

        reactor.stop();
    }

    #[test]
    fn idle_connection_is_evicted_after_timeout() {
        let dir = temp_static_dir("b.txt", b"B");
        let reactor = spawn_reactor(TriggerMode::LevelLevel, 20, dir);

        let mut client = StdTcpStream::connect(reactor.addr).unwrap();
        client
            .set_read_timeout(Some(StdDuration::from_secs(2)))
            .unwrap();

        // Send nothing; the idle timer should close the connection from the server side.
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap_or(0);
        assert_eq!(n, 0, "expected the peer to close the idle connection");

        reactor.stop();
    }

    #[test]
    fn rejects_connections_past_max_fd() {
        let dir = temp_static_dir("c.txt", b"C");
        let reactor = spawn_reactor_with_max_fd(TriggerMode::LevelLevel, 0, dir, 1);

        // Held open so the reactor's connection count stays at capacity.
        let _held = StdTcpStream::connect(reactor.addr).unwrap();
        std::thread::sleep(StdDuration::from_millis(50));

        let mut rejected = StdTcpStream::connect(reactor.addr).unwrap();
        let mut response = Vec::new();
        rejected.read_to_end(&mut response).unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));

        reactor.stop();
    }

    #[test]
    fn unknown_path_returns_not_found() {
        let dir = temp_static_dir("present.txt", b"x");
        let reactor = spawn_reactor(TriggerMode::LevelLevel, 0, dir);

        let mut client = StdTcpStream::connect(reactor.addr).unwrap();
        client
            .write_all(b"GET /missing.txt HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n")
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).unwrap();
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));

        reactor.stop();
    }
}
