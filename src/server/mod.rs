/*
 * Copyright (C) 2020-2023 Fanout, Inc.
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub mod connection;
pub mod pool;

use crate::core::config::ServerConfig;
use crate::core::http1::{header, Message, Response, Status, Version};
use crate::core::net;
use crate::router::Router;
use connection::{Connection, ConnectionState, FrameLimits, Incoming};
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use pool::{Completion, Job, WorkerPool};
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);
const SLAB_OFFSET: usize = 2;
const EVENTS_MAX: usize = 1024;

// a panic while routing still yields a response
fn handle_request(router: &Router, raw: &[u8]) -> Response {
    match panic::catch_unwind(AssertUnwindSafe(|| router.handle(raw))) {
        Ok(resp) => resp,
        Err(_) => {
            error!("request handler panicked");

            reject(router, Status::InternalServerError)
        }
    }
}

// error pages go through the resolver, which may panic as well
fn reject(router: &Router, status: Status) -> Response {
    match panic::catch_unwind(AssertUnwindSafe(|| router.reject(status))) {
        Ok(resp) => resp,
        Err(_) => {
            error!("error page for {} panicked", status.code());

            let mut resp = Response::new(Version::Http11, status);
            resp.set_header(header::CONNECTION, "close");
            resp.set_body(status.to_string().into_bytes(), Some("text/plain"));

            resp
        }
    }
}

/// Stops a running server from another thread.
#[derive(Clone)]
pub struct Stopper {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Stopper {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);

        if let Err(e) = self.waker.wake() {
            error!("failed to wake server: {}", e);
        }
    }
}

/// Single-threaded readiness loop serving HTTP/1.x connections. Requests
/// are handled inline, or on a worker pool when configured.
pub struct Server {
    config: ServerConfig,
    poll: Poll,
    listener: TcpListener,
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    router: Arc<Router>,
    conns: Slab<Connection>,
    next_id: u64,
    workers: Option<WorkerPool>,
    done: mpsc::Receiver<Completion>,
}

impl Server {
    pub fn new(config: &ServerConfig, router: Router) -> Result<Self, io::Error> {
        let addr = net::resolve(&config.host, config.port)?;

        let mut listener = TcpListener::bind(addr)?;

        let poll = Poll::new()?;

        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);

        let router = Arc::new(router);

        let (done_s, done_r) = mpsc::channel();

        let workers = if config.thread_pool {
            let router = router.clone();

            let handle_fn = Arc::new(move |raw: &[u8]| handle_request(&router, raw));

            Some(WorkerPool::new(
                config.worker_count(),
                handle_fn,
                done_s,
                waker.clone(),
            )?)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            poll,
            listener,
            waker,
            stop: Arc::new(AtomicBool::new(false)),
            router,
            conns: Slab::new(),
            next_id: 0,
            workers,
            done: done_r,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.listener.local_addr()
    }

    pub fn stopper(&self) -> Stopper {
        Stopper {
            stop: self.stop.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn connections(&self) -> usize {
        self.conns.len()
    }

    /// Runs until stopped. Connection failures are handled per
    /// connection and never end the loop.
    pub fn run(&mut self) -> Result<(), io::Error> {
        let mut events = Events::with_capacity(EVENTS_MAX);

        info!(
            "listening on {} ({})",
            self.local_addr()?,
            match &self.workers {
                Some(w) => format!("{} workers", w.size()),
                None => String::from("inline"),
            }
        );

        while !self.stop.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, Some(self.config.poll_timeout())) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }

                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept(),
                    WAKER_TOKEN => {}
                    token => {
                        let key = token.0 - SLAB_OFFSET;

                        if event.is_readable() || event.is_read_closed() {
                            self.read(key);
                        }

                        self.drive(key);
                    }
                }
            }

            self.process_completions();
        }

        self.shutdown();

        Ok(())
    }

    fn accept(&mut self) {
        loop {
            let (mut stream, peer) = match self.listener.accept() {
                Ok(ret) => ret,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("accept error: {:?}", e);
                    break;
                }
            };

            if self.conns.len() >= self.config.max_connections {
                warn!("connection limit reached, rejecting {}", peer);
                continue;
            }

            net::set_socket_opts(&mut stream);

            self.next_id += 1;

            let entry = self.conns.vacant_entry();
            let key = entry.key();

            let limits = FrameLimits {
                head_max: self.config.max_head_size,
                body_max: self.config.max_body_size,
            };

            let mut conn = Connection::new(self.next_id, stream, peer, limits);

            if let Err(e) = conn.register(self.poll.registry(), Token(key + SLAB_OFFSET)) {
                error!("failed to register connection from {}: {}", peer, e);
                continue;
            }

            debug!("conn {}: accepted {}", conn.id(), peer);

            entry.insert(conn);
        }
    }

    fn read(&mut self, key: usize) {
        let conn = match self.conns.get_mut(key) {
            Some(conn) => conn,
            None => return,
        };

        if let Err(e) = conn.read(self.config.buffer_size) {
            debug!("conn {}: read error: {}", conn.id(), e);

            self.close(key);
        }
    }

    // advances the connection's state machine as far as it can go
    fn drive(&mut self, key: usize) {
        loop {
            let conn = match self.conns.get_mut(key) {
                Some(conn) => conn,
                None => return,
            };

            match conn.state() {
                ConnectionState::Reading => {
                    let raw = match conn.next_request() {
                        Some(Incoming::Request(raw)) => raw,
                        Some(Incoming::Rejected(status)) => {
                            debug!("conn {}: rejected with {}", conn.id(), status);

                            conn.set_state(ConnectionState::Processing);

                            let resp = reject(&self.router, status);
                            self.respond(key, &resp);

                            continue;
                        }
                        None => {
                            if conn.peer_closed() {
                                debug!("conn {}: closed by peer", conn.id());

                                self.close(key);
                            }

                            return;
                        }
                    };

                    conn.set_state(ConnectionState::Processing);

                    let conn_id = conn.id();

                    // falls back to inline handling if the pool is stopping
                    let ret = match &self.workers {
                        Some(workers) => workers
                            .submit(Job { key, conn_id, raw })
                            .map_err(|job| job.raw),
                        None => Err(raw),
                    };

                    if let Err(raw) = ret {
                        let resp = handle_request(&self.router, &raw);
                        self.respond(key, &resp);
                    }
                }
                ConnectionState::Processing => return,
                ConnectionState::Writing => {
                    let done = match conn.write() {
                        Ok(done) => done,
                        Err(e) => {
                            debug!("conn {}: write error: {}", conn.id(), e);

                            self.close(key);

                            return;
                        }
                    };

                    if !done {
                        return;
                    }

                    match conn.finish_response() {
                        ConnectionState::Reading => {
                            let token = Token(key + SLAB_OFFSET);

                            if let Err(e) =
                                conn.set_interest(self.poll.registry(), token, Interest::READABLE)
                            {
                                error!("conn {}: reregister failed: {}", conn.id(), e);

                                self.close(key);

                                return;
                            }

                            // readiness may have been reported while writing
                            self.read(key);
                        }
                        _ => {
                            self.close(key);

                            return;
                        }
                    }
                }
                ConnectionState::Closed => {
                    self.close(key);

                    return;
                }
            }
        }
    }

    // attaches the response and flips the connection to write readiness.
    // only ever called on the event loop thread
    fn respond(&mut self, key: usize, resp: &Response) {
        let conn = match self.conns.get_mut(key) {
            Some(conn) => conn,
            None => return,
        };

        conn.attach_response(resp, self.config.keep_alive);

        let token = Token(key + SLAB_OFFSET);

        if let Err(e) = conn.set_interest(self.poll.registry(), token, Interest::WRITABLE) {
            error!("conn {}: reregister failed: {}", conn.id(), e);

            self.close(key);
        }
    }

    fn process_completions(&mut self) {
        while let Ok(c) = self.done.try_recv() {
            match self.conns.get(c.key) {
                // the slot may have been reused by a newer connection
                Some(conn)
                    if conn.id() == c.conn_id && conn.state() == ConnectionState::Processing => {}
                _ => {
                    debug!("conn {}: dropping response for closed connection", c.conn_id);
                    continue;
                }
            }

            self.respond(c.key, &c.response);
            self.drive(c.key);
        }
    }

    fn close(&mut self, key: usize) {
        if let Some(mut conn) = self.conns.try_remove(key) {
            if let Err(e) = conn.deregister(self.poll.registry()) {
                debug!("conn {}: deregister failed: {}", conn.id(), e);
            }

            debug!("conn {}: closed", conn.id());
        }
    }

    fn shutdown(&mut self) {
        info!("stopping");

        // joins the worker threads
        self.workers = None;

        let keys: Vec<usize> = self.conns.iter().map(|(key, _)| key).collect();

        for key in keys {
            self.close(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::files::{FileError, Resource, ResourceResolver};
    use std::fs;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;

    struct TestServer {
        addr: SocketAddr,
        stopper: Stopper,
        thread: Option<thread::JoinHandle<()>>,
    }

    impl TestServer {
        fn start(config: ServerConfig) -> Self {
            let router = Router::new(&config);

            Self::start_with_router(config, router)
        }

        fn start_with_router(config: ServerConfig, router: Router) -> Self {
            let mut server = Server::new(&config, router).unwrap();

            let addr = server.local_addr().unwrap();
            let stopper = server.stopper();

            let thread = thread::spawn(move || server.run().unwrap());

            Self {
                addr,
                stopper,
                thread: Some(thread),
            }
        }

        fn connect(&self) -> TcpStream {
            let stream = TcpStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();

            stream
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            self.stopper.stop();

            if let Some(thread) = self.thread.take() {
                thread.join().unwrap();
            }
        }
    }

    fn config(dir: &Path) -> ServerConfig {
        fs::write(dir.join("index.html"), b"hello world").unwrap();

        ServerConfig {
            port: 0,
            static_dir: dir.to_path_buf(),
            ..Default::default()
        }
    }

    // reads one response, relying on Content-Length
    fn read_response(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0; 1024];

        loop {
            if let Some(end) = crate::core::http1::find_header_end(&buf) {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();

                let len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .map(|v| v.trim().parse::<usize>().unwrap())
                    .unwrap_or(0);

                if buf.len() >= end + 4 + len {
                    return String::from_utf8_lossy(&buf[..(end + 4 + len)]).to_string();
                }
            }

            let size = stream.read(&mut chunk).unwrap();
            assert!(size > 0, "unexpected eof");

            buf.extend_from_slice(&chunk[..size]);
        }
    }

    fn assert_closed(stream: &mut TcpStream) {
        let mut chunk = [0; 16];
        assert_eq!(stream.read(&mut chunk).unwrap(), 0);
    }

    #[test_log::test]
    fn keep_alive() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(config(dir.path()));

        let mut stream = server.connect();

        for _ in 0..3 {
            stream.write_all(b"GET /index.html HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();

            let resp = read_response(&mut stream);
            assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
            assert!(resp.contains("Connection: keep-alive\r\n"));
            assert!(resp.ends_with("\r\n\r\nhello world"));
        }
    }

    #[test_log::test]
    fn request_in_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(config(dir.path()));

        let mut stream = server.connect();

        let data = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";

        for part in data.chunks(5) {
            stream.write_all(part).unwrap();
            stream.flush().unwrap();
            thread::sleep(Duration::from_millis(10));
        }

        let resp = read_response(&mut stream);
        assert!(resp.ends_with("hello world"));
    }

    #[test_log::test]
    fn bad_requests_close() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(config(dir.path()));

        let mut stream = server.connect();
        stream.write_all(b"BROKEN\r\n\r\n").unwrap();
        let resp = read_response(&mut stream);
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_closed(&mut stream);

        let mut stream = server.connect();
        stream.write_all(b"DELETE / HTTP/1.1\r\n\r\n").unwrap();
        let resp = read_response(&mut stream);
        assert!(resp.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert_closed(&mut stream);
    }

    #[test_log::test]
    fn oversized_requests_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(config(dir.path()));

        let mut stream = server.connect();
        stream
            .write_all(b"POST /login HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n")
            .unwrap();
        let resp = read_response(&mut stream);
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(resp.contains("Connection: close\r\n"));
        assert_closed(&mut stream);

        let mut stream = server.connect();
        let mut data = b"GET /".to_vec();
        data.resize(9000, b'a');
        stream.write_all(&data).unwrap();
        let resp = read_response(&mut stream);
        assert!(resp.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert_closed(&mut stream);

        // the loop is still serving
        let mut stream = server.connect();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        let resp = read_response(&mut stream);
        assert!(resp.ends_with("hello world"));
    }

    // panics on any path containing "boom", or on every path
    struct Exploding {
        always: bool,
    }

    impl ResourceResolver for Exploding {
        fn resolve(&self, logical_path: &str) -> Result<Resource, FileError> {
            if self.always || logical_path.contains("boom") {
                panic!("failed to resolve {}", logical_path);
            }

            Err(FileError::NotFound(logical_path.to_string()))
        }
    }

    #[test_log::test]
    fn handler_panic_is_internal_error() {
        for (thread_pool, always) in [(false, false), (true, false), (false, true), (true, true)] {
            let config = ServerConfig {
                port: 0,
                thread_pool,
                max_threads: 2,
                ..Default::default()
            };

            let router = Router::with_resolver(&config, Box::new(Exploding { always }));
            let server = TestServer::start_with_router(config, router);

            let mut stream = server.connect();
            stream.write_all(b"GET /boom.html HTTP/1.1\r\n\r\n").unwrap();
            let resp = read_response(&mut stream);
            assert!(resp.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
            assert!(resp.contains("Connection: close\r\n"));
            assert!(resp.ends_with("500 Internal Server Error"));
            assert_closed(&mut stream);

            // a later connection is still served
            let mut stream = server.connect();
            stream.write_all(b"GET /missing.html HTTP/1.1\r\n\r\n").unwrap();
            let resp = read_response(&mut stream);

            if always {
                assert!(resp.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
            } else {
                assert!(resp.starts_with("HTTP/1.1 404 Not Found\r\n"));
            }
        }
    }

    #[test_log::test]
    fn connection_close() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(config(dir.path()));

        let mut stream = server.connect();
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .unwrap();

        let resp = read_response(&mut stream);
        assert!(resp.contains("Connection: close\r\n"));
        assert_closed(&mut stream);
    }

    #[test_log::test]
    fn keep_alive_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(ServerConfig {
            keep_alive: false,
            ..config(dir.path())
        });

        let mut stream = server.connect();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

        let resp = read_response(&mut stream);
        assert!(resp.contains("Connection: close\r\n"));
        assert_closed(&mut stream);
    }

    #[test_log::test]
    fn worker_pool() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(ServerConfig {
            thread_pool: true,
            max_threads: 2,
            ..config(dir.path())
        });

        let clients: Vec<_> = (0..4)
            .map(|_| {
                let mut stream = server.connect();

                thread::spawn(move || {
                    for _ in 0..3 {
                        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();

                        let resp = read_response(&mut stream);
                        assert!(resp.ends_with("hello world"));
                    }
                })
            })
            .collect();

        for c in clients {
            c.join().unwrap();
        }
    }

    #[test_log::test]
    fn body_delimited_by_length() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(config(dir.path()));

        let mut stream = server.connect();

        stream
            .write_all(b"POST /register HTTP/1.1\r\nContent-Length: 26\r\n\r\nusername=al")
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        stream.write_all(b"ice&password=pw").unwrap();

        let resp = read_response(&mut stream);
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.contains("username: alice"));
    }

    #[test_log::test]
    fn stop_with_open_connections() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestServer::start(config(dir.path()));

        let mut stream = server.connect();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        read_response(&mut stream);

        drop(server);

        assert_closed(&mut stream);
    }
}
