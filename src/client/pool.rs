/*
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

use super::Error;
use crate::core::http1::{self, Message, Response};
use crate::core::net;
use log::debug;
use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const STREAM: Token = Token(0);
const EVENTS_MAX: usize = 8;

pub fn pool_key(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

/// A client socket kept open between requests to one destination, along
/// with the last cookie the destination handed out.
pub struct PooledConnection {
    id: u64,
    host: String,
    addr: SocketAddr,
    port: u16,
    stream: TcpStream,
    poll: Poll,
    events: Events,
    cookie: Option<String>,
}

impl PooledConnection {
    pub fn connect(id: u64, host: &str, port: u16, timeout: Duration) -> Result<Self, Error> {
        let key = pool_key(host, port);

        let addr = match net::resolve(host, port) {
            Ok(addr) => addr,
            Err(e) => return Err(Error::Resolve(key, e)),
        };

        let mut stream = match net::connect_timeout(addr, timeout) {
            Ok(stream) => stream,
            Err(e) => return Err(Error::Connect(key, e)),
        };

        let poll = match Poll::new() {
            Ok(poll) => poll,
            Err(e) => return Err(Error::Connect(key, e)),
        };

        if let Err(e) = poll.registry().register(
            &mut stream,
            STREAM,
            Interest::READABLE | Interest::WRITABLE,
        ) {
            return Err(Error::Connect(key, e));
        }

        debug!("connection {}: connected to {} ({})", id, key, addr);

        Ok(Self {
            id,
            host: host.to_string(),
            addr,
            port,
            stream,
            poll,
            events: Events::with_capacity(EVENTS_MAX),
            cookie: None,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn cookie(&self) -> Option<&str> {
        self.cookie.as_deref()
    }

    pub fn set_cookie(&mut self, cookie: Option<String>) {
        self.cookie = cookie;
    }

    pub fn write_all(&mut self, data: &[u8], deadline: Instant) -> Result<(), Error> {
        let mut pos = 0;

        while pos < data.len() {
            match self.stream.write(&data[pos..]) {
                Ok(0) => return Err(Error::Transport(io::Error::from(io::ErrorKind::WriteZero))),
                Ok(size) => pos += size,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(deadline)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Transport(e)),
            }
        }

        Ok(())
    }

    /// Reads one response. The body is delimited by `Content-Length`, and
    /// a missing length means no body. Bytes past the body are discarded.
    pub fn read_response(&mut self, deadline: Instant, buffer_size: usize) -> Result<Response, Error> {
        let mut buf = Vec::new();
        let mut chunk = vec![0; buffer_size];
        let mut scanned = 0;

        let (mut resp, size, len) = loop {
            if http1::find_header_end_from(&buf, scanned).is_some() {
                let (resp, size) = http1::parse_response_head(&buf)?;
                let len = http1::content_length(&resp.headers)?;

                break (resp, size, len);
            }

            scanned = buf.len();

            self.fill(&mut buf, &mut chunk, deadline)?;
        };

        if let Some(len) = len {
            let end = match size.checked_add(len) {
                Some(end) => end,
                None => return Err(http1::Error::InvalidContentLength.into()),
            };

            while buf.len() < end {
                self.fill(&mut buf, &mut chunk, deadline)?;
            }

            resp.set_body(buf[size..end].to_vec(), None);
        }

        Ok(resp)
    }

    fn fill(&mut self, buf: &mut Vec<u8>, chunk: &mut [u8], deadline: Instant) -> Result<(), Error> {
        loop {
            match self.stream.read(chunk) {
                Ok(0) => {
                    return Err(Error::Transport(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(size) => {
                    buf.extend_from_slice(&chunk[..size]);

                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(deadline)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Transport(e)),
            }
        }
    }

    // waits for any readiness on the stream, up to the deadline
    fn wait(&mut self, deadline: Instant) -> Result<(), Error> {
        let now = Instant::now();

        if now >= deadline {
            return Err(Error::ReadTimeout);
        }

        match self.poll.poll(&mut self.events, Some(deadline - now)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Ok(()),
            Err(e) => Err(Error::Transport(e)),
        }
    }
}

/// One connection per `host:port`. Not synchronized: the owning client
/// must not be shared between threads without external locking.
pub struct ConnectionPool {
    conns: HashMap<String, PooledConnection>,
    next_id: u64,
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self {
            conns: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn contains(&self, host: &str, port: u16) -> bool {
        self.conns.contains_key(&pool_key(host, port))
    }

    pub fn get(&self, host: &str, port: u16) -> Option<&PooledConnection> {
        self.conns.get(&pool_key(host, port))
    }

    pub fn get_mut(&mut self, host: &str, port: u16) -> Option<&mut PooledConnection> {
        self.conns.get_mut(&pool_key(host, port))
    }

    /// Returns the existing connection for the destination, or connects a
    /// new one.
    pub fn get_or_connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<&mut PooledConnection, Error> {
        match self.conns.entry(pool_key(host, port)) {
            Entry::Occupied(e) => Ok(e.into_mut()),
            Entry::Vacant(e) => {
                let conn = PooledConnection::connect(self.next_id, host, port, timeout)?;

                self.next_id += 1;

                Ok(e.insert(conn))
            }
        }
    }

    pub fn remove(&mut self, host: &str, port: u16) -> Option<PooledConnection> {
        let conn = self.conns.remove(&pool_key(host, port));

        if let Some(c) = &conn {
            debug!("connection {}: removed {}", c.id, pool_key(host, port));
        }

        conn
    }

    pub fn clear(&mut self) {
        self.conns.clear();
    }
}
