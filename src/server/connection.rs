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

use crate::core::http1::{self, header, Message, Response, Status};
use log::debug;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Reading,
    Processing,
    Writing,
    Closed,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Framed {
    Incomplete,

    // a complete request, head and body
    Complete(Vec<u8>),

    // the head could not be framed. carries everything buffered so the
    // router can produce the error response
    Invalid(Vec<u8>),

    // the head or the declared body exceeds the limits
    TooLarge,
}

/// Size limits applied while framing requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub head_max: usize,
    pub body_max: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            head_max: 8192,
            body_max: 1024 * 1024,
        }
    }
}

/// Splits a growing byte buffer into requests. The header terminator is
/// searched incrementally and the body length comes from `Content-Length`.
pub struct RequestFramer {
    buf: Vec<u8>,
    scanned: usize,
    limits: FrameLimits,

    // end offset of the request being accumulated, once its head is known
    end: Option<usize>,
}

impl RequestFramer {
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            buf: Vec::new(),
            scanned: 0,
            limits,
            end: None,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether enough is buffered that [`next`](Self::next) cannot return
    /// `Incomplete`. Reading stops here until the buffer is consumed.
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.limits.head_max.saturating_add(self.limits.body_max)
    }

    pub fn next(&mut self) -> Framed {
        if self.end.is_none() {
            let pos = match http1::find_header_end_from(&self.buf, self.scanned) {
                Some(pos) => pos,
                None => {
                    if self.buf.len() > self.limits.head_max {
                        return self.reject("head too large");
                    }

                    self.scanned = self.buf.len();

                    return Framed::Incomplete;
                }
            };

            // terminator included
            if pos + 4 > self.limits.head_max {
                return self.reject("head too large");
            }

            let ret = http1::parse_request_head(&self.buf)
                .and_then(|(req, size)| Ok((size, http1::content_length(&req.headers)?)));

            let (size, len) = match ret {
                Ok((size, len)) => (size, len.unwrap_or(0)),
                Err(e) => {
                    debug!("unable to frame request: {}", e);

                    self.scanned = 0;

                    return Framed::Invalid(self.buf.split_off(0));
                }
            };

            if len > self.limits.body_max {
                return self.reject("body too large");
            }

            match size.checked_add(len) {
                Some(end) => self.end = Some(end),
                None => return self.reject("body too large"),
            }
        }

        match self.end {
            Some(end) if self.buf.len() >= end => {
                let rest = self.buf.split_off(end);
                let raw = std::mem::replace(&mut self.buf, rest);

                self.end = None;
                self.scanned = 0;

                Framed::Complete(raw)
            }
            _ => Framed::Incomplete,
        }
    }

    fn reject(&mut self, reason: &str) -> Framed {
        debug!("rejecting request: {}", reason);

        self.buf.clear();
        self.scanned = 0;
        self.end = None;

        Framed::TooLarge
    }
}

/// What the framer produced for the event loop.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    // raw request bytes for the router, possibly unparseable
    Request(Vec<u8>),

    // refused before routing, answered with this status
    Rejected(Status),
}

pub struct Connection {
    id: u64,
    stream: TcpStream,
    peer: SocketAddr,
    state: ConnectionState,
    framer: RequestFramer,
    out: Vec<u8>,
    out_pos: usize,
    keep_alive: bool,
    close_after: bool,
    peer_closed: bool,
}

impl Connection {
    pub fn new(id: u64, stream: TcpStream, peer: SocketAddr, limits: FrameLimits) -> Self {
        Self {
            id,
            stream,
            peer,
            state: ConnectionState::Reading,
            framer: RequestFramer::new(limits),
            out: Vec::new(),
            out_pos: 0,
            keep_alive: false,
            close_after: false,
            peer_closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> Result<(), io::Error> {
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    pub fn set_interest(
        &mut self,
        registry: &Registry,
        token: Token,
        interest: Interest,
    ) -> Result<(), io::Error> {
        registry.reregister(&mut self.stream, token, interest)
    }

    pub fn deregister(&mut self, registry: &Registry) -> Result<(), io::Error> {
        registry.deregister(&mut self.stream)
    }

    /// Drains everything currently readable into the request buffer, or
    /// until the buffer is full.
    pub fn read(&mut self, chunk_size: usize) -> Result<(), io::Error> {
        let mut chunk = vec![0; chunk_size];

        loop {
            if self.framer.is_full() {
                return Ok(());
            }

            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;

                    return Ok(());
                }
                Ok(size) => self.framer.push(&chunk[..size]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Takes the next complete request out of the buffer, if any. Anything
    /// other than a cleanly framed request closes the connection after its
    /// response.
    pub fn next_request(&mut self) -> Option<Incoming> {
        match self.framer.next() {
            Framed::Incomplete => None,
            Framed::Complete(raw) => Some(Incoming::Request(raw)),
            Framed::Invalid(raw) => {
                self.close_after = true;

                Some(Incoming::Request(raw))
            }
            Framed::TooLarge => {
                self.close_after = true;

                Some(Incoming::Rejected(Status::BadRequest))
            }
        }
    }

    pub fn attach_response(&mut self, resp: &Response, server_keep_alive: bool) {
        let resp_close = resp
            .header(header::CONNECTION)
            .map(|v| v.eq_ignore_ascii_case("close"))
            .unwrap_or(false);

        self.keep_alive = server_keep_alive && !resp_close && !self.close_after;
        self.out = http1::serialize(resp);
        self.out_pos = 0;
        self.state = ConnectionState::Writing;
    }

    /// Writes as much of the pending response as the socket takes. Returns
    /// true once all of it has been written.
    pub fn write(&mut self) -> Result<bool, io::Error> {
        while self.out_pos < self.out.len() {
            match self.stream.write(&self.out[self.out_pos..]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero)),
                Ok(size) => self.out_pos += size,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }

        Ok(true)
    }

    /// Moves to the state following a fully written response.
    pub fn finish_response(&mut self) -> ConnectionState {
        self.out.clear();
        self.out_pos = 0;

        self.state = if self.keep_alive && !self.peer_closed {
            ConnectionState::Reading
        } else {
            ConnectionState::Closed
        };

        self.state
    }
}
