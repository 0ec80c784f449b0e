/*
 * Copyright (C) 2022 Fanout, Inc.
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

use log::error;
use mio::net::TcpStream;
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

pub fn set_socket_opts(stream: &mut TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        error!("set nodelay failed: {:?}", e);
    }

    if let Err(e) = SockRef::from(&*stream).set_keepalive(true) {
        error!("set keepalive failed: {:?}", e);
    }
}

/// Resolves `host` using the system resolver, returning the first address.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr, io::Error> {
    // strip brackets from ipv6 literals taken from urls
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    match (host, port).to_socket_addrs()?.next() {
        Some(addr) => Ok(addr),
        None => Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses for {}", host),
        )),
    }
}

/// Connects with a bounded wait, returning a non-blocking stream.
pub fn connect_timeout(addr: SocketAddr, timeout: Duration) -> Result<TcpStream, io::Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.connect_timeout(&SockAddr::from(addr), timeout)?;
    socket.set_nonblocking(true)?;

    let mut stream = TcpStream::from_std(socket.into());

    set_socket_opts(&mut stream);

    Ok(stream)
}
