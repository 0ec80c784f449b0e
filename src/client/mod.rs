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

pub mod cache;
pub mod pool;

use crate::core::config::ClientConfig;
use crate::core::http1::{self, header, Message, Method, Request, Response, Status};
use crate::core::time;
use cache::ResponseCache;
use log::{debug, error, info};
use pool::ConnectionPool;
use std::io;
use std::time::Instant;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to resolve {0}: {1}")]
    Resolve(String, io::Error),

    #[error("failed to connect to {0}: {1}")]
    Connect(String, io::Error),

    #[error("timed out waiting for response")]
    ReadTimeout,

    #[error("transport error: {0}")]
    Transport(io::Error),

    #[error("too many redirects (max {0})")]
    TooManyRedirects(u32),

    #[error("redirect response has no Location")]
    MissingRedirectLocation,

    #[error("invalid redirect location: {0}")]
    InvalidRedirect(String),

    #[error(transparent)]
    Message(#[from] http1::Error),
}

fn host_header(host: &str, port: u16) -> String {
    if port == 80 {
        host.to_string()
    } else {
        format!("{}:{}", host, port)
    }
}

// resolves a Location value against the current destination. returns the
// next host, port and target
fn resolve_redirect(
    host: &str,
    port: u16,
    target: &str,
    location: &str,
) -> Result<(String, u16, String), Error> {
    let invalid = || Error::InvalidRedirect(location.to_string());

    let url_host = if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    };

    let base = Url::parse(&format!("http://{}:{}{}", url_host, port, target)).map_err(|_| invalid())?;
    let url = base.join(location).map_err(|_| invalid())?;

    if url.scheme() != "http" {
        return Err(invalid());
    }

    let host = match url.host_str() {
        Some(h) if !h.is_empty() => h.to_string(),
        _ => return Err(invalid()),
    };

    let port = url.port_or_known_default().unwrap_or(80);

    let mut target = url.path().to_string();

    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    Ok((host, port, target))
}

// the name=value part of a Set-Cookie value. none if the cookie is being
// deleted
fn cookie_from_set_cookie(value: &str) -> Option<String> {
    if value.contains("Max-Age=0") {
        return None;
    }

    let pair = value.split(';').next().unwrap_or("").trim();

    if pair.is_empty() {
        None
    } else {
        Some(pair.to_string())
    }
}

/// HTTP/1.1 client with per-destination connection reuse, a response cache
/// and redirect following.
///
/// A client instance is single-threaded: `send` takes `&mut self`, and the
/// pool and cache are not shared. Wrap the client in a lock to use it from
/// several threads.
pub struct Client {
    config: ClientConfig,
    pool: ConnectionPool,
    cache: ResponseCache,
    user_agent: String,
}

impl Client {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            config: config.clone(),
            pool: ConnectionPool::new(),
            cache: ResponseCache::new(config.cache_max_age),
            user_agent: format!("{}/{}", config.client_name, config.client_version),
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn connection_id(&self, host: &str, port: u16) -> Option<u64> {
        self.pool.get(host, port).map(|c| c.id())
    }

    /// Sends a request and returns the final response, following redirects
    /// up to the configured limit.
    pub fn send(&mut self, host: &str, port: u16, req: Request) -> Result<Response, Error> {
        let mut host = host.to_string();
        let mut port = port;
        let mut req = req;
        let mut hops = 0;

        self.prepare(&mut req, &host, port);

        loop {
            let resp = match self.exchange(&host, port, &mut req) {
                Ok(resp) => resp,
                Err(e) => {
                    error!("{} to {}:{} failed: {}", req.start_line(), host, port, e);

                    return Err(e);
                }
            };

            if !resp.status().is_redirect() {
                return Ok(resp);
            }

            if hops >= self.config.max_redirects {
                error!(
                    "{} to {}:{} failed: too many redirects",
                    req.start_line(),
                    host,
                    port
                );

                return Err(Error::TooManyRedirects(self.config.max_redirects));
            }

            hops += 1;

            let location = match resp.header(header::LOCATION) {
                Some(v) => v,
                None => {
                    error!(
                        "{} to {}:{}: {} without Location",
                        req.start_line(),
                        host,
                        port,
                        resp.status()
                    );

                    return Err(Error::MissingRedirectLocation);
                }
            };

            let (next_host, next_port, target) =
                resolve_redirect(&host, port, req.target(), location)?;

            info!(
                "redirect {}: {}:{}{} -> {}:{}{}",
                hops,
                host,
                port,
                req.target(),
                next_host,
                next_port,
                target
            );

            if next_host != host || next_port != port {
                req.remove_header(header::COOKIE);
            }

            // validators belong to the previous target's cache entry
            req.remove_header(header::IF_NONE_MATCH);
            req.remove_header(header::IF_MODIFIED_SINCE);

            req.set_target(&target)?;
            req.set_header(header::HOST, &host_header(&next_host, next_port));

            host = next_host;
            port = next_port;
        }
    }

    /// Closes the pooled connection to a destination, if any.
    pub fn disconnect(&mut self, host: &str, port: u16) {
        self.pool.remove(host, port);
    }

    /// Closes all pooled connections.
    pub fn stop(&mut self) {
        debug!("closing {} pooled connections", self.pool.len());

        self.pool.clear();
    }

    fn prepare(&self, req: &mut Request, host: &str, port: u16) {
        if !req.headers.contains(header::HOST) {
            req.set_header(header::HOST, &host_header(host, port));
        }

        if !req.headers.contains(header::USER_AGENT) {
            req.set_header(header::USER_AGENT, &self.user_agent);
        }

        if !req.headers.contains(header::CONNECTION) {
            let value = if self.config.keep_alive {
                "keep-alive"
            } else {
                "close"
            };

            req.set_header(header::CONNECTION, value);
        }
    }

    // one request/response on one destination, no redirect handling
    fn exchange(&mut self, host: &str, port: u16, req: &mut Request) -> Result<Response, Error> {
        let is_get = req.method() == Method::Get;

        if is_get {
            if self.cache.is_valid(req) {
                if let Some(mut resp) = self.cache.get(req) {
                    debug!("cache hit {}", cache::cache_key(req));

                    resp.set_header(header::DATE, &time::now_http_date());

                    return Ok(resp);
                }
            } else if let Some(stale) = self.cache.get(req) {
                debug!("cache stale {}, revalidating", cache::cache_key(req));

                if let Some(etag) = stale.header(header::ETAG) {
                    req.set_header(header::IF_NONE_MATCH, etag);
                }

                if let Some(modified) = stale.header(header::LAST_MODIFIED) {
                    req.set_header(header::IF_MODIFIED_SINCE, modified);
                }
            }
        }

        let timeout = self.config.connection_timeout();
        let buffer_size = self.config.buffer_size;

        let conn = self.pool.get_or_connect(host, port, timeout)?;

        if let Some(cookie) = conn.cookie() {
            req.set_header(header::COOKIE, cookie);
        }

        debug!("connection {}: {}", conn.id(), req.start_line());

        let data = http1::serialize(req);
        let deadline = Instant::now() + timeout;

        let ret = conn
            .write_all(&data, deadline)
            .and_then(|()| conn.read_response(deadline, buffer_size));

        let resp = match ret {
            Ok(resp) => resp,
            Err(e) => {
                self.pool.remove(host, port);

                return Err(e);
            }
        };

        debug!("{}:{} {} -> {}", host, port, req.start_line(), resp.status());

        let status = resp.status();

        if !status.is_redirect() {
            if let Some(value) = resp.header(header::SET_COOKIE) {
                if let Some(conn) = self.pool.get_mut(host, port) {
                    conn.set_cookie(cookie_from_set_cookie(value));
                }
            }
        }

        if !resp.keep_alive() {
            self.pool.remove(host, port);
        }

        if status == Status::NotModified {
            // the 304 carries no body. serve the stored one
            if self.cache.update(req) {
                if let Some(mut cached) = self.cache.get(req) {
                    cached.set_header(header::DATE, &time::now_http_date());

                    return Ok(cached);
                }
            }

            return Ok(resp);
        }

        if is_get && status == Status::Ok && self.config.enable_cache {
            let no_store = resp
                .header(header::CACHE_CONTROL)
                .map(|v| http1::has_directive(v, "no-store"))
                .unwrap_or(false);

            if !no_store {
                self.cache.put(req, &resp);
            }
        }

        Ok(resp)
    }
}
