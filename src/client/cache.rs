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

use crate::core::http1::{self, header, Message, Request, Response};
use log::{debug, warn};
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub fn cache_key(req: &Request) -> String {
    format!(
        "{}|{}|{}",
        req.method(),
        req.header(header::HOST).unwrap_or(""),
        req.target()
    )
}

struct CacheEntry {
    response: Response,

    // none means the entry never expires
    expires: Option<Instant>,
}

/// Responses keyed by method, host and target. At most one entry per key.
pub struct ResponseCache {
    entries: HashMap<String, CacheEntry>,
    default_ttl_secs: i64,
}

impl ResponseCache {
    /// A `default_ttl_secs` of zero or less means entries without their own
    /// `max-age` never expire.
    pub fn new(default_ttl_secs: i64) -> Self {
        Self {
            entries: HashMap::new(),
            default_ttl_secs,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, req: &Request) -> bool {
        self.entries.contains_key(&cache_key(req))
    }

    pub fn put(&mut self, req: &Request, resp: &Response) {
        self.put_at(req, resp, Instant::now());
    }

    pub fn put_at(&mut self, req: &Request, resp: &Response, now: Instant) {
        let key = cache_key(req);
        let expires = self.expiry(resp, now);

        debug!("cache put {} expires={:?}", key, expires.map(|t| t - now));

        self.entries.insert(
            key,
            CacheEntry {
                response: resp.clone(),
                expires,
            },
        );
    }

    pub fn is_valid(&self, req: &Request) -> bool {
        self.is_valid_at(req, Instant::now())
    }

    pub fn is_valid_at(&self, req: &Request, now: Instant) -> bool {
        match self.entries.get(&cache_key(req)) {
            Some(entry) => match entry.expires {
                Some(t) => now < t,
                None => true,
            },
            None => false,
        }
    }

    /// Returns a copy of the stored response. Changes made to the copy do
    /// not affect the entry.
    pub fn get(&self, req: &Request) -> Option<Response> {
        self.entries
            .get(&cache_key(req))
            .map(|entry| entry.response.clone())
    }

    /// Recomputes the expiry from the stored response's own headers. The
    /// stored response is left untouched. Returns false if there is no entry.
    pub fn update(&mut self, req: &Request) -> bool {
        self.update_at(req, Instant::now())
    }

    pub fn update_at(&mut self, req: &Request, now: Instant) -> bool {
        let default_ttl_secs = self.default_ttl_secs;

        match self.entries.get_mut(&cache_key(req)) {
            Some(entry) => {
                entry.expires = expiry(&entry.response, default_ttl_secs, now);

                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn expiry(&self, resp: &Response, now: Instant) -> Option<Instant> {
        expiry(resp, self.default_ttl_secs, now)
    }
}

fn default_expiry(default_ttl_secs: i64, now: Instant) -> Option<Instant> {
    if default_ttl_secs <= 0 {
        return None;
    }

    expire_after(now, default_ttl_secs as u64)
}

// a lifetime past the clock's range never expires
fn expire_after(now: Instant, secs: u64) -> Option<Instant> {
    let t = now.checked_add(Duration::from_secs(secs));

    if t.is_none() {
        warn!("ttl of {} seconds out of range, entry never expires", secs);
    }

    t
}

fn expiry(resp: &Response, default_ttl_secs: i64, now: Instant) -> Option<Instant> {
    let value = match resp.header(header::CACHE_CONTROL) {
        Some(v) => v,
        None => return default_expiry(default_ttl_secs, now),
    };

    match http1::max_age(value) {
        Some(Ok(secs)) => expire_after(now, secs),
        Some(Err(e)) => {
            warn!("{} in \"{}\", using default ttl", e, value);

            default_expiry(default_ttl_secs, now)
        }
        None => default_expiry(default_ttl_secs, now),
    }
}
