/*
 * Copyright (C) 2024 Fastly, Inc.
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

use crate::core::http1::protocol::Error;
use std::fmt;
use std::str::FromStr;

pub mod header {
    pub const CACHE_CONTROL: &str = "Cache-Control";
    pub const CONNECTION: &str = "Connection";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const COOKIE: &str = "Cookie";
    pub const DATE: &str = "Date";
    pub const ETAG: &str = "ETag";
    pub const HOST: &str = "Host";
    pub const IF_MODIFIED_SINCE: &str = "If-Modified-Since";
    pub const IF_NONE_MATCH: &str = "If-None-Match";
    pub const LAST_MODIFIED: &str = "Last-Modified";
    pub const LOCATION: &str = "Location";
    pub const SERVER: &str = "Server";
    pub const SET_COOKIE: &str = "Set-Cookie";
    pub const USER_AGENT: &str = "User-Agent";
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }

    // httparse reports the minor version only
    pub fn from_minor(minor: u8) -> Option<Self> {
        match minor {
            0 => Some(Self::Http10),
            1 => Some(Self::Http11),
            _ => None,
        }
    }
}

impl FromStr for Version {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "HTTP/1.0" => Ok(Self::Http10),
            "HTTP/1.1" => Ok(Self::Http11),
            _ => Err(Error::UnsupportedVersion(s.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Method {
    Get,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
        }
    }
}

impl FromStr for Method {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            _ => Err(Error::UnsupportedMethod(s.to_string())),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed set of status codes this engine produces and understands.
/// The reason phrase is always derived from the code.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Status {
    Ok,
    MovedPermanently,
    Found,
    SeeOther,
    NotModified,
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    MethodNotAllowed,
    Conflict,
    InternalServerError,
}

impl Status {
    pub fn from_code(code: u16) -> Option<Self> {
        let status = match code {
            200 => Self::Ok,
            301 => Self::MovedPermanently,
            302 => Self::Found,
            303 => Self::SeeOther,
            304 => Self::NotModified,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            405 => Self::MethodNotAllowed,
            409 => Self::Conflict,
            500 => Self::InternalServerError,
            _ => return None,
        };

        Some(status)
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::MovedPermanently => 301,
            Self::Found => 302,
            Self::SeeOther => 303,
            Self::NotModified => 304,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::MethodNotAllowed => 405,
            Self::Conflict => 409,
            Self::InternalServerError => 500,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::MovedPermanently => "Moved Permanently",
            Self::Found => "Found",
            Self::SeeOther => "See Other",
            Self::NotModified => "Not Modified",
            Self::BadRequest => "Bad Request",
            Self::Unauthorized => "Unauthorized",
            Self::Forbidden => "Forbidden",
            Self::NotFound => "Not Found",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::Conflict => "Conflict",
            Self::InternalServerError => "Internal Server Error",
        }
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self, Self::MovedPermanently | Self::Found | Self::SeeOther)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.reason())
    }
}

/// Header map with exact, case-sensitive names. Setting an existing name
/// replaces its value in place, so iteration follows first insertion.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn set(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.entries.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self.entries.iter().position(|(n, _)| n == name)?;

        Some(self.entries.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Behavior shared by requests and responses. Implementors only expose
/// their parts; body handling keeps `Content-Length` in sync.
pub trait Message {
    fn version(&self) -> Version;

    fn headers(&self) -> &Headers;

    fn headers_mut(&mut self) -> &mut Headers;

    fn body(&self) -> Option<&[u8]>;

    fn body_slot(&mut self) -> &mut Option<Vec<u8>>;

    fn start_line(&self) -> String;

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name)
    }

    fn set_header(&mut self, name: &str, value: &str) {
        self.headers_mut().set(name, value);
    }

    fn remove_header(&mut self, name: &str) -> Option<String> {
        self.headers_mut().remove(name)
    }

    fn set_body(&mut self, body: Vec<u8>, content_type: Option<&str>) {
        if let Some(content_type) = content_type {
            self.set_header(header::CONTENT_TYPE, content_type);
        }

        self.set_header(header::CONTENT_LENGTH, &body.len().to_string());

        *self.body_slot() = Some(body);
    }

    fn keep_alive(&self) -> bool {
        match self.header(header::CONNECTION) {
            Some(v) => v.eq_ignore_ascii_case("keep-alive"),
            None => false,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Request {
    method: Method,
    target: String,
    version: Version,
    pub headers: Headers,
    body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, target: &str) -> Result<Self, Error> {
        Self::with_version(method, target, Version::Http11)
    }

    pub fn with_version(method: Method, target: &str, version: Version) -> Result<Self, Error> {
        check_target(target)?;

        Ok(Self {
            method,
            target: target.to_string(),
            version,
            headers: Headers::new(),
            body: None,
        })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn set_target(&mut self, target: &str) -> Result<(), Error> {
        check_target(target)?;

        self.target = target.to_string();

        Ok(())
    }

    /// Replaces the path portion of the target, keeping any query string.
    pub fn set_path(&mut self, path: &str) -> Result<(), Error> {
        let target = match self.target.find('?') {
            Some(pos) => format!("{}{}", path, &self.target[pos..]),
            None => path.to_string(),
        };

        self.set_target(&target)
    }

    // target without the query string
    pub fn path(&self) -> &str {
        match self.target.find('?') {
            Some(pos) => &self.target[..pos],
            None => &self.target,
        }
    }

    pub fn query(&self) -> &[u8] {
        match self.method {
            Method::Get => match self.target.find('?') {
                Some(pos) => self.target[(pos + 1)..].as_bytes(),
                None => b"",
            },
            Method::Post => self.body.as_deref().unwrap_or(b""),
        }
    }
}

impl Message for Request {
    fn version(&self) -> Version {
        self.version
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    fn body_slot(&mut self) -> &mut Option<Vec<u8>> {
        &mut self.body
    }

    fn start_line(&self) -> String {
        format!("{} {} {}", self.method, self.target, self.version)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Response {
    status: Status,
    version: Version,
    pub headers: Headers,
    body: Option<Vec<u8>>,
}

impl Response {
    pub fn new(version: Version, status: Status) -> Self {
        Self {
            status,
            version,
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) {
        self.status = status;
    }
}

impl Message for Response {
    fn version(&self) -> Version {
        self.version
    }

    fn headers(&self) -> &Headers {
        &self.headers
    }

    fn headers_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }

    fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    fn body_slot(&mut self) -> &mut Option<Vec<u8>> {
        &mut self.body
    }

    fn start_line(&self) -> String {
        format!("{} {}", self.version, self.status)
    }
}

fn check_target(target: &str) -> Result<(), Error> {
    if !target.starts_with('/') {
        return Err(Error::Malformed("target must start with '/'"));
    }

    if target.contains(|c: char| c.is_ascii_whitespace()) {
        return Err(Error::Malformed("target contains whitespace"));
    }

    Ok(())
}
