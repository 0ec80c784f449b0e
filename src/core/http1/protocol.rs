/*
 * Copyright (C) 2020-2023 Fanout, Inc.
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

use crate::core::http1::message::{header, Headers, Message, Method, Request, Response, Status, Version};
use std::str;
use std::str::FromStr;

// some reasonable number
pub const HEADERS_MAX: usize = 64;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    #[error(transparent)]
    Parse(#[from] httparse::Error),

    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    #[error("unsupported version: {0}")]
    UnsupportedVersion(String),

    #[error("unsupported status code: {0}")]
    UnsupportedStatus(u16),

    #[error("invalid content length")]
    InvalidContentLength,

    #[error("invalid max-age")]
    InvalidMaxAge,
}

fn parse_as_int<T: FromStr>(src: &[u8]) -> Result<T, ()> {
    let int_str = match str::from_utf8(src) {
        Ok(int_str) => int_str,
        Err(_) => return Err(()),
    };

    int_str.trim().parse().map_err(|_| ())
}

/// Returns the offset of the first CR of the first CRLFCRLF sequence in
/// `buf`. Safe to call again as `buf` grows.
pub fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len()).position(|w| w == HEADER_END)
}

/// Like [`find_header_end`], but skips bytes already known not to contain
/// the terminator. `scanned` is how many bytes a previous call looked at.
pub fn find_header_end_from(buf: &[u8], scanned: usize) -> Option<usize> {
    // the terminator may straddle the previous end of data
    let start = scanned.saturating_sub(HEADER_END.len() - 1);

    if start >= buf.len() {
        return None;
    }

    find_header_end(&buf[start..]).map(|pos| pos + start)
}

// the start-line must have at least 3 space-separated tokens
fn start_line_tokens(head: &[u8]) -> Result<Vec<&str>, Error> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());

    let line = match str::from_utf8(&head[..line_end]) {
        Ok(line) => line,
        Err(_) => return Err(Error::Malformed("start-line is not utf-8")),
    };

    let tokens: Vec<&str> = line.split(' ').filter(|t| !t.is_empty()).collect();

    if tokens.len() < 3 {
        return Err(Error::Malformed("start-line has fewer than 3 tokens"));
    }

    Ok(tokens)
}

fn convert_headers(src: &[httparse::Header]) -> Result<Headers, Error> {
    let mut headers = Headers::new();

    for h in src {
        let value = match str::from_utf8(h.value) {
            Ok(value) => value,
            Err(_) => return Err(Error::Malformed("header value is not utf-8")),
        };

        headers.set(h.name, value.trim());
    }

    Ok(headers)
}

fn header_end_or_err(src: &[u8]) -> Result<usize, Error> {
    match find_header_end(src) {
        Some(pos) => Ok(pos + HEADER_END.len()),
        None => Err(Error::Malformed("missing header terminator")),
    }
}

/// Parses the start-line and headers of a request. Returns the request
/// without a body, and the size of the header block including the
/// terminator.
pub fn parse_request_head(src: &[u8]) -> Result<(Request, usize), Error> {
    let size = header_end_or_err(src)?;
    let head = &src[..size];

    let tokens = start_line_tokens(head)?;

    let mut scratch = [httparse::EMPTY_HEADER; HEADERS_MAX];
    let mut req = httparse::Request::new(&mut scratch);

    match req.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::Malformed("incomplete header")),
        Err(httparse::Error::Version) => {
            return Err(Error::UnsupportedVersion(tokens[2].to_string()))
        }
        Err(e) => return Err(Error::Parse(e)),
    }

    let version = match req.version.and_then(Version::from_minor) {
        Some(version) => version,
        None => return Err(Error::UnsupportedVersion(tokens[2].to_string())),
    };

    let method = Method::from_str(req.method.unwrap_or(""))?;
    let target = req.path.unwrap_or("");

    let mut request = Request::with_version(method, target, version)?;
    request.headers = convert_headers(req.headers)?;

    Ok((request, size))
}

/// Parses the status-line and headers of a response. See
/// [`parse_request_head`].
pub fn parse_response_head(src: &[u8]) -> Result<(Response, usize), Error> {
    let size = header_end_or_err(src)?;
    let head = &src[..size];

    let tokens = start_line_tokens(head)?;

    let mut scratch = [httparse::EMPTY_HEADER; HEADERS_MAX];
    let mut resp = httparse::Response::new(&mut scratch);

    match resp.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => return Err(Error::Malformed("incomplete header")),
        Err(httparse::Error::Version) => {
            return Err(Error::UnsupportedVersion(tokens[0].to_string()))
        }
        Err(e) => return Err(Error::Parse(e)),
    }

    let version = match resp.version.and_then(Version::from_minor) {
        Some(version) => version,
        None => return Err(Error::UnsupportedVersion(tokens[0].to_string())),
    };

    let code = resp.code.unwrap_or(0);

    let status = match Status::from_code(code) {
        Some(status) => status,
        None => return Err(Error::UnsupportedStatus(code)),
    };

    let mut response = Response::new(version, status);
    response.headers = convert_headers(resp.headers)?;

    Ok((response, size))
}

/// Declared body size. Absence means no body.
pub fn content_length(headers: &Headers) -> Result<Option<usize>, Error> {
    match headers.get(header::CONTENT_LENGTH) {
        Some(v) => match parse_as_int(v.as_bytes()) {
            Ok(len) => Ok(Some(len)),
            Err(()) => Err(Error::InvalidContentLength),
        },
        None => Ok(None),
    }
}

// bytes past the declared length are ignored
fn attach_body<M: Message>(msg: &mut M, rest: &[u8]) -> Result<(), Error> {
    if let Some(len) = content_length(msg.headers())? {
        if rest.len() < len {
            return Err(Error::Malformed("incomplete body"));
        }

        msg.set_body(rest[..len].to_vec(), None);
    }

    Ok(())
}

pub fn parse_request(src: &[u8]) -> Result<Request, Error> {
    let (mut req, size) = parse_request_head(src)?;

    attach_body(&mut req, &src[size..])?;

    Ok(req)
}

pub fn parse_response(src: &[u8]) -> Result<Response, Error> {
    let (mut resp, size) = parse_response_head(src)?;

    attach_body(&mut resp, &src[size..])?;

    Ok(resp)
}

pub fn serialize<M: Message + ?Sized>(msg: &M) -> Vec<u8> {
    let body = msg.body().unwrap_or(b"");

    let mut out = Vec::with_capacity(256 + body.len());

    out.extend_from_slice(msg.start_line().as_bytes());
    out.extend_from_slice(b"\r\n");

    for (name, value) in msg.headers().iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }

    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);

    out
}

// directives are matched as plain substrings
pub fn has_directive(value: &str, directive: &str) -> bool {
    value.contains(directive)
}

/// Extracts `max-age=N` from a Cache-Control value. Returns `None` if the
/// directive is absent.
pub fn max_age(value: &str) -> Option<Result<u64, Error>> {
    const NAME: &str = "max-age";

    let pos = value.find(NAME)?;
    let rest = value[(pos + NAME.len())..].trim_start();

    let rest = match rest.strip_prefix('=') {
        Some(rest) => rest,
        None => return Some(Err(Error::InvalidMaxAge)),
    };

    let end = rest.find(|c| c == ',' || c == ';').unwrap_or(rest.len());

    Some(parse_as_int(rest[..end].as_bytes()).map_err(|()| Error::InvalidMaxAge))
}
