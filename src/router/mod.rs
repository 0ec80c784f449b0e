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

pub mod files;
pub mod session;

use crate::core::config::{RedirectRule, ServerConfig};
use crate::core::http1::{self, header, Message, Method, Request, Response, Status, Version};
use crate::core::time;
use files::{FileError, ResourceResolver, StaticDir};
use log::{debug, error, info, warn};
use session::{SessionError, SessionManager};
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use url::form_urlencoded;

/// Request outcomes other than success. All but `Internal` are expected
/// results of routing.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("not found")]
    NotFound,

    #[error("forbidden")]
    Forbidden,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("conflict")]
    Conflict,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RouteError {
    pub fn status(&self) -> Status {
        match self {
            Self::NotFound => Status::NotFound,
            Self::Forbidden => Status::Forbidden,
            Self::BadRequest(_) => Status::BadRequest,
            Self::Unauthorized => Status::Unauthorized,
            Self::Conflict => Status::Conflict,
            Self::MethodNotAllowed => Status::MethodNotAllowed,
            Self::Internal(_) => Status::InternalServerError,
        }
    }
}

impl From<FileError> for RouteError {
    fn from(e: FileError) -> Self {
        match e {
            FileError::NotFound(_) => Self::NotFound,
            FileError::Forbidden(_) => Self::Forbidden,
            FileError::Io(e) => Self::Internal(e.to_string()),
        }
    }
}

impl From<SessionError> for RouteError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::MissingField | SessionError::NoSession => Self::BadRequest(e.to_string()),
            SessionError::UserExists => Self::Conflict,
            SessionError::InvalidCredentials => Self::Unauthorized,
        }
    }
}

impl From<http1::Error> for RouteError {
    fn from(e: http1::Error) -> Self {
        match e {
            http1::Error::UnsupportedMethod(_) => Self::MethodNotAllowed,
            e => Self::BadRequest(e.to_string()),
        }
    }
}

// a request asks to close when it says so, or is HTTP/1.0 without
// keep-alive
fn wants_close(req: &Request) -> bool {
    match req.header(header::CONNECTION) {
        Some(v) if v.eq_ignore_ascii_case("close") => true,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => false,
        _ => req.version() == Version::Http10,
    }
}

fn text_response(version: Version, status: Status, body: &str) -> Response {
    let mut resp = Response::new(version, status);
    resp.set_body(body.as_bytes().to_vec(), Some("text/plain"));

    resp
}

/// Turns raw requests into responses: static files, redirect rules and the
/// session endpoints.
pub struct Router {
    redirects: HashMap<String, RedirectRule>,
    resolver: Box<dyn ResourceResolver>,
    sessions: SessionManager,
    server_header: String,
    keep_alive: bool,
    cache_control: String,
    default_page: String,
    protected_prefix: String,
}

impl Router {
    pub fn new(config: &ServerConfig) -> Self {
        Self::with_resolver(config, Box::new(StaticDir::new(&config.static_dir)))
    }

    pub fn with_resolver(config: &ServerConfig, resolver: Box<dyn ResourceResolver>) -> Self {
        let redirects = config
            .redirects
            .iter()
            .map(|r| (r.path.clone(), r.clone()))
            .collect();

        Self {
            redirects,
            resolver,
            sessions: SessionManager::new(Duration::from_secs(config.session_expiry_secs)),
            server_header: format!("{}/{}", config.server_name, config.server_version),
            keep_alive: config.keep_alive,
            cache_control: config.cache_control.clone(),
            default_page: config.default_page.clone(),
            protected_prefix: config.protected_prefix.clone(),
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Produces exactly one response for a complete raw request.
    pub fn handle(&self, raw: &[u8]) -> Response {
        let req = match http1::parse_request(raw) {
            Ok(req) => req,
            Err(e) => {
                warn!("unable to parse request: {}", e);

                let mut resp = self.error_response(Version::Http11, RouteError::from(e).status());
                self.set_common_headers(&mut resp, true);

                return resp;
            }
        };

        let ret = match req.method() {
            Method::Get => self.get(&req),
            Method::Post => self.post(&req),
        };

        let mut resp = match ret {
            Ok(resp) => resp,
            Err(RouteError::Internal(e)) => {
                error!("{}: internal error: {}", req.start_line(), e);

                self.error_response(req.version(), Status::InternalServerError)
            }
            Err(e) => {
                debug!("{}: {}", req.start_line(), e);

                self.error_response(req.version(), e.status())
            }
        };

        self.set_common_headers(&mut resp, wants_close(&req));

        info!("{} -> {}", req.start_line(), resp.status().code());

        resp
    }

    /// Error response for a request refused or failed outside of routing.
    /// Always asks for the connection to close.
    pub fn reject(&self, status: Status) -> Response {
        let mut resp = self.error_response(Version::Http11, status);
        self.set_common_headers(&mut resp, true);

        resp
    }

    fn get(&self, req: &Request) -> Result<Response, RouteError> {
        let path = req.path();

        if let Some(rule) = self.redirects.get(path) {
            let status = Status::from_code(rule.status).unwrap_or(Status::Found);

            debug!("redirect {} -> {} ({})", path, rule.target, status.code());

            let mut resp = text_response(
                req.version(),
                status,
                &format!("Redirecting to {}", rule.target),
            );
            resp.set_header(header::LOCATION, &rule.target);

            return Ok(resp);
        }

        if path.starts_with(&self.protected_prefix) {
            match self.sessions.validate(req.header(header::COOKIE)) {
                Some(user) => debug!("{} accessed by {}", path, user),
                None => return Err(RouteError::Unauthorized),
            }
        }

        let logical = if path == "/" {
            format!("/{}", self.default_page)
        } else {
            path.to_string()
        };

        let res = self.resolver.resolve(&logical)?;

        let etag = time::unix_millis(res.modified).to_string();
        let last_modified = time::format_http_date(res.modified);

        if not_modified(req, &etag, res.modified) {
            let mut resp = Response::new(req.version(), Status::NotModified);
            resp.set_header(header::ETAG, &etag);
            resp.set_header(header::LAST_MODIFIED, &last_modified);

            return Ok(resp);
        }

        let mut resp = Response::new(req.version(), Status::Ok);
        resp.set_body(res.contents, Some(files::mime_type(&res.path)));
        resp.set_header(header::ETAG, &etag);
        resp.set_header(header::LAST_MODIFIED, &last_modified);

        Ok(resp)
    }

    fn post(&self, req: &Request) -> Result<Response, RouteError> {
        let form: HashMap<String, String> = form_urlencoded::parse(req.query()).into_owned().collect();

        let field = |name: &str| form.get(name).map(|s| s.as_str()).unwrap_or("");

        match req.path() {
            "/register" => {
                let username = field("username");

                self.sessions.register(username, field("password"))?;

                Ok(text_response(
                    req.version(),
                    Status::Ok,
                    &format!("Register success.\nusername: {}", username),
                ))
            }
            "/login" => {
                let username = field("username");

                let id = self.sessions.login(username, field("password"))?;

                let mut resp = text_response(
                    req.version(),
                    Status::Ok,
                    &format!("Login success.\nusername: {}", username),
                );

                resp.set_header(
                    header::SET_COOKIE,
                    &session::session_cookie(&id, self.sessions.expiry().as_secs()),
                );

                Ok(resp)
            }
            "/logout" => {
                self.sessions.logout(req.header(header::COOKIE))?;

                let mut resp = text_response(req.version(), Status::Ok, "Logout success.");
                resp.set_header(header::SET_COOKIE, &session::session_cookie("", 0));

                Ok(resp)
            }
            _ => Err(RouteError::NotFound),
        }
    }

    // serves <static>/<code>.html if present
    fn error_response(&self, version: Version, status: Status) -> Response {
        match self.resolver.resolve(&format!("/{}.html", status.code())) {
            Ok(res) => {
                let mut resp = Response::new(version, status);
                resp.set_body(res.contents, Some("text/html"));

                resp
            }
            Err(_) => text_response(version, status, &status.to_string()),
        }
    }

    fn set_common_headers(&self, resp: &mut Response, close: bool) {
        resp.set_header(header::SERVER, &self.server_header);

        let connection = if self.keep_alive && !close {
            "keep-alive"
        } else {
            "close"
        };

        resp.set_header(header::CONNECTION, connection);
        resp.set_header(header::DATE, &time::now_http_date());

        if !resp.headers.contains(header::CACHE_CONTROL) {
            resp.set_header(header::CACHE_CONTROL, &self.cache_control);
        }
    }
}

fn not_modified(req: &Request, etag: &str, modified: SystemTime) -> bool {
    if let Some(v) = req.header(header::CACHE_CONTROL) {
        if http1::has_directive(v, "no-cache") {
            return false;
        }
    }

    if req.header(header::IF_NONE_MATCH) == Some(etag) {
        return true;
    }

    match req.header(header::IF_MODIFIED_SINCE).and_then(time::parse_http_date) {
        Some(since) => time::unix_secs(modified) <= since,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;

    fn setup(dir: &Path) -> Router {
        fs::write(dir.join("index.html"), b"<h1>home</h1>").unwrap();
        fs::write(dir.join("style.css"), b"body {}").unwrap();
        fs::create_dir(dir.join("user")).unwrap();
        fs::write(dir.join("user/home.html"), b"secret").unwrap();

        let config = ServerConfig {
            static_dir: dir.to_path_buf(),
            redirects: vec![RedirectRule {
                path: String::from("/old"),
                target: String::from("/new"),
                status: 301,
            }],
            ..Default::default()
        };

        Router::new(&config)
    }

    fn get(router: &Router, target: &str, headers: &[(&str, &str)]) -> Response {
        let mut req = Request::new(Method::Get, target).unwrap();

        for (name, value) in headers {
            req.set_header(name, value);
        }

        router.handle(&http1::serialize(&req))
    }

    fn post(router: &Router, target: &str, form: &str, cookie: Option<&str>) -> Response {
        let mut req = Request::new(Method::Post, target).unwrap();
        req.set_body(form.as_bytes().to_vec(), Some("application/x-www-form-urlencoded"));

        if let Some(cookie) = cookie {
            req.set_header(header::COOKIE, cookie);
        }

        router.handle(&http1::serialize(&req))
    }

    #[test_log::test]
    fn static_get() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(dir.path());

        let resp = get(&router, "/", &[]);
        assert_eq!(resp.status(), Status::Ok);
        assert_eq!(resp.body(), Some(&b"<h1>home</h1>"[..]));
        assert_eq!(resp.header(header::CONTENT_TYPE), Some("text/html"));
        assert_eq!(resp.header(header::SERVER), Some("SimpleHttpServer/1.0"));
        assert_eq!(resp.header(header::CONNECTION), Some("keep-alive"));
        assert_eq!(resp.header(header::CACHE_CONTROL), Some("public, max-age=3600"));
        assert!(resp.header(header::DATE).is_some());

        let modified = fs::metadata(dir.path().join("index.html"))
            .unwrap()
            .modified()
            .unwrap();
        let etag = time::unix_millis(modified).to_string();
        assert_eq!(resp.header(header::ETAG), Some(etag.as_str()));

        let resp = get(&router, "/style.css?v=2", &[]);
        assert_eq!(resp.header(header::CONTENT_TYPE), Some("text/css"));
    }

    #[test_log::test]
    fn conditional_get() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(dir.path());

        let resp = get(&router, "/index.html", &[]);
        let etag = resp.header(header::ETAG).unwrap().to_string();
        let last_modified = resp.header(header::LAST_MODIFIED).unwrap().to_string();

        let resp = get(&router, "/index.html", &[(header::IF_NONE_MATCH, &etag)]);
        assert_eq!(resp.status(), Status::NotModified);
        assert_eq!(resp.body(), None);

        let resp = get(&router, "/index.html", &[(header::IF_MODIFIED_SINCE, &last_modified)]);
        assert_eq!(resp.status(), Status::NotModified);

        let resp = get(
            &router,
            "/index.html",
            &[(header::IF_MODIFIED_SINCE, "Sun, 06 Nov 1994 08:49:37 GMT")],
        );
        assert_eq!(resp.status(), Status::Ok);

        let resp = get(
            &router,
            "/index.html",
            &[(header::IF_NONE_MATCH, &etag), (header::CACHE_CONTROL, "no-cache")],
        );
        assert_eq!(resp.status(), Status::Ok);
    }

    #[test_log::test]
    fn errors() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(dir.path());

        let resp = get(&router, "/missing.html", &[]);
        assert_eq!(resp.status(), Status::NotFound);
        assert_eq!(resp.body(), Some(&b"404 Not Found"[..]));

        fs::write(dir.path().join("404.html"), b"<p>gone</p>").unwrap();
        let resp = get(&router, "/missing.html", &[]);
        assert_eq!(resp.body(), Some(&b"<p>gone</p>"[..]));
        assert_eq!(resp.header(header::CONTENT_TYPE), Some("text/html"));

        let resp = get(&router, "/../secret", &[]);
        assert_eq!(resp.status(), Status::Forbidden);

        let resp = router.handle(b"PUT /x HTTP/1.1\r\n\r\n");
        assert_eq!(resp.status(), Status::MethodNotAllowed);
        assert_eq!(resp.header(header::CONNECTION), Some("close"));

        let resp = router.handle(b"GET /x HTTP/2.0\r\n\r\n");
        assert_eq!(resp.status(), Status::BadRequest);

        let resp = router.handle(b"GET /x HTTP/1.1\r\nno colon here\r\n\r\n");
        assert_eq!(resp.status(), Status::BadRequest);

        let resp = router.handle(b"hello\r\n\r\n");
        assert_eq!(resp.status(), Status::BadRequest);

        let resp = post(&router, "/unknown", "", None);
        assert_eq!(resp.status(), Status::NotFound);

        let resp = router.reject(Status::InternalServerError);
        assert_eq!(resp.status(), Status::InternalServerError);
        assert_eq!(resp.header(header::CONNECTION), Some("close"));

        let resp = router.reject(Status::BadRequest);
        assert_eq!(resp.status(), Status::BadRequest);
        assert_eq!(resp.body(), Some(&b"400 Bad Request"[..]));
    }

    #[test_log::test]
    fn redirect_rule() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(dir.path());

        let resp = get(&router, "/old", &[]);
        assert_eq!(resp.status(), Status::MovedPermanently);
        assert_eq!(resp.header(header::LOCATION), Some("/new"));
        assert_eq!(resp.body(), Some(&b"Redirecting to /new"[..]));
    }

    #[test_log::test]
    fn sessions() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(dir.path());

        let resp = get(&router, "/user/home.html", &[]);
        assert_eq!(resp.status(), Status::Unauthorized);

        let resp = post(&router, "/register", "username=alice&password=pw", None);
        assert_eq!(resp.status(), Status::Ok);

        let resp = post(&router, "/register", "username=alice&password=pw", None);
        assert_eq!(resp.status(), Status::Conflict);

        let resp = post(&router, "/register", "username=bob", None);
        assert_eq!(resp.status(), Status::BadRequest);

        let resp = post(&router, "/login", "username=alice&password=nope", None);
        assert_eq!(resp.status(), Status::Unauthorized);

        let resp = post(&router, "/login", "username=alice&password=pw", None);
        assert_eq!(resp.status(), Status::Ok);

        let set_cookie = resp.header(header::SET_COOKIE).unwrap();
        assert!(set_cookie.starts_with("sessionId="));
        assert!(set_cookie.ends_with("; HttpOnly; Path=/; Max-Age=3600"));

        let cookie = set_cookie.split(';').next().unwrap().to_string();

        let resp = get(&router, "/user/home.html", &[(header::COOKIE, &cookie)]);
        assert_eq!(resp.status(), Status::Ok);
        assert_eq!(resp.body(), Some(&b"secret"[..]));

        let resp = post(&router, "/logout", "", None);
        assert_eq!(resp.status(), Status::BadRequest);

        let resp = post(&router, "/logout", "", Some(&cookie));
        assert_eq!(resp.status(), Status::Ok);
        assert_eq!(
            resp.header(header::SET_COOKIE),
            Some("sessionId=; HttpOnly; Path=/; Max-Age=0")
        );

        let resp = get(&router, "/user/home.html", &[(header::COOKIE, &cookie)]);
        assert_eq!(resp.status(), Status::Unauthorized);
    }

    #[test_log::test]
    fn connection_header() {
        let dir = tempfile::tempdir().unwrap();
        let router = setup(dir.path());

        let resp = get(&router, "/", &[(header::CONNECTION, "close")]);
        assert_eq!(resp.header(header::CONNECTION), Some("close"));

        let resp = router.handle(b"GET / HTTP/1.0\r\n\r\n");
        assert_eq!(resp.version(), Version::Http10);
        assert_eq!(resp.header(header::CONNECTION), Some("close"));

        let resp = router.handle(b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(resp.header(header::CONNECTION), Some("keep-alive"));

        let config = ServerConfig {
            static_dir: dir.path().to_path_buf(),
            keep_alive: false,
            ..Default::default()
        };
        let router = Router::new(&config);

        let resp = get(&router, "/", &[]);
        assert_eq!(resp.header(header::CONNECTION), Some("close"));
    }
}
