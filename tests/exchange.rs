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

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::thread;
use std::time::Duration;
use wirehttp::client::{self, Client};
use wirehttp::core::config::{ClientConfig, RedirectRule, ServerConfig};
use wirehttp::core::http1::{header, Message, Method, Request, Status};
use wirehttp::core::time;
use wirehttp::router::Router;
use wirehttp::server::{Server, Stopper};

struct Running {
    addr: SocketAddr,
    stopper: Stopper,
    thread: Option<thread::JoinHandle<()>>,
}

impl Running {
    fn port(&self) -> u16 {
        self.addr.port()
    }

    fn stop(&mut self) {
        self.stopper.stop();

        if let Some(thread) = self.thread.take() {
            thread.join().unwrap();
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start(config: ServerConfig) -> Running {
    let router = Router::new(&config);
    let mut server = Server::new(&config, router).unwrap();

    let addr = server.local_addr().unwrap();
    let stopper = server.stopper();

    let thread = thread::spawn(move || server.run().unwrap());

    Running {
        addr,
        stopper,
        thread: Some(thread),
    }
}

fn site(dir: &Path) -> ServerConfig {
    fs::write(dir.join("index.html"), b"<h1>index</h1>").unwrap();
    fs::write(dir.join("new"), b"the new page").unwrap();
    fs::create_dir(dir.join("user")).unwrap();
    fs::write(dir.join("user/profile.html"), b"profile").unwrap();

    ServerConfig {
        port: 0,
        static_dir: dir.to_path_buf(),
        redirects: vec![RedirectRule {
            path: String::from("/old"),
            target: String::from("/new"),
            status: 301,
        }],
        ..Default::default()
    }
}

fn client_config() -> ClientConfig {
    ClientConfig {
        connection_timeout_ms: 2000,
        ..Default::default()
    }
}

fn get(target: &str) -> Request {
    Request::new(Method::Get, target).unwrap()
}

fn post(target: &str, form: &str) -> Request {
    let mut req = Request::new(Method::Post, target).unwrap();
    req.set_body(
        form.as_bytes().to_vec(),
        Some("application/x-www-form-urlencoded"),
    );

    req
}

fn mtime_millis(path: &Path) -> String {
    let modified = fs::metadata(path).unwrap().modified().unwrap();

    time::unix_millis(modified).to_string()
}

fn get_and_revalidate(config: ServerConfig, dir: &Path) {
    let server = start(config);
    let mut client = Client::new(&ClientConfig {
        enable_cache: false,
        ..client_config()
    });

    let resp = client.send("127.0.0.1", server.port(), get("/index.html")).unwrap();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.body(), Some(&b"<h1>index</h1>"[..]));

    let etag = mtime_millis(&dir.join("index.html"));
    assert_eq!(resp.header(header::ETAG), Some(etag.as_str()));

    let mut req = get("/index.html");
    req.set_header(header::IF_NONE_MATCH, &etag);

    let resp = client.send("127.0.0.1", server.port(), req).unwrap();
    assert_eq!(resp.status(), Status::NotModified);
    assert_eq!(resp.body(), None);
}

#[test_log::test]
fn fetch_and_not_modified() {
    let dir = tempfile::tempdir().unwrap();
    let config = site(dir.path());

    get_and_revalidate(config, dir.path());
}

#[test_log::test]
fn fetch_and_not_modified_with_workers() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig {
        thread_pool: true,
        max_threads: 2,
        ..site(dir.path())
    };

    get_and_revalidate(config, dir.path());
}

#[test_log::test]
fn client_cache_revalidates_after_expiry() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(ServerConfig {
        cache_control: String::from("public, max-age=1"),
        ..site(dir.path())
    });

    let mut client = Client::new(&client_config());

    let first = client.send("127.0.0.1", server.port(), get("/index.html")).unwrap();
    assert_eq!(first.status(), Status::Ok);
    assert_eq!(client.cache().len(), 1);

    thread::sleep(Duration::from_millis(1100));

    // the server answers the conditional request with 304, and the client
    // serves its stored copy
    let resp = client.send("127.0.0.1", server.port(), get("/index.html")).unwrap();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.body(), first.body());
    assert_eq!(resp.header(header::ETAG), first.header(header::ETAG));
}

#[test_log::test]
fn cached_response_survives_server_stop() {
    let dir = tempfile::tempdir().unwrap();
    let mut server = start(site(dir.path()));
    let port = server.port();

    let mut client = Client::new(&client_config());

    let resp = client.send("127.0.0.1", port, get("/")).unwrap();
    assert_eq!(resp.status(), Status::Ok);

    client.stop();
    server.stop();

    let resp = client.send("127.0.0.1", port, get("/")).unwrap();
    assert_eq!(resp.body(), Some(&b"<h1>index</h1>"[..]));

    let ret = client.send("127.0.0.1", port, get("/new"));
    assert!(matches!(ret, Err(client::Error::Connect(_, _))));
}

#[test_log::test]
fn redirect_rule_followed() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(site(dir.path()));

    let mut client = Client::new(&client_config());

    let resp = client.send("127.0.0.1", server.port(), get("/old")).unwrap();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.body(), Some(&b"the new page"[..]));

    let mut client = Client::new(&ClientConfig {
        max_redirects: 0,
        ..client_config()
    });

    let ret = client.send("127.0.0.1", server.port(), get("/old"));
    assert!(matches!(ret, Err(client::Error::TooManyRedirects(0))));
}

#[test_log::test]
fn login_then_protected() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(site(dir.path()));
    let port = server.port();

    let mut client = Client::new(&client_config());

    let resp = client
        .send("127.0.0.1", port, post("/register", "username=carol&password=secret"))
        .unwrap();
    assert_eq!(resp.status(), Status::Ok);

    let resp = client
        .send("127.0.0.1", port, post("/login", "username=carol&password=secret"))
        .unwrap();
    assert_eq!(resp.status(), Status::Ok);
    assert!(resp
        .header(header::SET_COOKIE)
        .unwrap()
        .starts_with("sessionId="));

    let resp = client.send("127.0.0.1", port, get("/user/profile.html")).unwrap();
    assert_eq!(resp.status(), Status::Ok);
    assert_eq!(resp.body(), Some(&b"profile"[..]));

    let mut other = Client::new(&client_config());

    let resp = other.send("127.0.0.1", port, get("/user/profile.html")).unwrap();
    assert_eq!(resp.status(), Status::Unauthorized);
}

#[test_log::test]
fn connection_reused() {
    let dir = tempfile::tempdir().unwrap();
    let server = start(site(dir.path()));
    let port = server.port();

    let mut client = Client::new(&ClientConfig {
        enable_cache: false,
        ..client_config()
    });

    client.send("127.0.0.1", port, get("/index.html")).unwrap();
    let id = client.connection_id("127.0.0.1", port).unwrap();

    client.send("127.0.0.1", port, get("/new")).unwrap();
    assert_eq!(client.connection_id("127.0.0.1", port), Some(id));

    // asking to close drops the pooled connection
    let mut req = get("/index.html");
    req.set_header(header::CONNECTION, "close");
    client.send("127.0.0.1", port, req).unwrap();
    assert_eq!(client.connection_id("127.0.0.1", port), None);

    client.send("127.0.0.1", port, get("/index.html")).unwrap();
    assert_ne!(client.connection_id("127.0.0.1", port), Some(id));
}
