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

use log::info;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "sessionId";

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("missing username or password")]
    MissingField,

    #[error("user already exists")]
    UserExists,

    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("no session cookie")]
    NoSession,
}

struct Session {
    username: String,
    expires: Instant,
}

pub fn session_cookie(id: &str, max_age_secs: u64) -> String {
    format!(
        "{}={}; HttpOnly; Path=/; Max-Age={}",
        SESSION_COOKIE, id, max_age_secs
    )
}

// finds the session id in a Cookie header value
fn session_id(cookie_header: &str) -> Option<&str> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;

        if name == SESSION_COOKIE {
            Some(value)
        } else {
            None
        }
    })
}

/// Users and their login sessions. Owned by the router and safe to use
/// from several worker threads.
pub struct SessionManager {
    users: Mutex<HashMap<String, String>>,
    sessions: Mutex<HashMap<String, Session>>,
    expiry: Duration,
}

impl SessionManager {
    pub fn new(expiry: Duration) -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    pub fn expiry(&self) -> Duration {
        self.expiry
    }

    pub fn register(&self, username: &str, password: &str) -> Result<(), SessionError> {
        if username.is_empty() || password.is_empty() {
            return Err(SessionError::MissingField);
        }

        let mut users = self.users.lock().unwrap();

        if users.contains_key(username) {
            return Err(SessionError::UserExists);
        }

        users.insert(username.to_string(), password.to_string());

        info!("registered user {}", username);

        Ok(())
    }

    /// Returns the new session id.
    pub fn login(&self, username: &str, password: &str) -> Result<String, SessionError> {
        if username.is_empty() || password.is_empty() {
            return Err(SessionError::MissingField);
        }

        match self.users.lock().unwrap().get(username) {
            Some(stored) if stored == password => {}
            _ => return Err(SessionError::InvalidCredentials),
        }

        let id = Uuid::new_v4().to_string();

        self.sessions.lock().unwrap().insert(
            id.clone(),
            Session {
                username: username.to_string(),
                expires: Instant::now() + self.expiry,
            },
        );

        info!("login {}", username);

        Ok(id)
    }

    pub fn logout(&self, cookie_header: Option<&str>) -> Result<(), SessionError> {
        let id = match cookie_header.and_then(session_id) {
            Some(id) => id,
            None => return Err(SessionError::NoSession),
        };

        if let Some(s) = self.sessions.lock().unwrap().remove(id) {
            info!("logout {}", s.username);
        }

        Ok(())
    }

    /// Returns the session's username if it is live. Expired sessions are
    /// removed.
    pub fn validate(&self, cookie_header: Option<&str>) -> Option<String> {
        let id = cookie_header.and_then(session_id)?;

        let mut sessions = self.sessions.lock().unwrap();

        let expired = match sessions.get(id) {
            Some(s) if Instant::now() <= s.expires => return Some(s.username.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            sessions.remove(id);

            info!("session expired");
        }

        None
    }
}
