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

use config::File;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to load config: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_redirect_status() -> u16 {
    302
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RedirectRule {
    pub path: String,
    pub target: String,

    #[serde(default = "default_redirect_status")]
    pub status: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub server_name: String,
    pub server_version: String,
    pub keep_alive: bool,
    pub timeout_ms: u64,
    pub buffer_size: usize,

    // limits on a single request's head and body, in bytes
    pub max_head_size: usize,
    pub max_body_size: usize,

    pub thread_pool: bool,
    pub max_threads: usize,
    pub max_connections: usize,
    pub session_expiry_secs: u64,
    pub cache_control: String,
    pub default_page: String,
    pub static_dir: PathBuf,
    pub protected_prefix: String,
    pub redirects: Vec<RedirectRule>,
    pub log_level: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::from("127.0.0.1"),
            port: 8080,
            server_name: String::from("SimpleHttpServer"),
            server_version: String::from("1.0"),
            keep_alive: true,
            timeout_ms: 5000,
            buffer_size: 2048,
            max_head_size: 8192,
            max_body_size: 1024 * 1024,
            thread_pool: false,
            max_threads: 4,
            max_connections: 1000,
            session_expiry_secs: 3600,
            cache_control: String::from("public, max-age=3600"),
            default_page: String::from("index.html"),
            static_dir: PathBuf::from("static"),
            protected_prefix: String::from("/user/"),
            redirects: Vec::new(),
            log_level: 2,
        }
    }
}

impl ServerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Worker count, clamped to 1..=2x the available cores.
    pub fn worker_count(&self) -> usize {
        let cores = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        self.max_threads.clamp(1, cores * 2)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ClientConfig {
    pub client_name: String,
    pub client_version: String,
    pub keep_alive: bool,
    pub connection_timeout_ms: u64,
    pub buffer_size: usize,
    pub enable_cache: bool,

    // seconds, <= 0 means entries without max-age never expire
    pub cache_max_age: i64,

    pub max_redirects: u32,
    pub log_level: u8,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_name: String::from("SimpleHttpClient"),
            client_version: String::from("1.0"),
            keep_alive: true,
            connection_timeout_ms: 5000,
            buffer_size: 2048,
            enable_cache: true,
            cache_max_age: 3600,
            max_redirects: 5,
            log_level: 2,
        }
    }
}

impl ClientConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Loads the given file (format chosen by extension) over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        let config: Self = builder.build()?.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in &self.server.redirects {
            if !matches!(rule.status, 301 | 302 | 303) {
                return Err(ConfigError::Invalid(format!(
                    "redirect for {} has unsupported status {}",
                    rule.path, rule.status
                )));
            }

            if !rule.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "redirect path must start with '/': {}",
                    rule.path
                )));
            }
        }

        if self.server.buffer_size == 0 {
            return Err(ConfigError::Invalid("server buffer_size must be > 0".into()));
        }

        if self.server.max_head_size == 0 || self.server.max_body_size == 0 {
            return Err(ConfigError::Invalid(
                "server max_head_size and max_body_size must be > 0".into(),
            ));
        }

        if self.client.buffer_size == 0 {
            return Err(ConfigError::Invalid("client buffer_size must be > 0".into()));
        }

        Ok(())
    }
}
