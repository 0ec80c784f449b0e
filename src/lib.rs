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

pub mod client;
pub mod core;
pub mod router;
pub mod server;

use crate::core::config::ServerConfig;
use log::{error, info};
use router::Router;
use server::Server;
use signal_hook::consts::TERM_SIGNALS;
use signal_hook::iterator::Signals;
use std::error::Error;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;

fn wait_for_term() -> Result<(), Box<dyn Error>> {
    let mut signals = Signals::new(TERM_SIGNALS)?;

    let term_now = Arc::new(AtomicBool::new(false));

    // a second term signal exits immediately
    for signal_type in TERM_SIGNALS {
        signal_hook::flag::register_conditional_shutdown(*signal_type, 1, Arc::clone(&term_now))?;
        signal_hook::flag::register(*signal_type, Arc::clone(&term_now))?;
    }

    if let Some(signal) = signals.forever().next() {
        info!("received signal {}", signal);
    }

    Ok(())
}

/// Runs a server until a termination signal arrives.
pub fn run(config: &ServerConfig) -> Result<(), Box<dyn Error>> {
    info!("starting...");

    let router = Router::new(config);
    let mut server = Server::new(config, router)?;

    let stopper = server.stopper();

    let thread = thread::Builder::new()
        .name(String::from("server"))
        .spawn(move || {
            if let Err(e) = server.run() {
                error!("server failed: {}", e);
            }
        })?;

    info!("started");

    wait_for_term()?;

    info!("stopping...");

    stopper.stop();

    if thread.join().is_err() {
        error!("server thread panicked");
    }

    info!("stopped");

    Ok(())
}
