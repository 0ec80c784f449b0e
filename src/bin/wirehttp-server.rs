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

use clap::Parser;
use log::{error, info};
use std::error::Error;
use std::path::PathBuf;
use std::process;
use wirehttp::core::config::Config;
use wirehttp::core::log::{self as wlog, open_log_file};

#[derive(Parser, Clone)]
#[command(name = "wirehttp-server", version, about = "Static file HTTP/1.1 server.")]
struct CliArgs {
    #[arg(long, value_name = "file", help = "Config file (JSON or TOML).")]
    config: Option<PathBuf>,

    #[arg(long, value_name = "addr", help = "Address to listen on.")]
    host: Option<String>,

    #[arg(long, value_name = "port", help = "Port to listen on.")]
    port: Option<u16>,

    #[arg(long, value_name = "x", help = "Log level, 0-4 (default: 2).")]
    loglevel: Option<u8>,

    #[arg(long, value_name = "file", help = "File to log to.")]
    logfile: Option<PathBuf>,
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let mut config = Config::load(args.config.as_deref())?;

    if let Some(host) = args.host {
        config.server.host = host;
    }

    if let Some(port) = args.port {
        config.server.port = port;
    }

    let level = args.loglevel.unwrap_or(config.server.log_level);

    let log_file = match &args.logfile {
        Some(path) => match open_log_file(path) {
            Ok(f) => Some(f),
            Err(e) => {
                eprintln!("unable to open log file: {}. logging to standard out.", e);
                None
            }
        },
        None => None,
    };

    wlog::init(level, log_file);

    if let Some(path) = &args.config {
        info!("using config: {}", path.display());
    }

    wirehttp::run(&config.server)
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        error!("{}", e);
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
