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
use std::error::Error;
use std::path::PathBuf;
use std::process;
use url::Url;
use wirehttp::client::Client;
use wirehttp::core::config::Config;
use wirehttp::core::http1::{Message, Method, Request, Response};
use wirehttp::core::log as wlog;

#[derive(Parser, Clone)]
#[command(name = "wirehttp-client", version, about = "Send HTTP/1.1 requests.")]
struct CliArgs {
    #[arg(value_name = "url", help = "http:// URL to request.")]
    url: String,

    #[arg(long, value_name = "file", help = "Config file (JSON or TOML).")]
    config: Option<PathBuf>,

    #[arg(
        long,
        value_name = "form",
        help = "Send a POST with this urlencoded form body."
    )]
    data: Option<String>,

    #[arg(
        long,
        value_name = "n",
        default_value_t = 1,
        help = "Send the request n times over the same client."
    )]
    repeat: u32,

    #[arg(long, value_name = "x", help = "Log level, 0-4 (default: 2).")]
    loglevel: Option<u8>,
}

fn print_response(resp: &Response) {
    println!("{} {}", resp.version(), resp.status());

    for (name, value) in resp.headers().iter() {
        println!("{}: {}", name, value);
    }

    println!();

    if let Some(body) = resp.body() {
        match std::str::from_utf8(body) {
            Ok(s) => println!("{}", s),
            Err(_) => println!("<{} bytes of binary data>", body.len()),
        }
    }
}

fn process_args_and_run(args: CliArgs) -> Result<(), Box<dyn Error>> {
    let config = Config::load(args.config.as_deref())?;

    wlog::init(args.loglevel.unwrap_or(config.client.log_level), None);

    let url = Url::parse(&args.url)?;

    if url.scheme() != "http" {
        return Err(format!("unsupported scheme: {}", url.scheme()).into());
    }

    let host = url.host_str().ok_or("url has no host")?.to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    let mut target = url.path().to_string();

    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut client = Client::new(&config.client);

    for _ in 0..args.repeat {
        let req = match &args.data {
            Some(data) => {
                let mut req = Request::new(Method::Post, &target)?;
                req.set_body(
                    data.as_bytes().to_vec(),
                    Some("application/x-www-form-urlencoded"),
                );

                req
            }
            None => Request::new(Method::Get, &target)?,
        };

        let resp = client.send(&host, port, req)?;

        print_response(&resp);
    }

    client.stop();

    Ok(())
}

fn main() {
    let args = CliArgs::parse();

    if let Err(e) = process_args_and_run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
