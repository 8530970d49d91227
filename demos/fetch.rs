// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fetches one or more paths from a plaintext SPDY/3.1 server over a single connection.
//!
//! ```text
//! cargo run --example fetch -- 127.0.0.1:8080 / /style.css
//! ```

use std::{net::ToSocketAddrs, time::Duration};

use mio::{net::TcpStream, Token};
use spdy_engine::{
    client::Client,
    connection::ConnectionBuilder,
    request::{Reply, Request},
    session::{Session, SessionConfig},
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let authority = args.next().unwrap_or_else(|| "127.0.0.1:8080".into());
    let mut paths: Vec<String> = args.collect();
    if paths.is_empty() {
        paths.push("/".into());
    }

    let addr = authority
        .to_socket_addrs()?
        .next()
        .ok_or("authority did not resolve")?;
    let stream = TcpStream::connect(addr)?;
    let session = Session::new(SessionConfig::default())?;
    let connection = ConnectionBuilder::new(stream, Token(0))
        .with_plaintext(session)
        .build();
    let mut client = Client::new(connection)?;

    let mut replies = Vec::new();
    for path in &paths {
        let reply = Reply::shared();
        let request = Request::get(authority.as_str(), path.as_str())
            .scheme("http")
            .header("accept", "*/*")
            .header("user-agent", "spdy-engine/0.0.1");
        match client.session().open_stream(&request, Box::new(reply.clone())) {
            Ok(_) => replies.push((path, reply)),
            // e.g. the server's concurrency limit; the remaining paths still run
            Err(e) if !e.is_connection_fatal() => println!("{} skipped: {}", path, e),
            Err(e) => return Err(e.into()),
        }
    }

    let outcome = client.run_until_idle(Some(Duration::from_secs(30)))?;
    tracing::info!(?outcome, "finished");

    for (path, reply) in replies {
        let reply = reply.borrow();
        match reply.error {
            Some(kind) => println!("{} failed: {}", path, kind),
            None => {
                println!(
                    "{} -> {} ({} bytes)",
                    path,
                    reply.header(":status").unwrap_or("?"),
                    reply.body.len()
                );
                for header in &reply.headers {
                    println!("  {}", header);
                }
            }
        }
    }

    Ok(())
}
