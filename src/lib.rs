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

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unused_imports
)]
// Disallow warnings in examples.
#![doc(test(attr(deny(warnings))))]

//! A client-side SPDY/3.1 session engine.
//!
//! The engine multiplexes request/reply streams over a single reliable byte stream. It owns frame
//! parsing and serialization, the per-direction header compression contexts, stream lifecycle,
//! and flow control. Transport is left to the caller: feed inbound bytes to
//! [`Session::on_bytes_available`](session::Session::on_bytes_available) and drain
//! [`Session::pending_output`](session::Session::pending_output) to the socket, or use the mio
//! based [`client::Client`] to do both.
//!
//! ```
//! use spdy_engine::{request::{Reply, Request}, session::{Session, SessionConfig}};
//!
//! # fn main() -> spdy_engine::error::Result<()> {
//! let mut session = Session::new(SessionConfig::default())?;
//! let reply = Reply::shared();
//! let handle = session.open_stream(&Request::get("www.example.org", "/"), Box::new(reply.clone()))?;
//! assert_eq!(1, handle.id());
//! assert!(!session.pending_output().is_empty());
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod client;
pub mod compression;
pub mod connection;
pub mod error;
pub mod flow;
pub mod parser;
pub mod request;
pub mod session;
pub mod stream;
