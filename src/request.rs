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

//! Request and reply objects exchanged with the application

use std::{cell::RefCell, fmt::Display, rc::Rc};

use crate::{
    error::StreamErrorKind,
    parser::{Header, Method, Version},
};

/// Connection-specific headers that have no meaning on a SPDY stream
const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "host",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
];

/// Lowest priority a stream can carry
pub const LOWEST_PRIORITY: u8 = 7;

/// Outbound request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// method
    pub method: Method,
    /// `https` or `http`
    pub scheme: String,
    /// authority, sent as `:host`
    pub host: String,
    /// path and query, sent as `:path`
    pub path: String,
    /// version
    pub version: Version,
    /// headers
    pub headers: Vec<Header>,
    /// 0 is the highest priority, 7 the lowest
    pub priority: u8,
    /// Whether body chunks will follow the headers. When `false` the SYN_STREAM carries FIN.
    pub has_body: bool,
}

impl Request {
    /// Creates a request. Methods that conventionally carry a body leave the stream open for
    /// [`send_body`](crate::session::Session::send_body).
    pub fn new(method: Method, host: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method,
            scheme: "https".into(),
            host: host.into(),
            path: path.into(),
            version: Version::H1_1,
            headers: Vec::default(),
            priority: 3,
            has_body: method.expects_body(),
        }
    }

    /// GET request without a body
    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Get, host, path)
    }

    /// POST request whose body is streamed afterwards
    pub fn post(host: impl Into<String>, path: impl Into<String>) -> Self {
        Self::new(Method::Post, host, path)
    }

    /// Appends a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    /// Sets the scheme.
    pub fn scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// Sets the priority, clamped to the lowest priority.
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(LOWEST_PRIORITY);
        self
    }

    /// Overrides whether body chunks follow.
    pub fn with_body(mut self, has_body: bool) -> Self {
        self.has_body = has_body;
        self
    }

    /// The name/value block sent in SYN_STREAM: pseudo headers first, then the caller's headers
    /// lower-cased, without hop-by-hop headers. Repeated names are folded into one NUL separated
    /// value.
    pub fn header_block(&self) -> Vec<Header> {
        let mut block = vec![
            Header::new(":method", self.method.as_str()),
            Header::new(":path", self.path.as_str()),
            Header::new(":version", self.version.as_str()),
            Header::new(":host", self.host.as_str()),
            Header::new(":scheme", self.scheme.as_str()),
        ];

        for header in &self.headers {
            let name = header.name.to_ascii_lowercase();
            if name.is_empty() || name.starts_with(':') || HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }

            match block.iter_mut().find(|h| h.name == name) {
                Some(existing) => {
                    existing.value.push('\0');
                    existing.value.push_str(&header.value);
                }
                None => block.push(Header::new(name, header.value.as_str())),
            }
        }

        block
    }
}

impl Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "{} {}://{}{} {}\n",
            self.method, self.scheme, self.host, self.path, self.version
        ))?;

        for header in self.headers.iter() {
            f.write_fmt(format_args!("{}\n", header))?;
        }

        Ok(())
    }
}

/// Receives everything the peer sends on one stream.
///
/// Every call happens from inside the session's entry points, in wire order. After
/// [`on_complete`](ReplySink::on_complete) or [`on_error`](ReplySink::on_error) the sink is
/// dropped by the session and receives nothing further.
pub trait ReplySink {
    /// Headers from SYN_REPLY or a later HEADERS frame
    fn on_headers(&mut self, headers: &[Header]);
    /// A chunk of the reply body
    fn on_body_chunk(&mut self, chunk: &[u8]);
    /// The peer finished the reply.
    fn on_complete(&mut self);
    /// The stream failed. Called at most once, and never after `on_complete`.
    fn on_error(&mut self, kind: StreamErrorKind);
}

/// Buffers a whole reply in memory.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reply {
    /// All headers received, in order
    pub headers: Vec<Header>,
    /// Body bytes received so far
    pub body: Vec<u8>,
    /// Whether the peer finished the reply
    pub complete: bool,
    /// Why the stream failed, if it did
    pub error: Option<StreamErrorKind>,
}

/// A reply shared between the session, which fills it, and the application, which reads it.
pub type SharedReply = Rc<RefCell<Reply>>;

impl Reply {
    /// Creates an empty reply ready to hand to the session.
    pub fn shared() -> SharedReply {
        Rc::new(RefCell::new(Reply::default()))
    }

    /// First value of the header `name`
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.name == name)
            .and_then(|h| h.values().next())
    }

    /// Numeric part of `:status`, e.g. 200 for `200 OK`
    pub fn status(&self) -> Option<u16> {
        self.header(":status")?
            .split(' ')
            .next()
            .and_then(|code| code.parse().ok())
    }

    /// Parsed `:version`
    pub fn version(&self) -> Option<Version> {
        Version::try_from(self.header(":version")?.as_bytes()).ok()
    }

    /// Whether the stream reached its end, successfully or not
    pub fn is_finished(&self) -> bool {
        self.complete || self.error.is_some()
    }
}

impl ReplySink for SharedReply {
    fn on_headers(&mut self, headers: &[Header]) {
        self.borrow_mut().headers.extend_from_slice(headers);
    }

    fn on_body_chunk(&mut self, chunk: &[u8]) {
        self.borrow_mut().body.extend_from_slice(chunk);
    }

    fn on_complete(&mut self) {
        self.borrow_mut().complete = true;
    }

    fn on_error(&mut self, kind: StreamErrorKind) {
        self.borrow_mut().error = Some(kind);
    }
}
