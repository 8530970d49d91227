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

//! Error types

use std::io;

use crate::{compression::CompressionError, parser::ParseError, parser::RstStatus};

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the session and its transports.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed, oversized or unknown frame. Fatal to the connection.
    #[error("framing error: {0}")]
    Framing(#[from] ParseError),

    /// Header block could not be compressed or decompressed. Fatal to the connection.
    #[error("header compression error: {0}")]
    Compression(#[from] CompressionError),

    /// The peer broke a connection-level rule, such as overrunning the connection window.
    #[error("connection protocol error: {0}")]
    Protocol(&'static str),

    /// No more streams may be opened until one closes.
    #[error("concurrent stream limit of {0} reached")]
    ConcurrencyLimit(u32),

    /// Every stream id of this connection has been used.
    #[error("stream ids exhausted")]
    StreamIdsExhausted,

    /// The session is draining after a GOAWAY and accepts no new streams.
    #[error("session is going away (last good stream {last_good_stream_id})")]
    GoingAway {
        /// Highest stream the peer will process
        last_good_stream_id: u32,
    },

    /// The handle does not refer to a live stream.
    #[error("unknown stream {0}")]
    UnknownStream(u32),

    /// The stream was already half-closed for sending.
    #[error("stream {0} is closed for sending")]
    StreamClosed(u32),

    /// The session failed earlier or was shut down.
    #[error("session closed")]
    SessionClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// Whether the error ends the connection, as opposed to refusing a single local call.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            Self::Framing(_) | Self::Compression(_) | Self::Protocol(_) | Self::Io(_) | Self::Tls(_)
        )
    }
}

/// Why a single stream failed, as reported to its [`ReplySink`](crate::request::ReplySink).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamErrorKind {
    /// The peer reset the stream.
    #[error("reset by peer: {0}")]
    Reset(RstStatus),
    /// The peer violated the protocol on this stream and we reset it.
    #[error("protocol violation: {0}")]
    Protocol(RstStatus),
    /// The peer's GOAWAY excluded this stream; it is safe to retry on a new connection.
    #[error("not accepted by peer")]
    NotAcceptedByPeer,
    /// The connection failed while the stream was in flight.
    #[error("connection failed")]
    ConnectionFailed,
}
