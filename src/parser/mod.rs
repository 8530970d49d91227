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

//! SPDY/3.1 wire format

pub mod frame;
pub mod header_block;
pub mod method;
pub mod raw_frame;
pub mod status;
pub mod version;

pub use frame::{Frame, FRAME_HEADER_LEN, MAX_FRAME_PAYLOAD, MAX_STREAM_ID, SPDY_VERSION};
pub use header_block::Header;
pub use method::Method;
pub use status::{GoAwayStatus, RstStatus};
pub use version::Version;

/// Failure to decode a frame or a name/value block.
///
/// [`ParseError::Incomplete`] is not a protocol violation: it asks the caller to buffer more
/// bytes and retry. Every other variant is fatal to the connection when it comes from the frame
/// layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// Fewer bytes are buffered than the frame header or its declared payload needs.
    #[error("incomplete frame")]
    Incomplete,
    /// Control frame carrying a protocol version other than 3
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),
    /// Control frame type outside the known set
    #[error("invalid control frame type {0}")]
    InvalidType(u16),
    /// Declared payload exceeds the permitted maximum.
    #[error("frame payload of {length} bytes exceeds limit of {limit}")]
    FrameTooLarge {
        /// Declared payload length
        length: usize,
        /// Configured maximum
        limit: usize,
    },
    /// Payload length does not match what the frame type requires.
    #[error("invalid payload length {length} for {frame}")]
    InvalidLength {
        /// Frame type name
        frame: &'static str,
        /// Declared payload length
        length: usize,
    },
    /// Status code outside the known set
    #[error("invalid status code {0}")]
    InvalidStatus(u32),
    /// A field could not be read or held an illegal value.
    #[error("malformed {0}")]
    Malformed(&'static str),
}

/// Result alias for the parser
pub type ParseResult<T> = std::result::Result<T, ParseError>;
