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

//! Uncompressed name/value header block
//!
//! ```text
//! +------------------------------------+
//! | Number of Name/Value pairs (int32) |
//! +------------------------------------+
//! |     Length of name (int32)         |
//! +------------------------------------+
//! |           Name (string)            |
//! +------------------------------------+
//! |     Length of value  (int32)       |
//! +------------------------------------+
//! |          Value   (string)          |
//! +------------------------------------+
//! |           (repeats)                |
//! ```

use std::fmt::Display;

use super::{raw_frame::RawFrame, ParseError, ParseResult};

/// Two length words, the least a pair can occupy
const MIN_PAIR_LEN: usize = 8;

/// A single header. Several values for one name are joined with NUL bytes inside `value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Header {
    /// Header name
    pub name: String,
    /// Header value
    pub value: String,
}

impl Header {
    /// Creates a header from anything string-like.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    /// Iterates over the NUL separated values.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.value.split('\0')
    }
}

impl Display for Header {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{}: {}", self.name, self.value))
    }
}

/// Serializes `headers` into an uncompressed block, appending to `out`.
pub fn encode(headers: &[Header], out: &mut Vec<u8>) {
    out.reserve(4 + headers.iter().map(|h| 8 + h.name.len() + h.value.len()).sum::<usize>());
    out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
    for header in headers {
        out.extend_from_slice(&(header.name.len() as u32).to_be_bytes());
        out.extend_from_slice(header.name.as_bytes());
        out.extend_from_slice(&(header.value.len() as u32).to_be_bytes());
        out.extend_from_slice(header.value.as_bytes());
    }
}

/// Parses an uncompressed block. The block must be consumed exactly.
pub fn decode(block: &[u8]) -> ParseResult<Vec<Header>> {
    let mut raw = RawFrame::new(block);
    let count = raw.read_u32("header count")? as usize;

    // A hostile count must not drive the allocation below.
    if count > raw.remaining() / MIN_PAIR_LEN {
        return Err(ParseError::Malformed("header count"));
    }

    let mut headers = Vec::with_capacity(count);
    for _ in 0..count {
        let name_len = raw.read_u32("header name length")? as usize;
        if name_len == 0 {
            return Err(ParseError::Malformed("header name"));
        }
        let name = raw.take(name_len, "header name")?;
        let value_len = raw.read_u32("header value length")? as usize;
        let value = raw.take(value_len, "header value")?;

        let name = std::str::from_utf8(name).map_err(|_| ParseError::Malformed("header name"))?;
        let value =
            std::str::from_utf8(value).map_err(|_| ParseError::Malformed("header value"))?;
        headers.push(Header::new(name, value));
    }

    if !raw.is_empty() {
        return Err(ParseError::Malformed("header block trailer"));
    }

    Ok(headers)
}
