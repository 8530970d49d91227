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

//! Header block compression
//!
//! Each direction of a session owns one zlib stream. Blocks are sync-flushed so every frame can
//! be decoded as soon as it arrives, but the dictionary state carries over from frame to frame:
//! blocks must be decoded in exactly the order they were encoded, and a single bad block leaves
//! the context unusable for the rest of the session.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use tracing::trace;

use crate::parser::{header_block, Header, ParseError};

pub mod dictionary;

pub use dictionary::SPDY3_DICTIONARY;

/// Output grows in steps of this many bytes.
const OUTPUT_STEP: usize = 1024;

/// Header compression failure. Always fatal to the session that owns the context.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    /// The zlib stream rejected the input or asked for an unexpected dictionary.
    #[error("zlib: {0}")]
    Zlib(String),
    /// The block inflated to more than the permitted size.
    #[error("decompressed header block exceeds {0} bytes")]
    TooLarge(usize),
    /// The inflated bytes are not a valid name/value block.
    #[error("invalid name/value block: {0}")]
    Block(#[from] ParseError),
    /// An earlier failure left the context out of step with the peer.
    #[error("compression context desynchronized by an earlier failure")]
    Desynchronized,
}

/// Compresses outbound header blocks.
#[derive(Debug)]
pub struct HeaderEncoder {
    ctx: Compress,
    poisoned: bool,
}

impl HeaderEncoder {
    /// Creates a zlib stream seeded with [`SPDY3_DICTIONARY`].
    pub fn new() -> Result<Self, CompressionError> {
        let mut ctx = Compress::new(Compression::default(), true);
        ctx.set_dictionary(&SPDY3_DICTIONARY)
            .map_err(|e| CompressionError::Zlib(e.to_string()))?;
        Ok(Self {
            ctx,
            poisoned: false,
        })
    }

    /// Encodes and compresses `headers` as the next block of this context.
    pub fn compress(&mut self, headers: &[Header]) -> Result<Vec<u8>, CompressionError> {
        if self.poisoned {
            return Err(CompressionError::Desynchronized);
        }

        let mut raw = Vec::new();
        header_block::encode(headers, &mut raw);

        let result = self.deflate(&raw);
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn deflate(&mut self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::with_capacity(input.len() / 2 + OUTPUT_STEP);
        let mut consumed = 0;

        loop {
            if out.len() == out.capacity() {
                out.reserve(OUTPUT_STEP);
            }

            let before = self.ctx.total_in();
            self.ctx
                .compress_vec(&input[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| CompressionError::Zlib(e.to_string()))?;
            consumed += (self.ctx.total_in() - before) as usize;

            // A sync flush is complete once all input is taken and zlib stopped short of the
            // output capacity.
            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        trace!(raw = input.len(), compressed = out.len(), "compressed header block");
        Ok(out)
    }
}

/// Decompresses inbound header blocks.
#[derive(Debug)]
pub struct HeaderDecoder {
    ctx: Decompress,
    max_block_size: usize,
    poisoned: bool,
}

impl HeaderDecoder {
    /// Creates a zlib stream that accepts blocks inflating to at most `max_block_size` bytes.
    pub fn new(max_block_size: usize) -> Self {
        Self {
            ctx: Decompress::new(true),
            max_block_size,
            poisoned: false,
        }
    }

    /// Decompresses and parses the next block of this context. Any failure poisons the context.
    pub fn decompress(&mut self, block: &[u8]) -> Result<Vec<Header>, CompressionError> {
        if self.poisoned {
            return Err(CompressionError::Desynchronized);
        }

        let result = self
            .inflate(block)
            .and_then(|raw| Ok(header_block::decode(&raw)?));
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn inflate(&mut self, input: &[u8]) -> Result<Vec<u8>, CompressionError> {
        let mut out = Vec::with_capacity(input.len() * 4 + OUTPUT_STEP);
        let mut consumed = 0;

        loop {
            if out.len() == out.capacity() {
                if out.len() >= self.max_block_size {
                    return Err(CompressionError::TooLarge(self.max_block_size));
                }
                out.reserve(OUTPUT_STEP);
            }

            let before_in = self.ctx.total_in();
            let before_out = out.len();
            let status = match self
                .ctx
                .decompress_vec(&input[consumed..], &mut out, FlushDecompress::Sync)
            {
                Ok(status) => status,
                Err(e) if e.needs_dictionary().is_some() => {
                    consumed += (self.ctx.total_in() - before_in) as usize;
                    self.ctx
                        .set_dictionary(&SPDY3_DICTIONARY)
                        .map_err(|e| CompressionError::Zlib(e.to_string()))?;
                    continue;
                }
                Err(e) => return Err(CompressionError::Zlib(e.to_string())),
            };
            consumed += (self.ctx.total_in() - before_in) as usize;

            if out.len() > self.max_block_size {
                return Err(CompressionError::TooLarge(self.max_block_size));
            }

            match status {
                Status::StreamEnd => {
                    return Err(CompressionError::Zlib("unexpected end of stream".into()))
                }
                Status::BufError if consumed < input.len() && out.len() == before_out => {
                    return Err(CompressionError::Zlib("no progress".into()))
                }
                _ => {}
            }

            if consumed == input.len() && out.len() < out.capacity() {
                break;
            }
        }

        trace!(compressed = input.len(), raw = out.len(), "decompressed header block");
        Ok(out)
    }
}
