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

//! Big-endian cursor over a frame payload

use super::{ParseError, ParseResult};

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// Reads network-order integers and byte runs out of a borrowed slice. Every read is bounds
/// checked and reports [`ParseError::Malformed`] with the name of the field being read.
#[derive(Debug, Clone)]
pub struct RawFrame<'a> {
    inner: &'a [u8],
    pos: usize,
}

impl<'a> RawFrame<'a> {
    /// Wraps `slice`, positioned at its first byte.
    pub fn new(slice: &'a [u8]) -> Self {
        RawFrame {
            inner: slice,
            pos: 0,
        }
    }

    /// Number of bytes consumed so far
    #[inline]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Number of bytes not yet consumed
    #[inline]
    pub fn remaining(&self) -> usize {
        self.inner.len() - self.pos
    }

    /// Whether every byte has been consumed
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pos == self.inner.len()
    }

    /// Consumes exactly `n` bytes.
    #[inline]
    pub fn take(&mut self, n: usize, field: &'static str) -> ParseResult<&'a [u8]> {
        if n > self.remaining() {
            return Err(ParseError::Malformed(field));
        }

        let head = &self.inner[self.pos..self.pos + n];
        self.pos += n;
        Ok(head)
    }

    /// Consumes everything that is left.
    #[inline]
    pub fn rest(&mut self) -> &'a [u8] {
        let tail = &self.inner[self.pos..];
        self.pos = self.inner.len();
        tail
    }

    /// Reads one byte.
    #[inline]
    pub fn read_u8(&mut self, field: &'static str) -> ParseResult<u8> {
        Ok(self.take(1, field)?[0])
    }

    /// Reads a 24-bit big-endian integer.
    #[inline]
    pub fn read_u24(&mut self, field: &'static str) -> ParseResult<u32> {
        let b = self.take(3, field)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    /// Reads a 32-bit big-endian integer.
    #[inline]
    pub fn read_u32(&mut self, field: &'static str) -> ParseResult<u32> {
        let b = self.take(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a 32-bit word and drops its reserved high bit.
    #[inline]
    pub fn read_u31(&mut self, field: &'static str) -> ParseResult<u32> {
        Ok(self.read_u32(field)? & STREAM_ID_MASK)
    }
}

#[cfg(test)]
mod test {
    use super::RawFrame;
    use crate::parser::ParseError;

    #[test]
    fn raw_frame_constructs_with_remaining_and_pos() {
        let raw = RawFrame::new(&[0, 0, 0, 1, 2]);
        assert_eq!(0, raw.pos());
        assert_eq!(5, raw.remaining());
        assert!(!raw.is_empty());
    }

    #[test]
    fn raw_frame_reads_big_endian() {
        let mut raw = RawFrame::new(&[0x12, 0x34, 0x56, 0x78, 0xab, 0xcd, 0xef]);
        assert_eq!(Ok(0x1234_5678), raw.read_u32("word"));
        assert_eq!(Ok(0x00ab_cdef), raw.read_u24("length"));
        assert!(raw.is_empty());
    }

    #[test]
    fn raw_frame_read_u31_masks_reserved_bit() {
        let mut raw = RawFrame::new(&[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(Ok(0x7fff_ffff), raw.read_u31("stream id"));
    }

    #[test]
    fn raw_frame_take_fails_without_consuming_when_short() {
        let mut raw = RawFrame::new(b"abc");
        assert_eq!(Err(ParseError::Malformed("name")), raw.take(4, "name"));
        assert_eq!(0, raw.pos());
        assert_eq!(Ok(b"ab" as &[u8]), raw.take(2, "name"));
        assert_eq!(b"c", raw.rest());
        assert!(raw.is_empty());
    }
}
