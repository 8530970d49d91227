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

//! Session byte buffer

use std::ops::Deref;

/// A growable byte queue. Bytes are appended at the back and released from the front with
/// [`Buffer::mark_read`]; released space is reclaimed lazily.
///
/// The session keeps one for partially received frames and one for frames waiting to be written
/// to the transport.
#[derive(Debug)]
pub struct Buffer {
    inner: Vec<u8>,
    read_offset: usize,
    desired_capacity: usize,
}

impl Buffer {
    /// Creates an empty buffer that tries to stay near `desired_capacity` bytes.
    pub fn new(desired_capacity: usize) -> Self {
        let desired_capacity = desired_capacity.next_power_of_two();
        Self {
            inner: Vec::with_capacity(desired_capacity),
            read_offset: 0,
            desired_capacity,
        }
    }

    /// Number of unread bytes
    pub fn remaining(&self) -> usize {
        self.inner.len() - self.read_offset
    }

    /// Whether there is nothing left to read
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Appends `bytes` to the back of the buffer.
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.inner.extend_from_slice(bytes);
    }

    /// Gives direct access to the back of the buffer for in-place encoding.
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.inner
    }

    /// Mark a certain amount of bytes read from the buffer, freeing them for removal. If this is
    /// not called after reading from the buffer, the next read will receive the same data.
    pub fn mark_read(&mut self, amount: usize) {
        self.read_offset = self.inner.len().min(self.read_offset + amount);
        self.compact();
    }

    /// Drops all unread bytes.
    pub fn clear(&mut self) {
        self.inner.clear();
        self.read_offset = 0;
        if self.inner.capacity() > self.desired_capacity {
            self.inner.shrink_to(self.desired_capacity);
        }
    }

    /// Takes all unread bytes out of the buffer.
    pub fn take(&mut self) -> Vec<u8> {
        let out = self.inner.split_off(self.read_offset);
        self.clear();
        out
    }

    /// Utilize excess space at the beginning of the buffer.
    ///
    /// Only moves bytes once the consumed prefix is larger than the desired capacity.
    fn compact(&mut self) {
        // buffer is empty, reset to clean state
        if self.remaining() == 0 {
            self.clear();
            return;
        }

        if self.read_offset > self.desired_capacity {
            self.inner.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.inner[self.read_offset..]
    }
}
