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

//! Streams and the table that owns them
//!
//! Streams live in a slab and are addressed by their wire id through an ordered index, so a
//! cancelled or retired stream leaves nothing behind that could be reached by a stale handle.

use std::{collections::BTreeMap, collections::VecDeque, fmt::Debug, ops::Bound};

use slab::Slab;

use crate::{
    error::{Error, Result},
    flow::Window,
    parser::MAX_STREAM_ID,
    request::{ReplySink, Request},
};

/// Lifecycle of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Id allocated, SYN_STREAM not yet sent
    Idle,
    /// Both directions open
    Open,
    /// We sent FIN, the peer may still send
    HalfClosedLocal,
    /// The peer sent FIN, we may still send
    HalfClosedRemote,
    /// Both directions finished or the stream was reset
    Closed,
}

impl Phase {
    /// Phase after we send FIN
    pub fn on_send_fin(self) -> Phase {
        match self {
            Self::Idle | Self::Open => Self::HalfClosedLocal,
            Self::HalfClosedRemote | Self::HalfClosedLocal | Self::Closed => Self::Closed,
        }
    }

    /// Phase after the peer sends FIN
    pub fn on_recv_fin(self) -> Phase {
        match self {
            Self::Idle | Self::Open => Self::HalfClosedRemote,
            Self::HalfClosedLocal | Self::HalfClosedRemote | Self::Closed => Self::Closed,
        }
    }

    /// Whether the stream counts against the concurrency limit
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Open | Self::HalfClosedLocal | Self::HalfClosedRemote
        )
    }

    /// Whether we may still send on the stream
    pub fn can_send(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedRemote)
    }

    /// Whether the peer may still send on the stream
    pub fn can_recv(self) -> bool {
        matches!(self, Self::Open | Self::HalfClosedLocal)
    }
}

/// Refers to a stream opened through [`Session::open_stream`](crate::session::Session::open_stream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamHandle(pub(crate) u32);

impl StreamHandle {
    /// Wire id of the stream
    pub fn id(&self) -> u32 {
        self.0
    }
}

/// Body bytes waiting for send credit
#[derive(Debug)]
pub(crate) struct Chunk {
    pub(crate) data: Vec<u8>,
    pub(crate) offset: usize,
    pub(crate) fin: bool,
}

impl Chunk {
    pub(crate) fn remaining(&self) -> &[u8] {
        &self.data[self.offset..]
    }
}

/// State of one stream
pub struct Stream {
    id: u32,
    pub(crate) phase: Phase,
    priority: u8,
    pub(crate) sink: Box<dyn ReplySink>,
    pub(crate) send_window: Window,
    pub(crate) recv_window: Window,
    /// Bytes delivered to the sink and not yet returned to the peer as credit
    pub(crate) unacked: usize,
    pub(crate) pending: VecDeque<Chunk>,
    /// FIN has been queued, no further body may be added
    pub(crate) fin_queued: bool,
    pub(crate) replied: bool,
    /// Decompressed header bytes received on this stream
    pub(crate) header_bytes: usize,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl Stream {
    /// Creates the state for stream `id` carrying `request`.
    pub fn new(
        id: u32,
        request: &Request,
        phase: Phase,
        sink: Box<dyn ReplySink>,
        send_window: u32,
        recv_window: u32,
    ) -> Self {
        Self {
            id,
            phase,
            priority: request.priority,
            sink,
            send_window: Window::new(send_window),
            recv_window: Window::new(recv_window),
            unacked: 0,
            pending: VecDeque::new(),
            fin_queued: !request.has_body,
            replied: false,
            header_bytes: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Wire id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Priority the stream was opened with
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Send credit left on the stream
    pub fn send_window(&self) -> Window {
        self.send_window
    }

    /// Receive credit left on the stream
    pub fn recv_window(&self) -> Window {
        self.recv_window
    }

    /// Body bytes sent
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Body bytes received
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    /// Body bytes queued behind flow control
    pub fn pending_bytes(&self) -> usize {
        self.pending.iter().map(|c| c.remaining().len()).sum()
    }
}

impl Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("priority", &self.priority)
            .field("send_window", &self.send_window)
            .field("recv_window", &self.recv_window)
            .field("pending", &self.pending_bytes())
            .field("fin_queued", &self.fin_queued)
            .field("replied", &self.replied)
            .finish()
    }
}

/// Active streams of one connection, keyed by id
#[derive(Debug)]
pub struct StreamTable {
    streams: Slab<Stream>,
    index: BTreeMap<u32, usize>,
    next_stream_id: u32,
    max_concurrent: u32,
}

impl StreamTable {
    /// Empty table admitting up to `max_concurrent` active streams
    pub fn new(max_concurrent: u32) -> Self {
        Self {
            streams: Slab::default(),
            index: BTreeMap::new(),
            next_stream_id: 1,
            max_concurrent,
        }
    }

    /// Hands out the next odd stream id. Fails when the concurrency limit is reached or the id
    /// space is used up; neither failure consumes an id.
    pub fn allocate(&mut self) -> Result<u32> {
        if self.active_count() >= self.max_concurrent as usize {
            return Err(Error::ConcurrencyLimit(self.max_concurrent));
        }
        if self.next_stream_id > MAX_STREAM_ID {
            return Err(Error::StreamIdsExhausted);
        }

        let id = self.next_stream_id;
        self.next_stream_id += 2;
        Ok(id)
    }

    /// Stores a stream whose id came from [`StreamTable::allocate`].
    pub fn insert(&mut self, stream: Stream) {
        let id = stream.id();
        debug_assert!(id < self.next_stream_id && !self.index.contains_key(&id));
        let key = self.streams.insert(stream);
        self.index.insert(id, key);
    }

    /// Looks up a stream by id.
    pub fn get(&mut self, id: u32) -> Option<&mut Stream> {
        let key = *self.index.get(&id)?;
        self.streams.get_mut(key)
    }

    /// Looks up a stream by id without mutable access.
    pub fn peek(&self, id: u32) -> Option<&Stream> {
        let key = *self.index.get(&id)?;
        self.streams.get(key)
    }

    /// Removes a stream. Its id is never handed out again.
    pub fn retire(&mut self, id: u32) -> Option<Stream> {
        let key = self.index.remove(&id)?;
        self.streams.try_remove(key)
    }

    /// Whether `id` belonged to a client stream of this connection that has since been retired
    pub fn is_retired(&self, id: u32) -> bool {
        id % 2 == 1 && id < self.next_stream_id && !self.index.contains_key(&id)
    }

    /// Ids above `cutoff`, ascending
    pub fn ids_above(&self, cutoff: u32) -> Vec<u32> {
        self.index
            .range((Bound::Excluded(cutoff), Bound::Unbounded))
            .map(|(id, _)| *id)
            .collect()
    }

    /// All ids, ascending
    pub fn ids(&self) -> Vec<u32> {
        self.index.keys().copied().collect()
    }

    /// Streams counting against the concurrency limit
    pub fn active_count(&self) -> usize {
        self.streams.iter().filter(|(_, s)| s.phase.is_active()).count()
    }

    /// Number of streams in the table
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether the table holds no streams
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Current concurrency limit
    pub fn max_concurrent(&self) -> u32 {
        self.max_concurrent
    }

    /// Installs a concurrency limit from SETTINGS. Streams already open are not affected.
    pub fn set_max_concurrent(&mut self, max: u32) {
        self.max_concurrent = max;
    }

    /// Iterates over the streams in id order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        // Slab keys are not ordered by id; the index is.
        let mut streams: Vec<&mut Stream> = self.streams.iter_mut().map(|(_, s)| s).collect();
        streams.sort_by_key(|s| s.id);
        streams.into_iter()
    }
}
