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

//! The protocol engine
//!
//! A [`Session`] is driven by two kinds of events: bytes arriving from the peer
//! ([`Session::on_bytes_available`]) and calls from the application ([`Session::open_stream`],
//! [`Session::send_body`], [`Session::cancel`]). Both only ever append frames to an outbound
//! buffer; the caller moves those bytes to the transport. Nothing here blocks or performs IO.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use tracing::{debug, error, trace, warn};

use crate::{
    buffer::Buffer,
    compression::{HeaderDecoder, HeaderEncoder},
    error::{Error, Result, StreamErrorKind},
    flow::{FlowControl, DEFAULT_WINDOW, MAX_WINDOW},
    parser::{
        frame::{
            self, flags, Data, GoAway, Headers, Ping, RstStream, Setting, SettingId, Settings,
            SynReply, SynStream, WindowUpdate,
        },
        Frame, GoAwayStatus, Header, ParseError, RstStatus, MAX_FRAME_PAYLOAD,
    },
    request::{ReplySink, Request},
    stream::{Chunk, Phase, Stream, StreamHandle, StreamTable},
};

/// Session tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Receive window advertised for every stream
    pub initial_window_size: u32,
    /// Receive window for the connection as a whole
    pub connection_window_size: u32,
    /// Streams we may have open before the peer announces its own limit
    pub max_concurrent_streams: u32,
    /// Largest frame payload accepted from the peer
    pub max_frame_size: usize,
    /// Decompressed header bytes accepted per stream
    pub max_header_block_size: usize,
    /// Largest DATA payload we send
    pub max_data_chunk: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_window_size: DEFAULT_WINDOW,
            connection_window_size: DEFAULT_WINDOW,
            max_concurrent_streams: 100,
            max_frame_size: MAX_FRAME_PAYLOAD,
            max_header_block_size: 256 * 1024,
            max_data_chunk: 16 * 1024,
        }
    }
}

/// Client side of one SPDY/3.1 connection.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    encoder: HeaderEncoder,
    decoder: HeaderDecoder,
    streams: StreamTable,
    flow: FlowControl,
    inbound: Buffer,
    outbound: Buffer,
    /// Cutoff from the peer's GOAWAY
    peer_last_good: Option<u32>,
    /// We sent GOAWAY
    local_go_away: bool,
    /// A fatal error was reported or the transport closed
    closed: bool,
    last_peer_stream_id: u32,
    next_ping_id: u32,
    pings: VecDeque<(u32, Instant)>,
    last_rtt: Option<Duration>,
}

impl Session {
    /// Creates a session and queues its preface: SETTINGS with our initial window size, and a
    /// connection WINDOW_UPDATE when the configured connection window exceeds the default.
    pub fn new(mut config: SessionConfig) -> Result<Self> {
        config.initial_window_size = config.initial_window_size.clamp(1, MAX_WINDOW as u32);
        config.connection_window_size = config
            .connection_window_size
            .clamp(DEFAULT_WINDOW, MAX_WINDOW as u32);
        config.max_frame_size = config.max_frame_size.min(MAX_FRAME_PAYLOAD);
        config.max_data_chunk = config.max_data_chunk.clamp(1, MAX_FRAME_PAYLOAD);

        let mut session = Self {
            encoder: HeaderEncoder::new()?,
            decoder: HeaderDecoder::new(config.max_header_block_size),
            streams: StreamTable::new(config.max_concurrent_streams),
            flow: FlowControl::new(config.initial_window_size, config.connection_window_size),
            inbound: Buffer::new(16 * 1024),
            outbound: Buffer::new(16 * 1024),
            peer_last_good: None,
            local_go_away: false,
            closed: false,
            last_peer_stream_id: 0,
            next_ping_id: 1,
            pings: VecDeque::new(),
            last_rtt: None,
            config,
        };

        emit(
            &mut session.outbound,
            Frame::Settings(Settings {
                flags: 0,
                entries: vec![Setting::new(
                    SettingId::InitialWindowSize,
                    session.config.initial_window_size,
                )],
            }),
        );
        if let Some(delta) = session.flow.initial_connection_credit() {
            emit(
                &mut session.outbound,
                Frame::WindowUpdate(WindowUpdate { stream_id: 0, delta }),
            );
        }

        Ok(session)
    }

    /// Starts a request. The SYN_STREAM carries FIN unless the request announces a body.
    ///
    /// Fails without side effects when the session is closed or draining, when the concurrency
    /// limit is reached, or when stream ids are exhausted. The caller may retry the first two
    /// on another connection and the limit once a stream finishes.
    pub fn open_stream(
        &mut self,
        request: &Request,
        sink: Box<dyn ReplySink>,
    ) -> Result<StreamHandle> {
        self.ensure_open()?;
        if let Some(last_good_stream_id) = self.peer_last_good {
            return Err(Error::GoingAway {
                last_good_stream_id,
            });
        }
        if self.local_go_away {
            return Err(Error::GoingAway {
                last_good_stream_id: self.last_peer_stream_id,
            });
        }

        let id = self.streams.allocate()?;
        let header_block = match self.encoder.compress(&request.header_block()) {
            Ok(block) => block,
            Err(e) => return Err(self.fail(e.into(), GoAwayStatus::InternalError)),
        };

        let fin = !request.has_body;
        emit(
            &mut self.outbound,
            Frame::SynStream(SynStream {
                flags: if fin { flags::FIN } else { 0 },
                stream_id: id,
                associated_stream_id: 0,
                priority: request.priority,
                slot: 0,
                header_block,
            }),
        );

        let phase = if fin {
            Phase::Idle.on_send_fin()
        } else {
            Phase::Open
        };
        self.streams.insert(Stream::new(
            id,
            request,
            phase,
            sink,
            self.flow.stream_send_initial(),
            self.flow.stream_recv_initial(),
        ));
        debug!(stream = id, method = %request.method, path = request.path.as_str(), ?phase, "opened stream");

        Ok(StreamHandle(id))
    }

    /// Queues body bytes for a stream opened with a body. Bytes beyond the current send credit
    /// wait until the peer grants more; `is_last` ends the request once everything is sent.
    pub fn send_body(&mut self, handle: StreamHandle, bytes: &[u8], is_last: bool) -> Result<()> {
        self.ensure_open()?;
        let id = handle.id();
        let stream = self.streams.get(id).ok_or(Error::UnknownStream(id))?;
        if stream.fin_queued || !stream.phase.can_send() {
            return Err(Error::StreamClosed(id));
        }
        if bytes.is_empty() && !is_last {
            return Ok(());
        }

        stream.pending.push_back(Chunk {
            data: bytes.to_vec(),
            offset: 0,
            fin: is_last,
        });
        stream.fin_queued = is_last;
        self.flush_stream(id);
        Ok(())
    }

    /// Abandons a stream. Sends RST_STREAM(CANCEL) and drops everything buffered for it; the sink
    /// is not notified.
    pub fn cancel(&mut self, handle: StreamHandle) -> Result<()> {
        self.ensure_open()?;
        let id = handle.id();
        let stream = self.streams.retire(id).ok_or(Error::UnknownStream(id))?;
        debug!(stream = id, pending = stream.pending_bytes(), "cancelled stream");
        emit(
            &mut self.outbound,
            Frame::RstStream(RstStream {
                stream_id: id,
                status: RstStatus::Cancel,
            }),
        );
        Ok(())
    }

    /// Feeds bytes read from the transport and processes every complete frame.
    ///
    /// A connection-fatal error is returned exactly once; by then GOAWAY is queued and every
    /// stream has been failed. Later calls return [`Error::SessionClosed`].
    pub fn on_bytes_available(&mut self, bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.inbound.extend_from_slice(bytes);

        loop {
            let (frame, used) = match frame::parse(&self.inbound, self.config.max_frame_size) {
                Ok(parsed) => parsed,
                Err(ParseError::Incomplete) => break,
                Err(e) => return Err(self.fail(e.into(), GoAwayStatus::ProtocolError)),
            };
            self.inbound.mark_read(used);
            trace!(%frame, "received");

            if let Err(e) = self.dispatch(frame) {
                return Err(self.fail(e, GoAwayStatus::ProtocolError));
            }
        }

        Ok(())
    }

    /// Sends a PING and returns its id. The round trip is recorded when the reply arrives.
    pub fn ping(&mut self) -> Result<u32> {
        self.ensure_open()?;
        let id = self.next_ping_id;
        // odd ids stay odd across wrap-around
        self.next_ping_id = self.next_ping_id.wrapping_add(2);
        self.pings.push_back((id, Instant::now()));
        emit(&mut self.outbound, Frame::Ping(Ping { id }));
        Ok(id)
    }

    /// Announces shutdown with GOAWAY(OK). Streams already open run to completion; new ones are
    /// refused.
    pub fn go_away(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.local_go_away {
            return Ok(());
        }
        self.local_go_away = true;
        debug!(last_good = self.last_peer_stream_id, "going away");
        emit(
            &mut self.outbound,
            Frame::GoAway(GoAway {
                last_good_stream_id: self.last_peer_stream_id,
                status: GoAwayStatus::Ok,
            }),
        );
        Ok(())
    }

    /// The transport reached end of file or failed. Every stream in flight fails with
    /// [`StreamErrorKind::ConnectionFailed`].
    pub fn on_transport_closed(&mut self) {
        if self.closed {
            return;
        }
        debug!(streams = self.streams.len(), "transport closed");
        self.closed = true;
        self.inbound.clear();
        self.fail_all(StreamErrorKind::ConnectionFailed);
    }

    /// Bytes waiting to be written to the transport
    pub fn pending_output(&self) -> &[u8] {
        &self.outbound
    }

    /// Marks `n` bytes of [`Session::pending_output`] as written.
    pub fn consume_output(&mut self, n: usize) {
        self.outbound.mark_read(n);
    }

    /// Takes all pending output.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.outbound.take()
    }

    /// Whether there is output waiting
    pub fn wants_write(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// No streams remain and all output has been handed off
    pub fn is_idle(&self) -> bool {
        self.streams.is_empty() && self.outbound.is_empty()
    }

    /// Whether the session failed or its transport closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Whether either side sent GOAWAY
    pub fn is_draining(&self) -> bool {
        self.peer_last_good.is_some() || self.local_go_away
    }

    /// Cutoff announced by the peer's GOAWAY
    pub fn peer_last_good_stream_id(&self) -> Option<u32> {
        self.peer_last_good
    }

    /// Streams currently open or half-closed
    pub fn active_streams(&self) -> usize {
        self.streams.active_count()
    }

    /// State of a stream still in the table: its windows, priority and byte counts
    pub fn stream(&self, handle: StreamHandle) -> Option<&Stream> {
        self.streams.peek(handle.id())
    }

    /// Phase of a stream, `None` once it has been retired
    pub fn stream_phase(&self, handle: StreamHandle) -> Option<Phase> {
        self.streams.peek(handle.id()).map(Stream::phase)
    }

    /// Body bytes the stream could send right now
    pub fn send_capacity(&self, handle: StreamHandle) -> Option<usize> {
        self.streams
            .peek(handle.id())
            .map(|stream| self.flow.sendable(stream))
    }

    /// Body bytes queued on a stream waiting for credit
    pub fn queued_body(&self, handle: StreamHandle) -> Option<usize> {
        self.streams.peek(handle.id()).map(Stream::pending_bytes)
    }

    /// Current limit on concurrent streams
    pub fn max_concurrent_streams(&self) -> u32 {
        self.streams.max_concurrent()
    }

    /// Send window new streams start with
    pub fn initial_send_window(&self) -> u32 {
        self.flow.stream_send_initial()
    }

    /// Connection-level send credit
    pub fn connection_send_window(&self) -> i64 {
        self.flow.connection_send().available()
    }

    /// Round trip of the most recently answered PING
    pub fn last_ping_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    /// Effective configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    /// Tears the session down after a connection-fatal error and hands the error back.
    fn fail(&mut self, error: Error, status: GoAwayStatus) -> Error {
        error!(%error, %status, "session failed");
        emit(
            &mut self.outbound,
            Frame::GoAway(GoAway {
                last_good_stream_id: self.last_peer_stream_id,
                status,
            }),
        );
        self.closed = true;
        self.inbound.clear();
        self.fail_all(StreamErrorKind::ConnectionFailed);
        error
    }

    fn fail_all(&mut self, kind: StreamErrorKind) {
        for id in self.streams.ids() {
            if let Some(stream) = self.streams.retire(id) {
                notify_error(stream, kind);
            }
        }
    }

    fn dispatch(&mut self, frame: Frame) -> Result<()> {
        if frame.stream_id() == Some(0)
            && matches!(frame, Frame::SynReply(_) | Frame::Headers(_) | Frame::Data(_))
        {
            return Err(Error::Protocol("stream frame on stream 0"));
        }

        match frame {
            Frame::SynStream(f) => self.on_syn_stream(f),
            Frame::SynReply(f) => self.on_syn_reply(f),
            Frame::RstStream(f) => {
                self.on_rst_stream(f);
                Ok(())
            }
            Frame::Settings(f) => self.on_settings(f),
            Frame::Ping(f) => {
                self.on_ping(f);
                Ok(())
            }
            Frame::GoAway(f) => {
                self.on_go_away(f);
                Ok(())
            }
            Frame::Headers(f) => self.on_headers(f),
            Frame::WindowUpdate(f) => self.on_window_update(f),
            Frame::Data(f) => self.on_data(f),
        }
    }

    /// Server push is not supported. The block is still inflated to keep the decoder in step.
    fn on_syn_stream(&mut self, frame: SynStream) -> Result<()> {
        let id = frame.stream_id;
        if id == 0 || id % 2 == 1 {
            return Err(Error::Protocol("SYN_STREAM with a stream id reserved for the client"));
        }
        if id <= self.last_peer_stream_id {
            return Err(Error::Protocol("SYN_STREAM with a decreasing stream id"));
        }
        self.decoder.decompress(&frame.header_block)?;
        self.last_peer_stream_id = id;

        debug!(
            stream = id,
            associated = frame.associated_stream_id,
            "refusing pushed stream"
        );
        emit(
            &mut self.outbound,
            Frame::RstStream(RstStream {
                stream_id: id,
                status: RstStatus::RefusedStream,
            }),
        );
        Ok(())
    }

    fn on_syn_reply(&mut self, frame: SynReply) -> Result<()> {
        let id = frame.stream_id;
        let headers = self.decoder.decompress(&frame.header_block)?;

        let Some(stream) = self.streams.get(id) else {
            self.unknown_stream(id);
            return Ok(());
        };
        if !stream.phase.can_recv() {
            self.reset(id, RstStatus::StreamAlreadyClosed);
        } else if stream.replied {
            self.reset(id, RstStatus::StreamInUse);
        } else {
            stream.replied = true;
            debug!(stream = id, fin = frame.flags & flags::FIN != 0, "stream replied");
            self.deliver_headers(id, &headers, frame.flags & flags::FIN != 0);
        }
        Ok(())
    }

    fn on_headers(&mut self, frame: Headers) -> Result<()> {
        let id = frame.stream_id;
        let headers = self.decoder.decompress(&frame.header_block)?;

        let Some(stream) = self.streams.get(id) else {
            self.unknown_stream(id);
            return Ok(());
        };
        if !stream.phase.can_recv() {
            self.reset(id, RstStatus::StreamAlreadyClosed);
        } else if !stream.replied {
            self.reset(id, RstStatus::ProtocolError);
        } else {
            self.deliver_headers(id, &headers, frame.flags & flags::FIN != 0);
        }
        Ok(())
    }

    fn deliver_headers(&mut self, id: u32, headers: &[Header], fin: bool) {
        let Some(stream) = self.streams.get(id) else {
            return;
        };

        stream.header_bytes += block_len(headers);
        if stream.header_bytes > self.config.max_header_block_size {
            self.reset(id, RstStatus::FrameTooLarge);
            return;
        }

        stream.sink.on_headers(headers);
        if fin {
            self.finish_remote(id);
        }
    }

    fn on_data(&mut self, frame: Data) -> Result<()> {
        if self.flow.charge_connection(frame.payload.len()).is_err() {
            return Err(Error::Protocol("peer exceeded the connection receive window"));
        }

        self.deliver_data(frame);

        // Bytes on reset or unknown streams still count against the connection window.
        if let Some(delta) = self.flow.release_connection() {
            emit(
                &mut self.outbound,
                Frame::WindowUpdate(WindowUpdate { stream_id: 0, delta }),
            );
        }
        Ok(())
    }

    fn deliver_data(&mut self, frame: Data) {
        let id = frame.stream_id;
        let len = frame.payload.len();
        let fin = frame.flags & flags::FIN != 0;

        let Some(stream) = self.streams.get(id) else {
            self.unknown_stream(id);
            return;
        };
        if !stream.phase.can_recv() {
            return self.reset(id, RstStatus::StreamAlreadyClosed);
        }
        if !stream.replied || frame.flags & flags::COMPRESS != 0 {
            return self.reset(id, RstStatus::ProtocolError);
        }
        if self.flow.charge(stream, len).is_err() {
            return self.reset(id, RstStatus::FlowControlError);
        }

        stream.bytes_received += len as u64;
        if len > 0 {
            stream.sink.on_body_chunk(&frame.payload);
        }

        if fin {
            self.finish_remote(id);
        } else if let Some(delta) = self.flow.release(stream, len) {
            emit(
                &mut self.outbound,
                Frame::WindowUpdate(WindowUpdate {
                    stream_id: id,
                    delta,
                }),
            );
        }
    }

    fn on_rst_stream(&mut self, frame: RstStream) {
        match self.streams.retire(frame.stream_id) {
            Some(stream) => {
                debug!(stream = frame.stream_id, status = %frame.status, "stream reset by peer");
                notify_error(stream, StreamErrorKind::Reset(frame.status));
            }
            None => trace!(stream = frame.stream_id, "reset for unknown stream"),
        }
    }

    fn on_settings(&mut self, frame: Settings) -> Result<()> {
        if frame.flags & flags::CLEAR_SETTINGS != 0 {
            debug!("peer cleared persisted settings");
        }

        let mut grew = false;
        for Setting {
            flags: entry_flags,
            id,
            value,
        } in frame.entries
        {
            match SettingId::try_from(id) {
                Ok(SettingId::MaxConcurrentStreams) => {
                    debug!(value, "max concurrent streams");
                    self.streams.set_max_concurrent(value);
                }
                Ok(SettingId::InitialWindowSize) => {
                    if value as i64 > MAX_WINDOW {
                        return Err(Error::Protocol("initial window size above 2^31-1"));
                    }
                    let delta = self.flow.set_stream_send_initial(value);
                    debug!(value, delta, "initial window size");
                    self.shift_send_windows(delta);
                    grew |= delta > 0;
                }
                Ok(other) => trace!(setting = ?other, value, entry_flags, "ignoring setting"),
                Err(id) => debug!(id, value, "ignoring unknown setting"),
            }
        }

        if grew {
            self.flush_all();
        }
        Ok(())
    }

    fn shift_send_windows(&mut self, delta: i64) {
        let mut overflowed = Vec::new();
        for stream in self.streams.iter_mut() {
            if stream.send_window.adjust(delta).is_err() {
                overflowed.push(stream.id());
            }
        }
        for id in overflowed {
            self.reset(id, RstStatus::FlowControlError);
        }
    }

    fn on_ping(&mut self, frame: Ping) {
        if frame.id % 2 == 0 {
            trace!(id = frame.id, "echoing ping");
            emit(&mut self.outbound, Frame::Ping(frame));
            return;
        }

        match self.pings.iter().position(|(id, _)| *id == frame.id) {
            Some(pos) => {
                if let Some((_, sent)) = self.pings.remove(pos) {
                    let rtt = sent.elapsed();
                    debug!(id = frame.id, ?rtt, "ping answered");
                    self.last_rtt = Some(rtt);
                }
            }
            None => debug!(id = frame.id, "unsolicited ping reply"),
        }
    }

    fn on_go_away(&mut self, frame: GoAway) {
        let cutoff = frame.last_good_stream_id;
        debug!(last_good = cutoff, status = %frame.status, "peer is going away");
        self.peer_last_good = Some(self.peer_last_good.map_or(cutoff, |prev| prev.min(cutoff)));

        for id in self.streams.ids_above(cutoff) {
            if let Some(stream) = self.streams.retire(id) {
                debug!(stream = id, "stream not accepted by peer");
                notify_error(stream, StreamErrorKind::NotAcceptedByPeer);
            }
        }
    }

    fn on_window_update(&mut self, frame: WindowUpdate) -> Result<()> {
        let id = frame.stream_id;
        if id == 0 {
            if self.flow.credit(None, frame.delta).is_err() {
                return Err(Error::Protocol("connection send window overflow"));
            }
            self.flush_all();
            return Ok(());
        }

        let Some(stream) = self.streams.get(id) else {
            self.unknown_stream(id);
            return Ok(());
        };
        if self.flow.credit(Some(stream), frame.delta).is_err() {
            self.reset(id, RstStatus::FlowControlError);
        } else {
            self.flush_stream(id);
        }
        Ok(())
    }

    /// The peer sent FIN on `id`.
    fn finish_remote(&mut self, id: u32) {
        let Some(stream) = self.streams.get(id) else {
            return;
        };
        stream.phase = stream.phase.on_recv_fin();
        stream.sink.on_complete();
        debug!(
            stream = id,
            phase = ?stream.phase,
            received = stream.bytes_received,
            "peer finished stream"
        );

        if stream.phase == Phase::Closed {
            self.streams.retire(id);
        }
    }

    /// Resets a stream because of a peer violation.
    fn reset(&mut self, id: u32, status: RstStatus) {
        warn!(stream = id, %status, "resetting stream");
        emit(
            &mut self.outbound,
            Frame::RstStream(RstStream {
                stream_id: id,
                status,
            }),
        );
        if let Some(stream) = self.streams.retire(id) {
            notify_error(stream, StreamErrorKind::Protocol(status));
        }
    }

    /// A frame named a stream not in the table. Frames racing a reset or a refused push are
    /// dropped; anything else was never opened.
    fn unknown_stream(&mut self, id: u32) {
        let refused_push = id % 2 == 0 && id != 0 && id <= self.last_peer_stream_id;
        if self.streams.is_retired(id) || refused_push {
            trace!(stream = id, "dropping frame for closed stream");
            return;
        }
        self.reset(id, RstStatus::InvalidStream);
    }

    fn flush_all(&mut self) {
        for id in self.streams.ids() {
            self.flush_stream(id);
        }
    }

    /// Sends as much queued body as the windows allow.
    fn flush_stream(&mut self, id: u32) {
        let max_chunk = self.config.max_data_chunk;
        let Some(stream) = self.streams.get(id) else {
            return;
        };

        let mut closed = false;
        loop {
            let Some(chunk) = stream.pending.front() else {
                break;
            };
            let remaining = chunk.remaining().len();
            let chunk_fin = chunk.fin;
            let n = self.flow.sendable(stream).min(remaining).min(max_chunk);
            // An empty FIN needs no credit.
            if n == 0 && !(remaining == 0 && chunk_fin) {
                break;
            }
            if self.flow.consume(stream, n).is_err() {
                break;
            }

            let Some(chunk) = stream.pending.front_mut() else {
                break;
            };
            let payload = chunk.remaining()[..n].to_vec();
            chunk.offset += n;
            let drained = chunk.remaining().is_empty();
            if drained {
                stream.pending.pop_front();
            }
            let fin = chunk_fin && drained;

            stream.bytes_sent += n as u64;
            emit(
                &mut self.outbound,
                Frame::Data(Data {
                    flags: if fin { flags::FIN } else { 0 },
                    stream_id: id,
                    payload,
                }),
            );

            if fin {
                stream.phase = stream.phase.on_send_fin();
                debug!(stream = id, phase = ?stream.phase, sent = stream.bytes_sent, "request body finished");
                closed = stream.phase == Phase::Closed;
                break;
            }
        }

        if closed {
            self.streams.retire(id);
        }
    }
}

fn emit(outbound: &mut Buffer, frame: Frame) {
    trace!(%frame, "sending");
    frame.encode(outbound.as_mut_vec());
}

/// Reports a stream failure, unless the peer already completed the reply.
fn notify_error(mut stream: Stream, kind: StreamErrorKind) {
    if stream.phase != Phase::HalfClosedRemote {
        stream.sink.on_error(kind);
    }
}

/// Size of the uncompressed name/value block carrying `headers`
fn block_len(headers: &[Header]) -> usize {
    4 + headers
        .iter()
        .map(|h| 8 + h.name.len() + h.value.len())
        .sum::<usize>()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::request::{Reply, SharedReply};

    /// Minimal server side: its own compression contexts, frames in and out.
    struct Peer {
        encoder: HeaderEncoder,
        decoder: HeaderDecoder,
    }

    impl Peer {
        fn new() -> Self {
            Self {
                encoder: HeaderEncoder::new().unwrap(),
                decoder: HeaderDecoder::new(1 << 20),
            }
        }

        /// Reads everything the session queued, inflating SYN_STREAM blocks in order.
        fn read(&mut self, session: &mut Session) -> Vec<Frame> {
            let bytes = session.take_output();
            let mut frames = Vec::new();
            let mut pos = 0;
            while pos < bytes.len() {
                let (frame, used) = Frame::parse(&bytes[pos..]).unwrap();
                if let Frame::SynStream(f) = &frame {
                    self.decoder.decompress(&f.header_block).unwrap();
                }
                frames.push(frame);
                pos += used;
            }
            frames
        }

        fn syn_reply(&mut self, id: u32, fin: bool) -> Vec<u8> {
            let block = self
                .encoder
                .compress(&[
                    Header::new(":status", "200 OK"),
                    Header::new(":version", "HTTP/1.1"),
                ])
                .unwrap();
            Frame::SynReply(SynReply {
                flags: if fin { flags::FIN } else { 0 },
                stream_id: id,
                header_block: block,
            })
            .serialize()
        }
    }

    fn data(id: u32, payload: &[u8], fin: bool) -> Vec<u8> {
        Frame::Data(Data {
            flags: if fin { flags::FIN } else { 0 },
            stream_id: id,
            payload: payload.to_vec(),
        })
        .serialize()
    }

    fn open(session: &mut Session, request: &Request) -> (StreamHandle, SharedReply) {
        let reply = Reply::shared();
        let handle = session
            .open_stream(request, Box::new(reply.clone()))
            .unwrap();
        (handle, reply)
    }

    #[test]
    fn new_session_queues_settings_preface() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let frames = peer.read(&mut session);
        assert_eq!(
            vec![Frame::Settings(Settings {
                flags: 0,
                entries: vec![Setting::new(SettingId::InitialWindowSize, DEFAULT_WINDOW)],
            })],
            frames
        );
    }

    #[test]
    fn new_session_grants_extra_connection_window() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig {
            connection_window_size: 1 << 20,
            ..Default::default()
        })
        .unwrap();
        let frames = peer.read(&mut session);
        assert_eq!(
            Frame::WindowUpdate(WindowUpdate {
                stream_id: 0,
                delta: (1 << 20) - DEFAULT_WINDOW,
            }),
            frames[1]
        );
    }

    #[test]
    fn get_sends_syn_stream_with_fin() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        peer.read(&mut session);

        let (handle, _) = open(&mut session, &Request::get("example.org", "/").priority(1));
        assert_eq!(Some(Phase::HalfClosedLocal), session.stream_phase(handle));

        let frames = peer.read(&mut session);
        match &frames[..] {
            [Frame::SynStream(f)] => {
                assert_eq!(1, f.stream_id);
                assert_eq!(flags::FIN, f.flags);
                assert_eq!(1, f.priority);
            }
            other => panic!("unexpected frames {:?}", other),
        }
    }

    #[test]
    fn syn_reply_with_fin_retires_stream() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let (handle, reply) = open(&mut session, &Request::get("example.org", "/"));
        peer.read(&mut session);

        session.on_bytes_available(&peer.syn_reply(1, true)).unwrap();

        assert_eq!(None, session.stream_phase(handle));
        assert_eq!(0, session.active_streams());
        let reply = reply.borrow();
        assert!(reply.complete);
        assert_eq!(Some(200), reply.status());
        assert!(session.is_idle());
    }

    #[test]
    fn body_is_delivered_and_window_replenished() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig {
            initial_window_size: 1000,
            ..Default::default()
        })
        .unwrap();
        let (_, reply) = open(&mut session, &Request::get("example.org", "/"));
        peer.read(&mut session);

        session.on_bytes_available(&peer.syn_reply(1, false)).unwrap();
        session.on_bytes_available(&data(1, &[7; 400], false)).unwrap();
        assert!(peer.read(&mut session).is_empty());

        session.on_bytes_available(&data(1, &[7; 200], false)).unwrap();
        assert_eq!(
            vec![Frame::WindowUpdate(WindowUpdate {
                stream_id: 1,
                delta: 600
            })],
            peer.read(&mut session)
        );

        session.on_bytes_available(&data(1, b"", true)).unwrap();
        let reply = reply.borrow();
        assert_eq!(600, reply.body.len());
        assert!(reply.complete);
    }

    #[test]
    fn data_beyond_stream_window_is_flow_control_error() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig {
            initial_window_size: 100,
            ..Default::default()
        })
        .unwrap();
        let (_, reply) = open(&mut session, &Request::get("example.org", "/"));
        peer.read(&mut session);

        session.on_bytes_available(&peer.syn_reply(1, false)).unwrap();
        session.on_bytes_available(&data(1, &[0; 101], false)).unwrap();

        assert_eq!(
            vec![Frame::RstStream(RstStream {
                stream_id: 1,
                status: RstStatus::FlowControlError
            })],
            peer.read(&mut session)
        );
        assert_eq!(
            Some(StreamErrorKind::Protocol(RstStatus::FlowControlError)),
            reply.borrow().error
        );
    }

    #[test]
    fn data_before_reply_is_protocol_error() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let (_, reply) = open(&mut session, &Request::get("example.org", "/"));
        peer.read(&mut session);

        session.on_bytes_available(&data(1, b"early", false)).unwrap();
        assert_eq!(
            Some(StreamErrorKind::Protocol(RstStatus::ProtocolError)),
            reply.borrow().error
        );
        // a late frame for the reset stream is dropped
        session.on_bytes_available(&data(1, b"late", true)).unwrap();
        let frames = peer.read(&mut session);
        assert_eq!(1, frames.len());
    }

    #[test]
    fn second_syn_reply_is_stream_in_use() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let (_, reply) = open(&mut session, &Request::get("example.org", "/"));
        peer.read(&mut session);

        session.on_bytes_available(&peer.syn_reply(1, false)).unwrap();
        session.on_bytes_available(&peer.syn_reply(1, false)).unwrap();
        assert_eq!(
            Some(StreamErrorKind::Protocol(RstStatus::StreamInUse)),
            reply.borrow().error
        );
    }

    #[test]
    fn body_waits_for_credit() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        peer.read(&mut session);
        session
            .on_bytes_available(
                &Frame::Settings(Settings {
                    flags: 0,
                    entries: vec![Setting::new(SettingId::InitialWindowSize, 10)],
                })
                .serialize(),
            )
            .unwrap();

        let (handle, _) = open(&mut session, &Request::post("example.org", "/upload"));
        assert_eq!(Some(Phase::Open), session.stream_phase(handle));
        session.send_body(handle, &[1; 25], true).unwrap();

        let frames = peer.read(&mut session);
        assert_eq!(2, frames.len());
        assert_eq!(data(1, &[1; 10], false), frames[1].serialize());
        assert_eq!(Some(15), session.queued_body(handle));
        assert_eq!(Some(0), session.send_capacity(handle));

        session
            .on_bytes_available(
                &Frame::WindowUpdate(WindowUpdate {
                    stream_id: 1,
                    delta: 100,
                })
                .serialize(),
            )
            .unwrap();
        let frames = peer.read(&mut session);
        assert_eq!(1, frames.len());
        assert_eq!(data(1, &[1; 15], true), frames[0].serialize());
        assert_eq!(Some(Phase::HalfClosedLocal), session.stream_phase(handle));
        assert!(matches!(
            session.send_body(handle, b"more", false),
            Err(Error::StreamClosed(1))
        ));
    }

    #[test]
    fn settings_shift_existing_send_windows() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let (handle, _) = open(&mut session, &Request::post("example.org", "/"));
        peer.read(&mut session);

        session
            .on_bytes_available(
                &Frame::Settings(Settings {
                    flags: 0,
                    entries: vec![
                        Setting::new(SettingId::InitialWindowSize, DEFAULT_WINDOW - 1000),
                        Setting::new(SettingId::MaxConcurrentStreams, 1),
                    ],
                })
                .serialize(),
            )
            .unwrap();

        assert_eq!(DEFAULT_WINDOW - 1000, session.initial_send_window());
        assert_eq!(
            Some(DEFAULT_WINDOW as usize - 1000),
            session.send_capacity(handle)
        );
        assert_eq!(1, session.max_concurrent_streams());
        assert!(matches!(
            session.open_stream(&Request::get("example.org", "/"), Box::new(Reply::shared())),
            Err(Error::ConcurrencyLimit(1))
        ));
    }

    #[test]
    fn cancel_sends_reset_without_notifying() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let (handle, reply) = open(&mut session, &Request::get("example.org", "/"));
        peer.read(&mut session);

        session.cancel(handle).unwrap();
        assert_eq!(
            vec![Frame::RstStream(RstStream {
                stream_id: 1,
                status: RstStatus::Cancel
            })],
            peer.read(&mut session)
        );
        assert_eq!(Reply::default(), *reply.borrow());
        assert!(matches!(session.cancel(handle), Err(Error::UnknownStream(1))));

        // the reply raced the reset
        session.on_bytes_available(&peer.syn_reply(1, true)).unwrap();
        assert!(peer.read(&mut session).is_empty());
    }

    #[test]
    fn peer_ping_is_echoed_and_client_ping_answered() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        peer.read(&mut session);

        session
            .on_bytes_available(&Frame::Ping(Ping { id: 2 }).serialize())
            .unwrap();
        assert_eq!(vec![Frame::Ping(Ping { id: 2 })], peer.read(&mut session));

        let id = session.ping().unwrap();
        assert_eq!(1, id);
        assert_eq!(3, session.ping().unwrap());
        peer.read(&mut session);
        session
            .on_bytes_available(&Frame::Ping(Ping { id }).serialize())
            .unwrap();
        assert!(session.last_ping_rtt().is_some());
        assert!(peer.read(&mut session).is_empty());
    }

    #[test]
    fn local_go_away_refuses_new_streams() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let (handle, _) = open(&mut session, &Request::get("example.org", "/"));
        peer.read(&mut session);

        session.go_away().unwrap();
        assert_eq!(
            vec![Frame::GoAway(GoAway {
                last_good_stream_id: 0,
                status: GoAwayStatus::Ok
            })],
            peer.read(&mut session)
        );
        assert!(session.is_draining());
        assert!(matches!(
            session.open_stream(&Request::get("example.org", "/"), Box::new(Reply::shared())),
            Err(Error::GoingAway { .. })
        ));
        assert_eq!(Some(Phase::HalfClosedLocal), session.stream_phase(handle));
    }

    #[test]
    fn push_is_refused() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig::default()).unwrap();
        peer.read(&mut session);

        let block = peer
            .encoder
            .compress(&[Header::new(":path", "/style.css")])
            .unwrap();
        let push = Frame::SynStream(SynStream {
            flags: flags::UNIDIRECTIONAL,
            stream_id: 2,
            associated_stream_id: 1,
            priority: 0,
            slot: 0,
            header_block: block,
        });
        session.on_bytes_available(&push.serialize()).unwrap();
        assert_eq!(
            vec![Frame::RstStream(RstStream {
                stream_id: 2,
                status: RstStatus::RefusedStream
            })],
            peer.read(&mut session)
        );

        // data for the refused push is dropped, and the decoder is still in step
        session.on_bytes_available(&data(2, b"body{}", true)).unwrap();
        let (_, reply) = open(&mut session, &Request::get("example.org", "/"));
        peer.read(&mut session);
        session.on_bytes_available(&peer.syn_reply(1, true)).unwrap();
        assert!(reply.borrow().complete);
    }

    #[test]
    fn invalid_frame_is_fatal_once() {
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let (_, reply) = open(&mut session, &Request::get("example.org", "/"));
        session.take_output();

        let bogus = [0x80, 0x03, 0x00, 0x05, 0x00, 0x00, 0x00, 0x00];
        assert!(matches!(
            session.on_bytes_available(&bogus),
            Err(Error::Framing(ParseError::InvalidType(5)))
        ));
        assert!(session.is_closed());
        assert_eq!(
            Some(StreamErrorKind::ConnectionFailed),
            reply.borrow().error
        );

        let frames = Peer::new().read(&mut session);
        assert_eq!(
            vec![Frame::GoAway(GoAway {
                last_good_stream_id: 0,
                status: GoAwayStatus::ProtocolError
            })],
            frames
        );
        assert!(matches!(
            session.on_bytes_available(&[]),
            Err(Error::SessionClosed)
        ));
    }

    #[test]
    fn oversized_frame_rejected_from_header_alone() {
        let mut session = Session::new(SessionConfig {
            max_frame_size: 1024,
            ..Default::default()
        })
        .unwrap();
        let header = [0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x04, 0x01];
        assert!(matches!(
            session.on_bytes_available(&header),
            Err(Error::Framing(ParseError::FrameTooLarge { .. }))
        ));
    }

    #[test]
    fn header_bytes_are_capped_per_stream() {
        let mut peer = Peer::new();
        let mut session = Session::new(SessionConfig {
            max_header_block_size: 256,
            ..Default::default()
        })
        .unwrap();
        let (_, reply) = open(&mut session, &Request::get("example.org", "/"));
        peer.read(&mut session);

        session.on_bytes_available(&peer.syn_reply(1, false)).unwrap();
        for _ in 0..4 {
            let block = peer
                .encoder
                .compress(&[Header::new("x-padding", "p".repeat(40))])
                .unwrap();
            let headers = Frame::Headers(Headers {
                flags: 0,
                stream_id: 1,
                header_block: block,
            });
            session.on_bytes_available(&headers.serialize()).unwrap();
        }

        assert_eq!(
            Some(StreamErrorKind::Protocol(RstStatus::FrameTooLarge)),
            reply.borrow().error
        );
        assert!(!session.is_closed());
    }

    #[test]
    fn transport_close_fails_streams() {
        let mut session = Session::new(SessionConfig::default()).unwrap();
        let (_, reply) = open(&mut session, &Request::get("example.org", "/"));
        session.on_transport_closed();
        assert_eq!(
            Some(StreamErrorKind::ConnectionFailed),
            reply.borrow().error
        );
        assert!(matches!(session.ping(), Err(Error::SessionClosed)));
    }
}
