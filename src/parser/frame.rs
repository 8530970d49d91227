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

//! SPDY/3.1 frames
//!
//! Every frame starts with an 8 byte header. The high bit of the first word tells control frames
//! from data frames.
//!
//! ```text
//! Control frame                          Data frame
//! +----------------------------------+   +----------------------------------+
//! |C| Version(15bits) | Type(16bits) |   |C|       Stream-ID (31bits)       |
//! +----------------------------------+   +----------------------------------+
//! | Flags (8)  |  Length (24 bits)   |   | Flags (8)  |  Length (24 bits)   |
//! +----------------------------------+   +----------------------------------+
//! |               Data               |   |               Data               |
//! +----------------------------------+   +----------------------------------+
//! ```

use std::fmt::Display;

use super::{raw_frame::RawFrame, GoAwayStatus, ParseError, ParseResult, RstStatus};

/// Protocol version written into every control frame
pub const SPDY_VERSION: u16 = 3;
/// Size of the common frame header
pub const FRAME_HEADER_LEN: usize = 8;
/// Largest payload the 24-bit length field can describe
pub const MAX_FRAME_PAYLOAD: usize = 0x00ff_ffff;
/// Largest stream identifier
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

const CONTROL_BIT: u8 = 0x80;

/// Frame flags. Their meaning depends on the frame type.
pub mod flags {
    /// Last frame the sender will emit on the stream (SYN_STREAM, SYN_REPLY, HEADERS, data)
    pub const FIN: u8 = 0x01;
    /// SYN_STREAM that the recipient must not reply on
    pub const UNIDIRECTIONAL: u8 = 0x02;
    /// SETTINGS: drop previously persisted values
    pub const CLEAR_SETTINGS: u8 = 0x01;
    /// Data payload is compressed
    pub const COMPRESS: u8 = 0x02;
    /// Settings entry: ask the recipient to persist the value
    pub const PERSIST_VALUE: u8 = 0x01;
    /// Settings entry: value was previously persisted
    pub const PERSISTED: u8 = 0x02;
}

/// Control frame type codes
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlType {
    /// Opens a stream
    SynStream = 1,
    /// Accepts a stream
    SynReply = 2,
    /// Aborts a stream
    RstStream = 3,
    /// Session parameters
    Settings = 4,
    /// Liveness probe
    Ping = 6,
    /// Session drain
    GoAway = 7,
    /// Additional headers for a stream
    Headers = 8,
    /// Flow-control credit
    WindowUpdate = 9,
}

impl TryFrom<u16> for ControlType {
    type Error = ParseError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::SynStream,
            2 => Self::SynReply,
            3 => Self::RstStream,
            4 => Self::Settings,
            6 => Self::Ping,
            7 => Self::GoAway,
            8 => Self::Headers,
            9 => Self::WindowUpdate,
            other => return Err(ParseError::InvalidType(other)),
        })
    }
}

impl Display for ControlType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::SynStream => "SYN_STREAM",
            Self::SynReply => "SYN_REPLY",
            Self::RstStream => "RST_STREAM",
            Self::Settings => "SETTINGS",
            Self::Ping => "PING",
            Self::GoAway => "GOAWAY",
            Self::Headers => "HEADERS",
            Self::WindowUpdate => "WINDOW_UPDATE",
        })
    }
}

/// SETTINGS identifiers
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingId {
    /// Expected upload bandwidth
    UploadBandwidth = 1,
    /// Expected download bandwidth
    DownloadBandwidth = 2,
    /// Expected round-trip time
    RoundTripTime = 3,
    /// Streams the sender permits the recipient to open
    MaxConcurrentStreams = 4,
    /// Current TCP congestion window
    CurrentCwnd = 5,
    /// Download retransmission rate
    DownloadRetransRate = 6,
    /// Initial send window for new streams
    InitialWindowSize = 7,
    /// Size of the client certificate vector
    ClientCertificateVectorSize = 8,
}

impl TryFrom<u32> for SettingId {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::UploadBandwidth,
            2 => Self::DownloadBandwidth,
            3 => Self::RoundTripTime,
            4 => Self::MaxConcurrentStreams,
            5 => Self::CurrentCwnd,
            6 => Self::DownloadRetransRate,
            7 => Self::InitialWindowSize,
            8 => Self::ClientCertificateVectorSize,
            other => return Err(other),
        })
    }
}

/// One SETTINGS entry. Unknown ids are kept so the engine can log and skip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    /// Entry flags (`PERSIST_VALUE`, `PERSISTED`)
    pub flags: u8,
    /// 24-bit identifier
    pub id: u32,
    /// Value
    pub value: u32,
}

impl Setting {
    /// Creates an entry without flags.
    pub fn new(id: SettingId, value: u32) -> Self {
        Self {
            flags: 0,
            id: id as u32,
            value,
        }
    }
}

/// SYN_STREAM payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynStream {
    /// `FIN` and `UNIDIRECTIONAL`
    pub flags: u8,
    /// Stream being opened
    pub stream_id: u32,
    /// Stream this one is associated with, 0 for none
    pub associated_stream_id: u32,
    /// 0 is the highest priority, 7 the lowest
    pub priority: u8,
    /// Credential slot
    pub slot: u8,
    /// Compressed name/value block
    pub header_block: Vec<u8>,
}

/// SYN_REPLY payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynReply {
    /// `FIN`
    pub flags: u8,
    /// Stream being accepted
    pub stream_id: u32,
    /// Compressed name/value block
    pub header_block: Vec<u8>,
}

/// RST_STREAM payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RstStream {
    /// Stream being reset
    pub stream_id: u32,
    /// Reason
    pub status: RstStatus,
}

/// SETTINGS payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// `CLEAR_SETTINGS`
    pub flags: u8,
    /// Entries in wire order
    pub entries: Vec<Setting>,
}

/// PING payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    /// Opaque id. Client-initiated pings use odd ids.
    pub id: u32,
}

/// GOAWAY payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoAway {
    /// Last stream the sender may have acted on
    pub last_good_stream_id: u32,
    /// Reason
    pub status: GoAwayStatus,
}

/// HEADERS payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Headers {
    /// `FIN`
    pub flags: u8,
    /// Stream the headers belong to
    pub stream_id: u32,
    /// Compressed name/value block
    pub header_block: Vec<u8>,
}

/// WINDOW_UPDATE payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdate {
    /// Stream receiving credit, 0 for the connection
    pub stream_id: u32,
    /// Credit in bytes, 1..=2^31-1
    pub delta: u32,
}

/// Data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Data {
    /// `FIN` and `COMPRESS`
    pub flags: u8,
    /// Stream the payload belongs to
    pub stream_id: u32,
    /// Raw payload
    pub payload: Vec<u8>,
}

/// A decoded frame, one variant per control type plus data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// SYN_STREAM
    SynStream(SynStream),
    /// SYN_REPLY
    SynReply(SynReply),
    /// RST_STREAM
    RstStream(RstStream),
    /// SETTINGS
    Settings(Settings),
    /// PING
    Ping(Ping),
    /// GOAWAY
    GoAway(GoAway),
    /// HEADERS
    Headers(Headers),
    /// WINDOW_UPDATE
    WindowUpdate(WindowUpdate),
    /// Data
    Data(Data),
}

impl Frame {
    /// Parses one frame from the front of `buf`, refusing payloads above [`MAX_FRAME_PAYLOAD`].
    pub fn parse(buf: &[u8]) -> ParseResult<(Frame, usize)> {
        parse(buf, MAX_FRAME_PAYLOAD)
    }

    /// Serializes the frame into a fresh buffer.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload_len());
        self.encode(&mut out);
        out
    }

    /// Stream the frame refers to. SETTINGS, PING and GOAWAY return `None`; a connection-level
    /// WINDOW_UPDATE returns `Some(0)`.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Self::SynStream(f) => Some(f.stream_id),
            Self::SynReply(f) => Some(f.stream_id),
            Self::RstStream(f) => Some(f.stream_id),
            Self::Headers(f) => Some(f.stream_id),
            Self::WindowUpdate(f) => Some(f.stream_id),
            Self::Data(f) => Some(f.stream_id),
            Self::Settings(_) | Self::Ping(_) | Self::GoAway(_) => None,
        }
    }

    /// Control type, `None` for data frames
    pub fn control_type(&self) -> Option<ControlType> {
        Some(match self {
            Self::SynStream(_) => ControlType::SynStream,
            Self::SynReply(_) => ControlType::SynReply,
            Self::RstStream(_) => ControlType::RstStream,
            Self::Settings(_) => ControlType::Settings,
            Self::Ping(_) => ControlType::Ping,
            Self::GoAway(_) => ControlType::GoAway,
            Self::Headers(_) => ControlType::Headers,
            Self::WindowUpdate(_) => ControlType::WindowUpdate,
            Self::Data(_) => return None,
        })
    }

    /// Whether the frame carries `FIN`
    pub fn is_fin(&self) -> bool {
        self.flags() & flags::FIN != 0
            && matches!(
                self,
                Self::SynStream(_) | Self::SynReply(_) | Self::Headers(_) | Self::Data(_)
            )
    }

    fn flags(&self) -> u8 {
        match self {
            Self::SynStream(f) => f.flags,
            Self::SynReply(f) => f.flags,
            Self::Settings(f) => f.flags,
            Self::Headers(f) => f.flags,
            Self::Data(f) => f.flags,
            Self::RstStream(_) | Self::Ping(_) | Self::GoAway(_) | Self::WindowUpdate(_) => 0,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            Self::SynStream(f) => 10 + f.header_block.len(),
            Self::SynReply(f) => 4 + f.header_block.len(),
            Self::RstStream(_) | Self::GoAway(_) | Self::WindowUpdate(_) => 8,
            Self::Settings(f) => 4 + 8 * f.entries.len(),
            Self::Ping(_) => 4,
            Self::Headers(f) => 4 + f.header_block.len(),
            Self::Data(f) => f.payload.len(),
        }
    }

    /// Appends the wire form of the frame to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        let len = self.payload_len() as u32;
        debug_assert!(len as usize <= MAX_FRAME_PAYLOAD);

        match self.control_type() {
            Some(kind) => {
                out.extend_from_slice(&((SPDY_VERSION | 0x8000).to_be_bytes()));
                out.extend_from_slice(&(kind as u16).to_be_bytes());
            }
            None => {
                let id = self.stream_id().unwrap_or_default() & MAX_STREAM_ID;
                out.extend_from_slice(&id.to_be_bytes());
            }
        }
        out.extend_from_slice(&(((self.flags() as u32) << 24) | len).to_be_bytes());

        match self {
            Self::SynStream(f) => {
                put_u31(out, f.stream_id);
                put_u31(out, f.associated_stream_id);
                out.push((f.priority & 0x07) << 5);
                out.push(f.slot);
                out.extend_from_slice(&f.header_block);
            }
            Self::SynReply(SynReply {
                stream_id,
                header_block,
                ..
            })
            | Self::Headers(Headers {
                stream_id,
                header_block,
                ..
            }) => {
                put_u31(out, *stream_id);
                out.extend_from_slice(header_block);
            }
            Self::RstStream(f) => {
                put_u31(out, f.stream_id);
                out.extend_from_slice(&(f.status as u32).to_be_bytes());
            }
            Self::Settings(f) => {
                out.extend_from_slice(&(f.entries.len() as u32).to_be_bytes());
                for entry in &f.entries {
                    out.extend_from_slice(
                        &(((entry.flags as u32) << 24) | (entry.id & 0x00ff_ffff)).to_be_bytes(),
                    );
                    out.extend_from_slice(&entry.value.to_be_bytes());
                }
            }
            Self::Ping(f) => out.extend_from_slice(&f.id.to_be_bytes()),
            Self::GoAway(f) => {
                put_u31(out, f.last_good_stream_id);
                out.extend_from_slice(&(f.status as u32).to_be_bytes());
            }
            Self::WindowUpdate(f) => {
                put_u31(out, f.stream_id);
                put_u31(out, f.delta);
            }
            Self::Data(f) => out.extend_from_slice(&f.payload),
        }
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.control_type() {
            Some(kind) => f.write_fmt(format_args!(
                "{} stream={} flags={:#04x} len={}",
                kind,
                self.stream_id().unwrap_or_default(),
                self.flags(),
                self.payload_len()
            )),
            None => f.write_fmt(format_args!(
                "DATA stream={} flags={:#04x} len={}",
                self.stream_id().unwrap_or_default(),
                self.flags(),
                self.payload_len()
            )),
        }
    }
}

#[inline]
fn put_u31(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&(value & MAX_STREAM_ID).to_be_bytes());
}

/// Parses one frame from the front of `buf`.
///
/// Returns the frame together with the number of bytes it occupied. When the header or the
/// declared payload is not fully buffered yet, returns [`ParseError::Incomplete`] having consumed
/// nothing; the caller keeps the bytes and retries once more arrive. A declared length above
/// `max_payload` is rejected as soon as the header is readable.
pub fn parse(buf: &[u8], max_payload: usize) -> ParseResult<(Frame, usize)> {
    if buf.len() < FRAME_HEADER_LEN {
        return Err(ParseError::Incomplete);
    }

    let mut header = RawFrame::new(&buf[..FRAME_HEADER_LEN]);
    let is_control = buf[0] & CONTROL_BIT != 0;
    let first = header.read_u32("frame header")?;
    let flags = header.read_u8("frame flags")?;
    let length = header.read_u24("frame length")? as usize;

    let kind = if is_control {
        let version = ((first >> 16) & 0x7fff) as u16;
        if version != SPDY_VERSION {
            return Err(ParseError::UnsupportedVersion(version));
        }
        Some(ControlType::try_from((first & 0xffff) as u16)?)
    } else {
        None
    };

    if length > max_payload {
        return Err(ParseError::FrameTooLarge {
            length,
            limit: max_payload,
        });
    }

    let total = FRAME_HEADER_LEN + length;
    if buf.len() < total {
        return Err(ParseError::Incomplete);
    }

    let mut payload = RawFrame::new(&buf[FRAME_HEADER_LEN..total]);
    let frame = match kind {
        None => Frame::Data(Data {
            flags,
            stream_id: first & MAX_STREAM_ID,
            payload: payload.rest().to_vec(),
        }),
        Some(kind) => parse_control(kind, flags, length, &mut payload)?,
    };

    Ok((frame, total))
}

fn parse_control(
    kind: ControlType,
    flags: u8,
    length: usize,
    payload: &mut RawFrame<'_>,
) -> ParseResult<Frame> {
    let invalid_length = |frame: &'static str| ParseError::InvalidLength { frame, length };

    let frame = match kind {
        ControlType::SynStream => {
            if length < 10 {
                return Err(invalid_length("SYN_STREAM"));
            }
            let stream_id = payload.read_u31("stream id")?;
            let associated_stream_id = payload.read_u31("associated stream id")?;
            let priority = payload.read_u8("priority")? >> 5;
            let slot = payload.read_u8("slot")?;
            Frame::SynStream(SynStream {
                flags,
                stream_id,
                associated_stream_id,
                priority,
                slot,
                header_block: payload.rest().to_vec(),
            })
        }
        ControlType::SynReply | ControlType::Headers => {
            if length < 4 {
                return Err(invalid_length(if kind == ControlType::SynReply {
                    "SYN_REPLY"
                } else {
                    "HEADERS"
                }));
            }
            let stream_id = payload.read_u31("stream id")?;
            let header_block = payload.rest().to_vec();
            if kind == ControlType::SynReply {
                Frame::SynReply(SynReply {
                    flags,
                    stream_id,
                    header_block,
                })
            } else {
                Frame::Headers(Headers {
                    flags,
                    stream_id,
                    header_block,
                })
            }
        }
        ControlType::RstStream => {
            if length != 8 {
                return Err(invalid_length("RST_STREAM"));
            }
            let stream_id = payload.read_u31("stream id")?;
            let status = RstStatus::try_from(payload.read_u32("status")?)?;
            Frame::RstStream(RstStream { stream_id, status })
        }
        ControlType::Settings => {
            if length < 4 {
                return Err(invalid_length("SETTINGS"));
            }
            let count = payload.read_u32("settings count")? as usize;
            if payload.remaining() / 8 != count || payload.remaining() % 8 != 0 {
                return Err(invalid_length("SETTINGS"));
            }
            let mut entries = Vec::with_capacity(count);
            for _ in 0..count {
                let word = payload.read_u32("setting id")?;
                entries.push(Setting {
                    flags: (word >> 24) as u8,
                    id: word & 0x00ff_ffff,
                    value: payload.read_u32("setting value")?,
                });
            }
            Frame::Settings(Settings { flags, entries })
        }
        ControlType::Ping => {
            if length != 4 {
                return Err(invalid_length("PING"));
            }
            Frame::Ping(Ping {
                id: payload.read_u32("ping id")?,
            })
        }
        ControlType::GoAway => {
            if length != 8 {
                return Err(invalid_length("GOAWAY"));
            }
            let last_good_stream_id = payload.read_u31("last good stream id")?;
            let status = GoAwayStatus::try_from(payload.read_u32("status")?)?;
            Frame::GoAway(GoAway {
                last_good_stream_id,
                status,
            })
        }
        ControlType::WindowUpdate => {
            if length != 8 {
                return Err(invalid_length("WINDOW_UPDATE"));
            }
            let stream_id = payload.read_u31("stream id")?;
            let delta = payload.read_u31("delta window size")?;
            if delta == 0 {
                return Err(ParseError::Malformed("delta window size"));
            }
            Frame::WindowUpdate(WindowUpdate { stream_id, delta })
        }
    };

    Ok(frame)
}
