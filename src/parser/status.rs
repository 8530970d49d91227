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

//! Status codes carried by RST_STREAM and GOAWAY
//! [SPDY/3 Section 2.6.3](https://www.chromium.org/spdy/spdy-protocol/spdy-protocol-draft3-1/)

use std::fmt::Display;

use super::ParseError;

/// RST_STREAM status codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RstStatus {
    /// Generic error, used when nothing more specific applies
    ProtocolError = 1,
    /// Frame received for a stream that is not active
    InvalidStream = 2,
    /// Stream refused before any processing was done
    RefusedStream = 3,
    /// Protocol version not supported by the recipient
    UnsupportedVersion = 4,
    /// Stream is no longer needed by its creator
    Cancel = 5,
    /// Generic error from the implementation itself
    InternalError = 6,
    /// Peer violated the flow-control protocol
    FlowControlError = 7,
    /// SYN_REPLY received for a stream that already has one
    StreamInUse = 8,
    /// Data or SYN_REPLY received after the half-close
    StreamAlreadyClosed = 9,
    /// Certificate credentials were rejected
    InvalidCredentials = 10,
    /// Frame too large for the implementation to process
    FrameTooLarge = 11,
}

impl TryFrom<u32> for RstStatus {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::ProtocolError,
            2 => Self::InvalidStream,
            3 => Self::RefusedStream,
            4 => Self::UnsupportedVersion,
            5 => Self::Cancel,
            6 => Self::InternalError,
            7 => Self::FlowControlError,
            8 => Self::StreamInUse,
            9 => Self::StreamAlreadyClosed,
            10 => Self::InvalidCredentials,
            11 => Self::FrameTooLarge,
            other => return Err(ParseError::InvalidStatus(other)),
        })
    }
}

impl Display for RstStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InvalidStream => "INVALID_STREAM",
            Self::RefusedStream => "REFUSED_STREAM",
            Self::UnsupportedVersion => "UNSUPPORTED_VERSION",
            Self::Cancel => "CANCEL",
            Self::InternalError => "INTERNAL_ERROR",
            Self::FlowControlError => "FLOW_CONTROL_ERROR",
            Self::StreamInUse => "STREAM_IN_USE",
            Self::StreamAlreadyClosed => "STREAM_ALREADY_CLOSED",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::FrameTooLarge => "FRAME_TOO_LARGE",
        })
    }
}

/// GOAWAY status codes
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GoAwayStatus {
    /// Normal session teardown
    Ok = 0,
    /// Generic protocol violation
    ProtocolError = 1,
    /// Internal failure of the sender
    InternalError = 2,
}

impl TryFrom<u32> for GoAwayStatus {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::ProtocolError),
            2 => Ok(Self::InternalError),
            other => Err(ParseError::InvalidStatus(other)),
        }
    }
}

impl Display for GoAwayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Ok => "OK",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
        })
    }
}
