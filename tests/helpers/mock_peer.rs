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

use spdy_engine::{
    compression::{HeaderDecoder, HeaderEncoder},
    parser::{
        frame::{
            flags, Data, GoAway, Headers, Ping, RstStream, Setting, Settings, SynReply, SynStream,
            WindowUpdate,
        },
        Frame, GoAwayStatus, Header, RstStatus,
    },
    session::Session,
};

/// An in-memory server. It keeps its own compression contexts, so every SYN_STREAM the session
/// sends must pass through [`MockPeer::read`] in order.
#[allow(dead_code)]
pub struct MockPeer {
    encoder: HeaderEncoder,
    decoder: HeaderDecoder,
    /// Request headers of every SYN_STREAM seen, by stream id
    pub requests: Vec<(u32, Vec<Header>)>,
}

#[allow(dead_code)]
impl MockPeer {
    pub fn new() -> Self {
        Self {
            encoder: HeaderEncoder::new().unwrap(),
            decoder: HeaderDecoder::new(1 << 20),
            requests: Vec::new(),
        }
    }

    /// Drains and parses everything the session has queued.
    pub fn read(&mut self, session: &mut Session) -> Vec<Frame> {
        let bytes = session.take_output();
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos < bytes.len() {
            let (frame, used) = Frame::parse(&bytes[pos..]).unwrap();
            if let Frame::SynStream(syn) = &frame {
                let headers = self.decoder.decompress(&syn.header_block).unwrap();
                self.requests.push((syn.stream_id, headers));
            }
            frames.push(frame);
            pos += used;
        }
        frames
    }

    /// Like [`MockPeer::read`], dropping the SETTINGS preface and any WINDOW_UPDATEs.
    pub fn read_significant(&mut self, session: &mut Session) -> Vec<Frame> {
        self.read(session)
            .into_iter()
            .filter(|f| !matches!(f, Frame::Settings(_) | Frame::WindowUpdate(_)))
            .collect()
    }

    pub fn syn_reply(&mut self, stream_id: u32, headers: &[Header], fin: bool) -> Vec<u8> {
        Frame::SynReply(SynReply {
            flags: fin_flag(fin),
            stream_id,
            header_block: self.encoder.compress(headers).unwrap(),
        })
        .serialize()
    }

    /// SYN_REPLY with `:status 200 OK`
    pub fn ok(&mut self, stream_id: u32, fin: bool) -> Vec<u8> {
        self.syn_reply(stream_id, &ok_headers(), fin)
    }

    pub fn headers(&mut self, stream_id: u32, headers: &[Header], fin: bool) -> Vec<u8> {
        Frame::Headers(Headers {
            flags: fin_flag(fin),
            stream_id,
            header_block: self.encoder.compress(headers).unwrap(),
        })
        .serialize()
    }

    pub fn push(&mut self, stream_id: u32, associated_stream_id: u32, path: &str) -> Vec<u8> {
        Frame::SynStream(SynStream {
            flags: flags::UNIDIRECTIONAL,
            stream_id,
            associated_stream_id,
            priority: 0,
            slot: 0,
            header_block: self
                .encoder
                .compress(&[
                    Header::new(":path", path),
                    Header::new(":host", "example.org"),
                    Header::new(":scheme", "https"),
                ])
                .unwrap(),
        })
        .serialize()
    }

    /// Compresses a block without framing it.
    pub fn compress(&mut self, headers: &[Header]) -> Vec<u8> {
        self.encoder.compress(headers).unwrap()
    }
}

pub fn ok_headers() -> Vec<Header> {
    vec![
        Header::new(":status", "200 OK"),
        Header::new(":version", "HTTP/1.1"),
        Header::new("content-type", "text/plain"),
    ]
}

fn fin_flag(fin: bool) -> u8 {
    if fin {
        flags::FIN
    } else {
        0
    }
}

#[allow(dead_code)]
pub fn data(stream_id: u32, payload: &[u8], fin: bool) -> Vec<u8> {
    Frame::Data(Data {
        flags: fin_flag(fin),
        stream_id,
        payload: payload.to_vec(),
    })
    .serialize()
}

#[allow(dead_code)]
pub fn rst(stream_id: u32, status: RstStatus) -> Vec<u8> {
    Frame::RstStream(RstStream { stream_id, status }).serialize()
}

#[allow(dead_code)]
pub fn go_away(last_good_stream_id: u32) -> Vec<u8> {
    Frame::GoAway(GoAway {
        last_good_stream_id,
        status: GoAwayStatus::Ok,
    })
    .serialize()
}

#[allow(dead_code)]
pub fn window_update(stream_id: u32, delta: u32) -> Vec<u8> {
    Frame::WindowUpdate(WindowUpdate { stream_id, delta }).serialize()
}

#[allow(dead_code)]
pub fn settings(entries: Vec<Setting>) -> Vec<u8> {
    Frame::Settings(Settings { flags: 0, entries }).serialize()
}

#[allow(dead_code)]
pub fn ping(id: u32) -> Vec<u8> {
    Frame::Ping(Ping { id }).serialize()
}
