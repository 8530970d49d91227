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

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream},
    sync::Arc,
    thread::{self, JoinHandle},
};

use rustls::{ServerConfig, ServerConnection, StreamOwned};

use spdy_engine::{
    compression::{HeaderDecoder, HeaderEncoder},
    parser::{Frame, Header, FRAME_HEADER_LEN},
};

/// A blocking SPDY server on a loopback port, running one connection on a thread.
#[allow(dead_code)]
pub struct MockServer {
    listener: TcpListener,
}

#[allow(dead_code)]
impl MockServer {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            listener: TcpListener::bind("127.0.0.1:0")?,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Accepts one connection and hands it to `handler` on a new thread.
    pub fn start<F>(self, handler: F) -> JoinHandle<()>
    where
        F: FnOnce(MockConnection) + Send + 'static,
    {
        thread::spawn(move || {
            if let Ok((stream, _)) = self.listener.accept() {
                handler(MockConnection::new(stream));
            }
        })
    }

    /// Like [`MockServer::start`], speaking TLS with `config`. The handshake runs on the first
    /// read or write.
    pub fn start_tls<F>(self, config: Arc<ServerConfig>, handler: F) -> JoinHandle<()>
    where
        F: FnOnce(MockConnection<TlsStream>) + Send + 'static,
    {
        thread::spawn(move || {
            if let Ok((stream, _)) = self.listener.accept() {
                let tls = ServerConnection::new(config).unwrap();
                handler(MockConnection::new(StreamOwned::new(tls, stream)));
            }
        })
    }
}

/// Server end of a TLS connection
#[allow(dead_code)]
pub type TlsStream = StreamOwned<ServerConnection, TcpStream>;

/// Frame-level access to one accepted connection.
#[allow(dead_code)]
pub struct MockConnection<S = TcpStream> {
    stream: S,
    encoder: HeaderEncoder,
    decoder: HeaderDecoder,
}

#[allow(dead_code)]
impl<S> MockConnection<S>
where
    S: Read + Write,
{
    fn new(stream: S) -> Self {
        Self {
            stream,
            encoder: HeaderEncoder::new().unwrap(),
            decoder: HeaderDecoder::new(1 << 20),
        }
    }

    /// Reads the next frame, or `None` at end of stream.
    pub fn read_frame(&mut self) -> Option<Frame> {
        let mut buf = vec![0; FRAME_HEADER_LEN];
        self.stream.read_exact(&mut buf).ok()?;
        let len = u32::from_be_bytes([0, buf[5], buf[6], buf[7]]) as usize;
        buf.resize(FRAME_HEADER_LEN + len, 0);
        self.stream.read_exact(&mut buf[FRAME_HEADER_LEN..]).ok()?;
        let (frame, _) = Frame::parse(&buf).unwrap();
        Some(frame)
    }

    /// Reads frames until a SYN_STREAM and returns its id and headers.
    pub fn read_request(&mut self) -> Option<(u32, Vec<Header>)> {
        loop {
            if let Frame::SynStream(syn) = self.read_frame()? {
                let headers = self.decoder.decompress(&syn.header_block).unwrap();
                return Some((syn.stream_id, headers));
            }
        }
    }

    /// Compresses a header block with this connection's encoder.
    pub fn compress(&mut self, headers: &[Header]) -> Vec<u8> {
        self.encoder.compress(headers).unwrap()
    }

    pub fn write_frame(&mut self, frame: &Frame) {
        self.stream.write_all(&frame.serialize()).unwrap();
        self.stream.flush().unwrap();
    }

    /// Reads and discards frames until the client hangs up.
    pub fn drain(&mut self) {
        while self.read_frame().is_some() {}
    }
}
