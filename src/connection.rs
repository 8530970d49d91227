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

//! Byte channels between a socket and a [`Session`]
use std::{
    io::{self, ErrorKind, Read, Write},
    sync::Arc,
};

use mio::{event::Source, Interest, Registry, Token};
use rustls::{pki_types::ServerName, ClientConfig, ClientConnection};
use tracing::{debug, trace};

use crate::{error::Result, session::Session};

const READ_CHUNK: usize = 16 * 1024;

/// A transport carrying one session.
pub trait Connection {
    /// Reads everything the socket has and feeds it to the session. A connection-fatal session
    /// error is returned once; the GOAWAY it queued can still be written afterwards.
    fn read(&mut self) -> Result<()>;
    /// Writes as much pending output as the socket accepts and returns the bytes written.
    fn write(&mut self) -> Result<usize>;
    /// Whether output is waiting on the session or transport
    fn wants_write(&self) -> bool;
    /// Whether the transport is finished
    fn is_closed(&self) -> bool;
    /// Token registered with mio
    fn token(&self) -> Token;
    /// Registers the socket with `registry`.
    fn register(&mut self, registry: &Registry) -> io::Result<()>;
    /// Updates the registered interest.
    fn reregister(&mut self, registry: &Registry) -> io::Result<()>;
    /// Removes the socket from `registry`.
    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;
    /// The session
    fn session(&self) -> &Session;
    /// The session, mutably
    fn session_mut(&mut self) -> &mut Session;
}

/// Starts building a connection around a connected (or connecting) socket.
#[derive(Debug)]
pub struct ConnectionBuilder<S> {
    stream: S,
    token: Token,
}

impl<S> ConnectionBuilder<S>
where
    S: Read + Write + Source,
{
    /// Socket and the token it will be registered under
    pub fn new(stream: S, token: Token) -> Self {
        Self { stream, token }
    }

    /// Speak SPDY directly on the socket.
    pub fn with_plaintext(self, session: Session) -> PlaintextConnectionBuilder<S> {
        PlaintextConnectionBuilder::new(self.stream, self.token, session)
    }

    /// Speak SPDY inside TLS. The caller's `config` decides ALPN.
    pub fn with_tls(
        self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        session: Session,
    ) -> TlsConnectionBuilder<S> {
        TlsConnectionBuilder::new(self.stream, self.token, config, server_name, session)
    }
}

/// Builds a [`PlainConnection`].
#[derive(Debug)]
pub struct PlaintextConnectionBuilder<S> {
    stream: S,
    token: Token,
    session: Session,
}

impl<S> PlaintextConnectionBuilder<S>
where
    S: Read + Write + Source,
{
    fn new(stream: S, token: Token, session: Session) -> Self {
        PlaintextConnectionBuilder {
            stream,
            token,
            session,
        }
    }

    /// Finishes the connection.
    pub fn build(self) -> PlainConnection<S> {
        PlainConnection::new(self.token, self.stream, self.session)
    }
}

/// Builds a [`TlsConnection`].
#[derive(Debug)]
pub struct TlsConnectionBuilder<S> {
    stream: S,
    token: Token,
    config: Arc<ClientConfig>,
    server_name: ServerName<'static>,
    session: Session,
}

impl<S> TlsConnectionBuilder<S>
where
    S: Read + Write + Source,
{
    fn new(
        stream: S,
        token: Token,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
        session: Session,
    ) -> Self {
        TlsConnectionBuilder {
            stream,
            token,
            config,
            server_name,
            session,
        }
    }

    /// Starts the TLS handshake state machine.
    pub fn build(self) -> Result<TlsConnection<S>> {
        let tls = ClientConnection::new(self.config, self.server_name)?;
        Ok(TlsConnection::new(self.token, self.stream, tls, self.session))
    }
}

/// Session bytes straight over the socket
#[derive(Debug)]
pub struct PlainConnection<S>
where
    S: Read + Write + Source,
{
    stream: S,
    token: Token,
    closed: bool,
    session: Session,
    read_buf: Vec<u8>,
}

impl<S> PlainConnection<S>
where
    S: Read + Write + Source,
{
    /// Wraps `stream`.
    pub fn new(token: Token, stream: S, session: Session) -> Self {
        Self {
            stream,
            token,
            closed: false,
            session,
            read_buf: vec![0; READ_CHUNK],
        }
    }

    #[inline]
    fn event_set(&self) -> Interest {
        if self.session.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.session.on_transport_closed();
    }
}

impl<S> Connection for PlainConnection<S>
where
    S: Read + Write + Source,
{
    fn read(&mut self) -> Result<()> {
        loop {
            match self.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    debug!(token = self.token.0, "peer closed connection");
                    self.close();
                    return Ok(());
                }
                Ok(n) => {
                    trace!(bytes = n, "read");
                    self.session.on_bytes_available(&self.read_buf[..n])?;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }

    fn write(&mut self) -> Result<usize> {
        let mut total = 0;
        while self.session.wants_write() {
            match self.stream.write(self.session.pending_output()) {
                Ok(0) => {
                    self.close();
                    return Err(io::Error::from(ErrorKind::WriteZero).into());
                }
                Ok(n) => {
                    self.session.consume_output(n);
                    total += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            }
        }

        trace!(bytes = total, "wrote");
        Ok(total)
    }

    fn wants_write(&self) -> bool {
        self.session.wants_write()
    }

    fn is_closed(&self) -> bool {
        self.closed || (self.session.is_closed() && !self.session.wants_write())
    }

    #[inline]
    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.event_set();
        registry.register(&mut self.stream, self.token, interest)
    }

    #[inline]
    fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.event_set();
        registry.reregister(&mut self.stream, self.token, interest)
    }

    #[inline]
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn token(&self) -> Token {
        self.token
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}

/// Session bytes inside a rustls client connection
#[derive(Debug)]
pub struct TlsConnection<S>
where
    S: Read + Write + Source,
{
    stream: S,
    tls: Box<ClientConnection>,
    token: Token,
    closed: bool,
    session: Session,
    read_buf: Vec<u8>,
}

impl<S> TlsConnection<S>
where
    S: Read + Write + Source,
{
    /// Wraps `stream` in `tls`.
    pub fn new(token: Token, stream: S, tls: ClientConnection, session: Session) -> Self {
        Self {
            stream,
            tls: Box::new(tls),
            token,
            closed: false,
            session,
            read_buf: vec![0; READ_CHUNK],
        }
    }

    /// Whether the TLS handshake is still running
    pub fn is_handshaking(&self) -> bool {
        self.tls.is_handshaking()
    }

    /// Protocol chosen by ALPN, if any
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        self.tls.alpn_protocol()
    }

    /// Reads at most one socket read worth of records. rustls refuses more ciphertext until what
    /// it already holds has been processed.
    #[inline]
    fn read_tls(&mut self) -> io::Result<usize> {
        loop {
            match self.tls.read_tls(&mut self.stream) {
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                other => return other,
            }
        }
    }

    /// Moves decrypted bytes into the session.
    fn read_plaintext(&mut self) -> Result<()> {
        loop {
            match self.tls.reader().read(&mut self.read_buf) {
                Ok(0) => {
                    debug!(token = self.token.0, "peer sent close_notify");
                    self.close();
                    return Ok(());
                }
                Ok(n) => self.session.on_bytes_available(&self.read_buf[..n])?,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            }
        }
    }

    #[inline]
    fn event_set(&self) -> Interest {
        if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.session.on_transport_closed();
    }
}

impl<S> Connection for TlsConnection<S>
where
    S: Read + Write + Source,
{
    fn read(&mut self) -> Result<()> {
        while !self.closed {
            match self.read_tls() {
                Ok(0) => {
                    debug!(token = self.token.0, "peer closed connection");
                    self.close();
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            }

            let state = match self.tls.process_new_packets() {
                Ok(state) => state,
                Err(e) => {
                    // rustls queued an alert; give write() a chance to send it
                    self.close();
                    return Err(e.into());
                }
            };

            if state.plaintext_bytes_to_read() > 0 {
                self.read_plaintext()?;
            }
            if state.peer_has_closed() && !self.closed {
                self.close();
            }
        }

        Ok(())
    }

    fn write(&mut self) -> Result<usize> {
        if self.session.wants_write() {
            let n = self.tls.writer().write(self.session.pending_output())?;
            self.session.consume_output(n);
        }

        let mut total = 0;
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    self.close();
                    return Err(e.into());
                }
            }
        }

        trace!(bytes = total, "wrote tls records");
        Ok(total)
    }

    fn wants_write(&self) -> bool {
        self.session.wants_write() || self.tls.wants_write()
    }

    fn is_closed(&self) -> bool {
        (self.closed && !self.tls.wants_write())
            || (self.session.is_closed() && !self.wants_write())
    }

    #[inline]
    fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.event_set();
        registry.register(&mut self.stream, self.token, interest)
    }

    #[inline]
    fn reregister(&mut self, registry: &Registry) -> io::Result<()> {
        let interest = self.event_set();
        registry.reregister(&mut self.stream, self.token, interest)
    }

    #[inline]
    fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    fn token(&self) -> Token {
        self.token
    }

    fn session(&self) -> &Session {
        &self.session
    }

    fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }
}
