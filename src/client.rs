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

//! Single connection event loop

use std::{
    io::ErrorKind,
    time::{Duration, Instant},
};

use mio::{Events, Poll};
use tracing::{debug, warn};

use crate::{connection::Connection, error::Result, session::Session};

/// Why [`Client::run_until_idle`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every stream finished and all output was written.
    Idle,
    /// The connection closed.
    Closed,
    /// The timeout elapsed first.
    TimedOut,
}

/// Drives one [`Connection`] with a mio poll.
///
/// Open streams through [`Client::session`], then call [`Client::run_until_idle`] to move bytes
/// until they finish.
#[derive(Debug)]
pub struct Client<C>
where
    C: Connection,
{
    poll: Poll,
    num_events: usize,
    connection: C,
    /// The socket reported writable at least once, so it is connected.
    writable: bool,
}

impl<C> Client<C>
where
    C: Connection,
{
    /// Registers `connection` with a new poll.
    pub fn new(mut connection: C) -> Result<Self> {
        let poll = Poll::new()?;
        connection.register(poll.registry())?;

        Ok(Self {
            poll,
            num_events: 64,
            connection,
            writable: false,
        })
    }

    /// The session carried by the connection
    pub fn session(&mut self) -> &mut Session {
        self.connection.session_mut()
    }

    /// The connection
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Moves bytes until no streams remain and all output is written, the connection closes, or
    /// `timeout` elapses. A connection-fatal error is returned after its GOAWAY has been offered
    /// to the socket.
    pub fn run_until_idle(&mut self, timeout: Option<Duration>) -> Result<RunOutcome> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut events = Events::with_capacity(self.num_events);

        loop {
            if self.connection.is_closed() {
                return Ok(RunOutcome::Closed);
            }
            if self.connection.session().is_idle() && !self.connection.wants_write() {
                return Ok(RunOutcome::Idle);
            }
            if self.writable && self.connection.wants_write() {
                self.connection.write()?;
            }
            self.connection.reregister(self.poll.registry())?;

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        debug!("timed out waiting for streams");
                        return Ok(RunOutcome::TimedOut);
                    }
                    Some(deadline - now)
                }
                None => None,
            };

            if let Err(err) = self.poll.poll(&mut events, wait) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(err.into());
            }

            for event in events.iter() {
                if event.token() != self.connection.token() {
                    continue;
                }

                if event.is_writable() {
                    self.writable = true;
                }

                if event.is_readable() || event.is_read_closed() {
                    if let Err(err) = self.connection.read() {
                        if self.writable {
                            // best effort: the peer may already be gone
                            let _ = self.connection.write();
                        }
                        warn!(%err, "connection failed");
                        return Err(err);
                    }
                }

                if self.writable && self.connection.wants_write() {
                    self.connection.write()?;
                }
            }
        }
    }

    /// Deregisters the connection and hands it back.
    pub fn into_connection(mut self) -> Result<C> {
        self.connection.deregister(self.poll.registry())?;
        Ok(self.connection)
    }
}
