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

//! Credit based flow control
//!
//! Every stream has a send window (credit granted by the peer) and a receive window (credit we
//! granted the peer). The connection has one of each as well, identified by stream id 0 on the
//! wire. Data may only be sent when both the stream and the connection send windows cover it.

use crate::stream::Stream;

/// Largest value a window may reach
pub const MAX_WINDOW: i64 = 0x7fff_ffff;
/// Window size every stream and the connection start with
pub const DEFAULT_WINDOW: u32 = 64 * 1024;

/// Sending would exceed the credit the peer granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("flow-control window exhausted")]
pub struct WouldBlock;

/// A credit pushed the window past 2^31-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("flow-control window overflow")]
pub struct WindowOverflow;

/// The peer sent more than the credit we granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer exceeded the receive window")]
pub struct WindowExceeded;

/// One direction of credit. Signed, because a SETTINGS change may shrink a window below zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    available: i64,
}

impl Window {
    /// Window starting with `initial` bytes of credit
    pub fn new(initial: u32) -> Self {
        Self {
            available: initial as i64,
        }
    }

    /// Current credit
    pub fn available(&self) -> i64 {
        self.available
    }

    /// Credit usable right now, zero when the window is exhausted or negative
    pub fn usable(&self) -> usize {
        self.available.max(0) as usize
    }

    /// Spends `n` bytes of send credit. Refuses instead of going negative.
    pub fn consume(&mut self, n: usize) -> Result<(), WouldBlock> {
        if n as i64 > self.available {
            return Err(WouldBlock);
        }
        self.available -= n as i64;
        Ok(())
    }

    /// Adds `delta` bytes of credit.
    pub fn credit(&mut self, delta: u32) -> Result<(), WindowOverflow> {
        let next = self.available + delta as i64;
        if next > MAX_WINDOW {
            return Err(WindowOverflow);
        }
        self.available = next;
        Ok(())
    }

    /// Records `n` bytes received against the credit we granted.
    pub fn charge(&mut self, n: usize) -> Result<(), WindowExceeded> {
        if n as i64 > self.available {
            return Err(WindowExceeded);
        }
        self.available -= n as i64;
        Ok(())
    }

    /// Shifts the window by a SETTINGS delta.
    pub fn adjust(&mut self, delta: i64) -> Result<(), WindowOverflow> {
        let next = self.available + delta;
        if next > MAX_WINDOW {
            return Err(WindowOverflow);
        }
        self.available = next;
        Ok(())
    }
}

/// Connection-level windows and the baselines new streams start from.
#[derive(Debug)]
pub struct FlowControl {
    send: Window,
    recv: Window,
    recv_target: u32,
    stream_send_initial: u32,
    stream_recv_initial: u32,
}

impl FlowControl {
    /// `stream_recv_initial` is what we advertise for streams, `connection_recv` what we allow
    /// across the whole connection.
    pub fn new(stream_recv_initial: u32, connection_recv: u32) -> Self {
        Self {
            send: Window::new(DEFAULT_WINDOW),
            recv: Window::new(DEFAULT_WINDOW),
            recv_target: connection_recv,
            stream_send_initial: DEFAULT_WINDOW,
            stream_recv_initial,
        }
    }

    /// Send credit new streams start with
    pub fn stream_send_initial(&self) -> u32 {
        self.stream_send_initial
    }

    /// Receive credit new streams start with
    pub fn stream_recv_initial(&self) -> u32 {
        self.stream_recv_initial
    }

    /// Connection send window
    pub fn connection_send(&self) -> Window {
        self.send
    }

    /// Connection receive window
    pub fn connection_recv(&self) -> Window {
        self.recv
    }

    /// Credit to grant beyond the default connection window when the session starts.
    pub fn initial_connection_credit(&mut self) -> Option<u32> {
        let extra = self.recv_target.saturating_sub(DEFAULT_WINDOW);
        if extra == 0 {
            return None;
        }
        // The target is bounded by MAX_WINDOW, so this cannot overflow.
        let _ = self.recv.credit(extra);
        Some(extra)
    }

    /// Bytes `stream` may send now, bounded by both windows.
    pub fn sendable(&self, stream: &Stream) -> usize {
        self.send.usable().min(stream.send_window.usable())
    }

    /// Spends send credit on both the stream and the connection, or neither.
    pub fn consume(&mut self, stream: &mut Stream, n: usize) -> Result<(), WouldBlock> {
        if n > self.sendable(stream) {
            return Err(WouldBlock);
        }
        stream.send_window.consume(n)?;
        self.send.consume(n)
    }

    /// Applies a WINDOW_UPDATE. `None` targets the connection.
    pub fn credit(&mut self, stream: Option<&mut Stream>, delta: u32) -> Result<(), WindowOverflow> {
        match stream {
            Some(stream) => stream.send_window.credit(delta),
            None => self.send.credit(delta),
        }
    }

    /// Records inbound data against the connection window, whatever stream it names.
    pub fn charge_connection(&mut self, n: usize) -> Result<(), WindowExceeded> {
        self.recv.charge(n)
    }

    /// Records inbound data against the stream window.
    pub fn charge(&mut self, stream: &mut Stream, n: usize) -> Result<(), WindowExceeded> {
        stream.recv_window.charge(n)
    }

    /// The application consumed `n` received bytes of `stream`. Returns the credit to hand back
    /// to the stream once its window has fallen to half of the initial size.
    pub fn release(&mut self, stream: &mut Stream, n: usize) -> Option<u32> {
        stream.unacked += n;
        let low_water = self.stream_recv_initial as i64 / 2;
        if stream.recv_window.available() > low_water || stream.unacked == 0 {
            return None;
        }
        let delta = stream.unacked as u32;
        stream.unacked = 0;
        stream.recv_window.credit(delta).ok()?;
        Some(delta)
    }

    /// Returns the credit restoring the connection receive window to its target once it has
    /// fallen to half of the target or below.
    pub fn release_connection(&mut self) -> Option<u32> {
        let target = self.recv_target.max(DEFAULT_WINDOW) as i64;
        let available = self.recv.available();
        if available > target / 2 {
            return None;
        }
        let delta = (target - available) as u32;
        self.recv.credit(delta).ok()?;
        Some(delta)
    }

    /// Installs a new initial send window from SETTINGS and returns the delta existing streams
    /// must be shifted by.
    pub fn set_stream_send_initial(&mut self, value: u32) -> i64 {
        let delta = value as i64 - self.stream_send_initial as i64;
        self.stream_send_initial = value;
        delta
    }
}

#[cfg(test)]
mod test {
    use fake::Fake;

    use super::*;
    use crate::{
        request::{Reply, Request},
        stream::{Phase, Stream},
    };

    fn stream(send: u32, recv: u32) -> Stream {
        let request = Request::get("example.org", "/");
        Stream::new(1, &request, Phase::Open, Box::new(Reply::shared()), send, recv)
    }

    #[test]
    fn window_consume_refuses_beyond_credit() {
        let mut window = Window::new(10);
        assert_eq!(Ok(()), window.consume(4));
        assert_eq!(Err(WouldBlock), window.consume(7));
        assert_eq!(6, window.available());
        assert_eq!(Ok(()), window.consume(6));
        assert_eq!(Err(WouldBlock), window.consume(1));
        assert_eq!(0, window.available());
    }

    #[test]
    fn window_credit_overflow() {
        let mut window = Window::new(MAX_WINDOW as u32);
        assert_eq!(Err(WindowOverflow), window.credit(1));
        assert_eq!(MAX_WINDOW, window.available());
    }

    #[test]
    fn window_adjust_may_go_negative_and_blocks() {
        let mut window = Window::new(100);
        window.adjust(-150).unwrap();
        assert_eq!(-50, window.available());
        assert_eq!(0, window.usable());
        assert_eq!(Err(WouldBlock), window.consume(1));
        window.credit(60).unwrap();
        assert_eq!(Ok(()), window.consume(10));
    }

    #[test]
    fn window_never_negative_under_generated_operations() {
        let mut window = Window::new(DEFAULT_WINDOW);
        for _ in 0..1000 {
            if (0..2u8).fake::<u8>() == 0 {
                let _ = window.consume((0..40_000usize).fake::<usize>());
            } else {
                let _ = window.credit((1..40_000u32).fake::<u32>());
            }
            assert!(window.available() >= 0);
            assert!(window.available() <= MAX_WINDOW);
        }
    }

    #[test]
    fn consume_is_bounded_by_connection_window() {
        let mut flow = FlowControl::new(DEFAULT_WINDOW, DEFAULT_WINDOW);
        let mut big = stream(1 << 20, DEFAULT_WINDOW);
        assert_eq!(DEFAULT_WINDOW as usize, flow.sendable(&big));
        assert_eq!(Err(WouldBlock), flow.consume(&mut big, DEFAULT_WINDOW as usize + 1));
        assert_eq!(Ok(()), flow.consume(&mut big, DEFAULT_WINDOW as usize));
        assert_eq!(0, flow.sendable(&big));

        flow.credit(None, 10).unwrap();
        assert_eq!(10, flow.sendable(&big));
    }

    #[test]
    fn consume_is_bounded_by_stream_window() {
        let mut flow = FlowControl::new(DEFAULT_WINDOW, DEFAULT_WINDOW);
        let mut small = stream(5, DEFAULT_WINDOW);
        assert_eq!(Err(WouldBlock), flow.consume(&mut small, 6));
        assert_eq!(DEFAULT_WINDOW as i64, flow.connection_send().available());
        flow.credit(Some(&mut small), 1).unwrap();
        assert_eq!(Ok(()), flow.consume(&mut small, 6));
    }

    #[test]
    fn release_replenishes_at_half_window() {
        let mut flow = FlowControl::new(100, DEFAULT_WINDOW);
        let mut s = stream(DEFAULT_WINDOW, 100);

        flow.charge(&mut s, 30).unwrap();
        assert_eq!(None, flow.release(&mut s, 30));
        flow.charge(&mut s, 30).unwrap();
        assert_eq!(Some(60), flow.release(&mut s, 30));
        assert_eq!(100, s.recv_window.available());
    }

    #[test]
    fn charge_rejects_overrun() {
        let mut flow = FlowControl::new(10, DEFAULT_WINDOW);
        let mut s = stream(DEFAULT_WINDOW, 10);
        assert_eq!(Err(WindowExceeded), flow.charge(&mut s, 11));
    }

    #[test]
    fn release_connection_restores_target() {
        let mut flow = FlowControl::new(DEFAULT_WINDOW, DEFAULT_WINDOW);
        flow.charge_connection(1000).unwrap();
        assert_eq!(None, flow.release_connection());
        flow.charge_connection(40_000).unwrap();
        assert_eq!(Some(41_000), flow.release_connection());
        assert_eq!(DEFAULT_WINDOW as i64, flow.connection_recv().available());
    }

    #[test]
    fn initial_connection_credit_only_when_target_exceeds_default() {
        let mut flow = FlowControl::new(DEFAULT_WINDOW, DEFAULT_WINDOW);
        assert_eq!(None, flow.initial_connection_credit());

        let mut flow = FlowControl::new(DEFAULT_WINDOW, 1 << 20);
        assert_eq!(Some((1 << 20) - DEFAULT_WINDOW), flow.initial_connection_credit());
        assert_eq!(1 << 20, flow.connection_recv().available());
    }

    #[test]
    fn settings_delta() {
        let mut flow = FlowControl::new(DEFAULT_WINDOW, DEFAULT_WINDOW);
        assert_eq!(-(DEFAULT_WINDOW as i64) + 1000, flow.set_stream_send_initial(1000));
        assert_eq!(1000, flow.stream_send_initial());
    }
}
