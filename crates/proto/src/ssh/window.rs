//! Channel flow control windows (RFC 4254 Section 5.2).
//!
//! Every channel has two windows:
//!
//! - [`RemoteWindow`]: credit the peer granted us. Writers take credit before
//!   sending data and wait when none is left.
//! - [`LocalWindow`]: credit we granted the peer. Incoming data consumes it,
//!   and it is topped up with `SSH_MSG_CHANNEL_WINDOW_ADJUST` once half of the
//!   initial window has been consumed, long before it can run dry.

use crate::ssh::packet::MAX_PACKET_SIZE;
use crate::ssh::transport::lock;
use std::sync::Mutex;
use std::time::Duration;
use tern_platform::{TernError, TernResult};
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};
use tracing::trace;

/// Largest data chunk one `SSH_MSG_CHANNEL_DATA` may carry: the packet limit
/// less length, padding and MAC headroom and the 9 byte message header.
pub const MAX_DATA_CHUNK: u32 = (MAX_PACKET_SIZE - 64 - 9) as u32;

#[derive(Debug)]
struct RemoteState {
    size: u32,
    error: Option<TernError>,
}

/// Send credit granted by the peer.
#[derive(Debug)]
pub struct RemoteWindow {
    channel: u32,
    max_packet: u32,
    state: Mutex<RemoteState>,
    wake: Notify,
}

impl RemoteWindow {
    /// Creates a window with the peer's initial size and maximum packet size.
    ///
    /// A peer maximum above [`MAX_DATA_CHUNK`] is capped to it.
    pub fn new(channel: u32, initial: u32, max_packet: u32) -> Self {
        Self {
            channel,
            max_packet: max_packet.clamp(1, MAX_DATA_CHUNK),
            state: Mutex::new(RemoteState {
                size: initial,
                error: None,
            }),
            wake: Notify::new(),
        }
    }

    /// Current credit in bytes.
    pub fn size(&self) -> u32 {
        lock(&self.state).size
    }

    /// Peer's maximum packet size.
    pub fn max_packet(&self) -> u32 {
        self.max_packet
    }

    /// Adds credit from a `WINDOW_ADJUST`.
    ///
    /// The window may not grow past 2^32 - 1 bytes.
    pub fn expand(&self, bytes: u32) -> TernResult<()> {
        let mut state = lock(&self.state);
        state.size = state.size.checked_add(bytes).ok_or_else(|| {
            TernError::Protocol(format!(
                "Window adjust of {} overflows channel {} window",
                bytes, self.channel
            ))
        })?;
        trace!(channel = self.channel, bytes, size = state.size, "Remote window expanded");
        drop(state);
        self.wake.notify_waiters();
        Ok(())
    }

    /// Takes between 1 and `wanted` bytes of credit, capped at the maximum
    /// packet size, waiting up to `wait` for the peer to grant some.
    ///
    /// Fails immediately once the window is closed.
    pub async fn acquire(&self, wanted: u32, wait: Duration) -> TernResult<u32> {
        let wanted = wanted.clamp(1, self.max_packet);
        let deadline = Instant::now() + wait;

        loop {
            let notified = self.wake.notified();
            tokio::pin!(notified);
            {
                let mut state = lock(&self.state);
                if let Some(err) = &state.error {
                    return Err(err.clone());
                }
                if state.size > 0 {
                    let taken = wanted.min(state.size);
                    state.size -= taken;
                    trace!(channel = self.channel, taken, left = state.size, "Remote window consumed");
                    return Ok(taken);
                }
                notified.as_mut().enable();
            }

            trace!(channel = self.channel, "Waiting for remote window");
            if timeout_at(deadline, notified).await.is_err() {
                return Err(TernError::Timeout(format!(
                    "Waiting for window space on channel {}",
                    self.channel
                )));
            }
        }
    }

    /// Fails all current and future waits with `err`. The first error wins.
    pub fn close(&self, err: TernError) {
        let mut state = lock(&self.state);
        if state.error.is_none() {
            state.error = Some(err);
        }
        drop(state);
        self.wake.notify_waiters();
    }
}

/// Receive credit we granted the peer.
#[derive(Debug)]
pub struct LocalWindow {
    channel: u32,
    initial: u32,
    max_packet: u32,
    state: Mutex<LocalState>,
}

#[derive(Debug)]
struct LocalState {
    size: u32,
    consumed: u32,
}

impl LocalWindow {
    /// Creates a window advertising `initial` bytes.
    pub fn new(channel: u32, initial: u32, max_packet: u32) -> Self {
        Self {
            channel,
            initial,
            max_packet,
            state: Mutex::new(LocalState {
                size: initial,
                consumed: 0,
            }),
        }
    }

    /// Credit currently advertised.
    pub fn size(&self) -> u32 {
        lock(&self.state).size
    }

    /// Initial (and maximum) advertised size.
    pub fn initial(&self) -> u32 {
        self.initial
    }

    /// Maximum packet size we accept.
    pub fn max_packet(&self) -> u32 {
        self.max_packet
    }

    /// Accounts for `len` bytes received from the peer.
    ///
    /// Data beyond the advertised window or larger than the maximum packet
    /// size is a protocol violation.
    pub fn consume(&self, len: u32) -> TernResult<()> {
        if len > self.max_packet {
            return Err(TernError::Protocol(format!(
                "Packet of {} bytes exceeds channel {} maximum of {}",
                len, self.channel, self.max_packet
            )));
        }
        let mut state = lock(&self.state);
        state.size = state.size.checked_sub(len).ok_or_else(|| {
            TernError::Protocol(format!(
                "Peer sent {} bytes with only {} left in channel {} window",
                len, state.size, self.channel
            ))
        })?;
        Ok(())
    }

    /// Records `len` bytes handed to the application. Returns the adjustment
    /// to send once half the initial window has been consumed.
    pub fn release(&self, len: u32) -> Option<u32> {
        let mut state = lock(&self.state);
        state.consumed = state.consumed.saturating_add(len);
        if state.consumed < self.threshold() {
            return None;
        }
        let adjust = self.initial.saturating_sub(state.size);
        state.consumed = 0;
        if adjust == 0 {
            return None;
        }
        state.size += adjust;
        trace!(channel = self.channel, adjust, "Local window topped up");
        Some(adjust)
    }

    fn threshold(&self) -> u32 {
        (self.initial / 2).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_acquire_takes_partial_credit() {
        let window = RemoteWindow::new(0, 10, 8);
        assert_eq!(window.acquire(100, Duration::from_secs(1)).await.unwrap(), 8);
        assert_eq!(window.acquire(100, Duration::from_secs(1)).await.unwrap(), 2);
        assert_eq!(window.size(), 0);
    }

    #[tokio::test]
    async fn test_peer_max_packet_capped_to_encodable_size() {
        let window = RemoteWindow::new(0, 1 << 20, 64 * 1024);
        assert_eq!(window.max_packet(), MAX_DATA_CHUNK);
        let n = window.acquire(40_000, Duration::from_secs(1)).await.unwrap();
        assert_eq!(n, MAX_DATA_CHUNK);
        assert_eq!(RemoteWindow::new(0, 10, 0).max_packet(), 1);
    }

    #[tokio::test]
    async fn test_acquire_waits_for_adjust() {
        let window = Arc::new(RemoteWindow::new(0, 0, 1024));

        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.acquire(500, Duration::from_secs(5)).await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        window.expand(300).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 300);
        assert_eq!(window.size(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out() {
        let window = RemoteWindow::new(3, 0, 1024);
        let err = window.acquire(1, Duration::from_secs(2)).await.unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_close_wakes_waiters() {
        let window = Arc::new(RemoteWindow::new(0, 0, 1024));
        let waiter = {
            let window = window.clone();
            tokio::spawn(async move { window.acquire(10, Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;

        window.close(TernError::Closed("channel closed".to_string()));
        assert!(matches!(
            waiter.await.unwrap(),
            Err(TernError::Closed(_))
        ));
        // later waits fail too, even with credit
        window.expand(10).unwrap();
        assert!(window.acquire(1, Duration::from_secs(1)).await.is_err());
    }

    #[test]
    fn test_expand_overflow_rejected() {
        let window = RemoteWindow::new(0, u32::MAX - 1, 1024);
        assert!(window.expand(2).is_err());
        assert_eq!(window.size(), u32::MAX - 1);
    }

    #[test]
    fn test_local_window_consume_limits() {
        let window = LocalWindow::new(1, 100, 60);
        window.consume(60).unwrap();
        assert!(window.consume(61).is_err());
        assert!(window.consume(50).is_err());
        window.consume(40).unwrap();
        assert_eq!(window.size(), 0);
    }

    #[test]
    fn test_local_window_top_up_at_half() {
        let window = LocalWindow::new(1, 100, 100);
        window.consume(30).unwrap();
        assert_eq!(window.release(30), None);

        window.consume(30).unwrap();
        assert_eq!(window.release(30), Some(60));
        assert_eq!(window.size(), 100);

        window.consume(10).unwrap();
        assert_eq!(window.release(10), None);
    }
}
