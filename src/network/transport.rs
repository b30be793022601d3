//! The message channel a session runs over.
//!
//! A [`Transport`] moves whole frames, in order and without loss; connection
//! setup and NAT traversal happen before one is handed to a session.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::LinkError;
use crate::input_queue::{CancellationToken, Wake};

/// An ordered, reliable, message-oriented connection to the peer.
///
/// `send` and `recv` may be called concurrently from different threads (the
/// tick driver sends inputs while the receive loop blocks in `recv`).
pub trait Transport: Send + Sync {
    /// Sends one frame.
    ///
    /// # Errors
    ///
    /// [`LinkError::Disconnected`] once the channel is closed, or an I/O error.
    fn send(&self, frame: &[u8]) -> Result<(), LinkError>;

    /// Receives the next frame, blocking until one arrives or `cancel` fires.
    ///
    /// # Errors
    ///
    /// [`LinkError::Cancelled`] when the token fires, [`LinkError::Disconnected`]
    /// once the peer has closed and every queued frame was delivered.
    fn recv(&self, cancel: &CancellationToken) -> Result<Vec<u8>, LinkError>;

    /// Shuts the connection down. Further sends fail; the peer sees
    /// [`LinkError::Disconnected`] once it has drained what was sent.
    fn close(&self) {}
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn send(&self, frame: &[u8]) -> Result<(), LinkError> {
        (**self).send(frame)
    }

    fn recv(&self, cancel: &CancellationToken) -> Result<Vec<u8>, LinkError> {
        (**self).recv(cancel)
    }

    fn close(&self) {
        (**self).close();
    }
}

#[derive(Debug, Default)]
struct Channel {
    frames: Mutex<ChannelState>,
    arrived: Condvar,
}

#[derive(Debug, Default)]
struct ChannelState {
    queue: VecDeque<Vec<u8>>,
    closed: bool,
}

impl Channel {
    fn close(&self) {
        self.frames.lock().closed = true;
        self.arrived.notify_all();
    }
}

impl Wake for Channel {
    fn wake(&self) {
        let _held = self.frames.lock();
        self.arrived.notify_all();
    }
}

/// One end of an in-process transport pair.
///
/// Useful for tests and for two sessions in one process.
///
/// ```
/// use rollback_link::{CancellationToken, MemoryTransport, Transport};
///
/// let (a, b) = MemoryTransport::pair();
/// a.send(b"hi").unwrap();
/// assert_eq!(b.recv(&CancellationToken::new()).unwrap(), b"hi");
/// ```
#[derive(Debug)]
pub struct MemoryTransport {
    incoming: Arc<Channel>,
    outgoing: Arc<Channel>,
}

impl MemoryTransport {
    /// Creates two connected ends.
    #[must_use]
    pub fn pair() -> (Self, Self) {
        let a_to_b = Arc::new(Channel::default());
        let b_to_a = Arc::new(Channel::default());
        (
            Self {
                incoming: Arc::clone(&b_to_a),
                outgoing: Arc::clone(&a_to_b),
            },
            Self {
                incoming: a_to_b,
                outgoing: b_to_a,
            },
        )
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        Transport::close(self);
    }
}

impl Transport for MemoryTransport {
    fn send(&self, frame: &[u8]) -> Result<(), LinkError> {
        let mut state = self.outgoing.frames.lock();
        if state.closed {
            return Err(LinkError::Disconnected);
        }
        state.queue.push_back(frame.to_vec());
        drop(state);
        self.outgoing.arrived.notify_all();
        Ok(())
    }

    fn recv(&self, cancel: &CancellationToken) -> Result<Vec<u8>, LinkError> {
        cancel.register(&self.incoming);
        let mut state = self.incoming.frames.lock();
        loop {
            if let Some(frame) = state.queue.pop_front() {
                return Ok(frame);
            }
            if state.closed {
                return Err(LinkError::Disconnected);
            }
            cancel.check()?;
            trace!("waiting for frame");
            cancel.wait(&self.incoming.arrived, &mut state);
        }
    }

    /// Closes both directions.
    fn close(&self) {
        self.outgoing.close();
        self.incoming.close();
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::error::CancelReason;
    use std::thread;
    use web_time::Duration;

    #[test]
    fn frames_arrive_in_order() {
        let (a, b) = MemoryTransport::pair();
        for i in 0..5u8 {
            a.send(&[i]).unwrap();
        }
        let token = CancellationToken::new();
        for i in 0..5u8 {
            assert_eq!(b.recv(&token).unwrap(), vec![i]);
        }
    }

    #[test]
    fn both_directions_are_independent() {
        let (a, b) = MemoryTransport::pair();
        a.send(b"ping").unwrap();
        b.send(b"pong").unwrap();
        let token = CancellationToken::new();
        assert_eq!(a.recv(&token).unwrap(), b"pong");
        assert_eq!(b.recv(&token).unwrap(), b"ping");
    }

    #[test]
    fn recv_times_out() {
        let (a, _b) = MemoryTransport::pair();
        let token = CancellationToken::with_timeout(Duration::from_millis(20));
        assert_eq!(
            a.recv(&token),
            Err(LinkError::Cancelled {
                reason: CancelReason::TimedOut
            })
        );
    }

    #[test]
    fn dropped_peer_disconnects_after_drain() {
        let (a, b) = MemoryTransport::pair();
        a.send(b"last").unwrap();
        drop(a);
        let token = CancellationToken::new();
        assert_eq!(b.recv(&token).unwrap(), b"last");
        assert_eq!(b.recv(&token), Err(LinkError::Disconnected));
        assert_eq!(b.send(b"x"), Err(LinkError::Disconnected));
    }

    #[test]
    fn blocked_recv_wakes_on_send() {
        let (a, b) = MemoryTransport::pair();
        let receiver = thread::spawn(move || {
            b.recv(&CancellationToken::with_timeout(Duration::from_secs(5)))
        });
        thread::sleep(std::time::Duration::from_millis(20));
        a.send(b"late").unwrap();
        assert_eq!(receiver.join().unwrap().unwrap(), b"late");
    }

    #[test]
    fn cancel_wakes_blocked_recv() {
        let (a, _b) = MemoryTransport::pair();
        let token = CancellationToken::new();
        let waiter = token.clone();
        let receiver = thread::spawn(move || a.recv(&waiter));
        thread::sleep(std::time::Duration::from_millis(20));
        token.cancel();
        assert_eq!(
            receiver.join().unwrap(),
            Err(LinkError::Cancelled {
                reason: CancelReason::Aborted
            })
        );
    }
}
