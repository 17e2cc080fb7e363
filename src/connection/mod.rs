//! # Connection Handles
//!
//! A [`ConnectionHandle`] is the transport-independent view of one duplex
//! socket: its lifecycle state plus a queue feeding the task that owns the
//! socket's write half. The relay keeps handles in its registries, and the
//! attach adapter and host agent send through them.
//!
//! Frames queued on a handle are written by exactly one writer task, so a
//! sender never waits on another connection's socket.

pub mod client;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Outbound queue depth per connection
pub const OUTBOUND_CAPACITY: usize = 1024;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a socket, mirroring the WebSocket `readyState` values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReadyState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ReadyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReadyState::Connecting,
            1 => ReadyState::Open,
            2 => ReadyState::Closing,
            _ => ReadyState::Closed,
        }
    }
}

/// Ready state shared between a handle and the task driving its socket
#[derive(Debug, Clone)]
pub struct SharedState(Arc<AtomicU8>);

impl SharedState {
    pub fn new(initial: ReadyState) -> Self {
        Self(Arc::new(AtomicU8::new(initial as u8)))
    }

    pub fn get(&self) -> ReadyState {
        ReadyState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, state: ReadyState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves to `Closing` unless the socket is already fully closed.
    pub fn begin_close(&self) {
        let _ = self
            .0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current != ReadyState::Closed as u8).then_some(ReadyState::Closing as u8)
            });
    }
}

/// A single transport frame.
///
/// `Text` carries the JSON event envelope, `Binary` the raw byte channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// Cloneable handle to one live connection
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    serial: u64,
    state: SharedState,
    tx: mpsc::Sender<Frame>,
    connected_at: DateTime<Utc>,
}

impl ConnectionHandle {
    /// Creates a handle in `initial` state and the receiver its writer task drains.
    pub fn with_state(initial: ReadyState, capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity);
        let handle = Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            state: SharedState::new(initial),
            tx,
            connected_at: Utc::now(),
        };
        (handle, rx)
    }

    /// Creates a handle for an already-open socket.
    pub fn open(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        Self::with_state(ReadyState::Open, capacity)
    }

    /// Process-unique number distinguishing this connection from others
    /// registered under the same identifier
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.serial == other.serial
    }

    pub fn state(&self) -> ReadyState {
        self.state.get()
    }

    pub fn set_state(&self, state: ReadyState) {
        self.state.set(state);
    }

    pub fn shared_state(&self) -> SharedState {
        self.state.clone()
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Best-effort send. Returns whether the frame was queued.
    ///
    /// Never blocks. A handle that is not open, or whose queue is full or
    /// gone, drops the frame.
    pub fn send(&self, frame: Frame) -> bool {
        let state = self.state();
        if state != ReadyState::Open {
            trace!(
                "Dropping frame for connection {} in state {:?}",
                self.serial, state
            );
            return false;
        }

        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue full for connection {}, dropping frame",
                    self.serial
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.state.set(ReadyState::Closed);
                false
            }
        }
    }

    /// Queues a frame, waiting for room instead of dropping it.
    ///
    /// For producers running on a blocking thread that must not lose output.
    /// Must not be called from an async context.
    pub fn send_blocking(&self, frame: Frame) -> bool {
        if self.state() != ReadyState::Open {
            return false;
        }
        if self.tx.blocking_send(frame).is_err() {
            self.state.set(ReadyState::Closed);
            return false;
        }
        true
    }

    /// Asks the writer task to send a close frame. Repeated calls are no-ops.
    pub fn close(&self) {
        if matches!(self.state(), ReadyState::Closing | ReadyState::Closed) {
            return;
        }
        self.state.begin_close();
        let _ = self.tx.try_send(Frame::Close);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_queues_only_when_open() {
        let (handle, mut rx) = ConnectionHandle::with_state(ReadyState::Connecting, 8);
        assert!(!handle.send(Frame::Text("a".into())));

        handle.set_state(ReadyState::Open);
        assert!(handle.send(Frame::Text("b".into())));
        assert_eq!(rx.try_recv().unwrap(), Frame::Text("b".into()));

        handle.set_state(ReadyState::Closing);
        assert!(!handle.send(Frame::Text("c".into())));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn send_after_receiver_dropped_marks_closed() {
        let (handle, rx) = ConnectionHandle::open(8);
        drop(rx);
        assert!(!handle.send(Frame::Binary(vec![1, 2, 3])));
        assert_eq!(handle.state(), ReadyState::Closed);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        let (handle, _rx) = ConnectionHandle::open(1);
        assert!(handle.send(Frame::Text("first".into())));
        assert!(!handle.send(Frame::Text("second".into())));
        assert_eq!(handle.state(), ReadyState::Open);
    }

    #[tokio::test]
    async fn blocking_send_waits_for_room() {
        let (handle, mut rx) = ConnectionHandle::open(1);
        assert!(handle.send(Frame::Text("first".into())));

        let producer = handle.clone();
        let second = tokio::task::spawn_blocking(move || {
            producer.send_blocking(Frame::Text("second".into()))
        });

        assert_eq!(rx.recv().await.unwrap(), Frame::Text("first".into()));
        assert!(second.await.unwrap());
        assert_eq!(rx.recv().await.unwrap(), Frame::Text("second".into()));
    }

    #[test]
    fn blocking_send_skips_sockets_that_are_not_open() {
        let (handle, mut rx) = ConnectionHandle::with_state(ReadyState::Closing, 1);
        assert!(!handle.send_blocking(Frame::Text("late".into())));
        assert!(rx.try_recv().is_err());

        let (handle, rx) = ConnectionHandle::open(1);
        drop(rx);
        assert!(!handle.send_blocking(Frame::Text("gone".into())));
        assert_eq!(handle.state(), ReadyState::Closed);
    }

    #[test]
    fn close_is_idempotent() {
        let (handle, mut rx) = ConnectionHandle::open(8);
        handle.close();
        handle.close();
        assert_eq!(handle.state(), ReadyState::Closing);
        assert_eq!(rx.try_recv().unwrap(), Frame::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn begin_close_never_reopens_a_closed_socket() {
        let state = SharedState::new(ReadyState::Closed);
        state.begin_close();
        assert_eq!(state.get(), ReadyState::Closed);
    }

    #[test]
    fn clones_share_identity_and_state() {
        let (a, _rx) = ConnectionHandle::open(8);
        let (b, _rx2) = ConnectionHandle::open(8);
        let a2 = a.clone();
        assert!(a.same_connection(&a2));
        assert!(!a.same_connection(&b));

        a2.set_state(ReadyState::Closed);
        assert_eq!(a.state(), ReadyState::Closed);
    }
}
