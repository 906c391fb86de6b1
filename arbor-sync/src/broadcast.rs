//! Fan-out of encoded events to every signed-on participation.
//!
//! Uses a tokio broadcast channel: each participation holds its own
//! receiver buffering up to `capacity` frames. An event is encoded once and
//! shared by all receivers. A receiver that falls further behind than
//! `capacity` sees `RecvError::Lagged` and has to be dropped by its owner,
//! since the events it missed cannot be replayed.
//!
//! The originator of a command receives its own event as well; filtering
//! that echo is the client's job.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::protocol::{Event, Message, ProtocolError};

/// One encoded event frame.
pub type Frame = Arc<String>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    pub subscribers: usize,
}

pub struct EventBroadcast {
    sender: broadcast::Sender<Frame>,
    capacity: usize,
    events_sent: AtomicU64,
}

impl EventBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity,
            events_sent: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Frame> {
        self.sender.subscribe()
    }

    /// Encode `event` and send it to every current subscriber.
    ///
    /// Returns the number of receivers reached; zero when nobody is signed
    /// on, which is not an error.
    pub fn broadcast(&self, event: &Event) -> Result<usize, ProtocolError> {
        let frame = Message::Event(event.clone()).encode()?;
        Ok(self.broadcast_raw(Arc::new(frame)))
    }

    /// Send an already encoded frame.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.events_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.events_sent.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
