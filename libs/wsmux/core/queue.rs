//! Per-connection outbound message queue
//!
//! Any application thread may push; only the loop thread pops. Backed by an
//! unbounded crossbeam channel, so ordering is the order in which pushes
//! linearize and a push never blocks.

use crate::core::message::Message;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};

/// Thread-safe FIFO of outbound messages
pub struct OutboundQueue {
    tx: Sender<Message>,
    rx: Receiver<Message>,
}

impl OutboundQueue {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Append a message to the tail
    pub fn push(&self, message: Message) {
        // Both ends live in self, so the channel cannot be disconnected here
        let _ = self.tx.send(message);
    }

    /// Remove the head, if any
    pub(crate) fn pop(&self) -> Option<Message> {
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Drop every queued message, returning how many were discarded
    pub(crate) fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OutboundQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundQueue")
            .field("len", &self.len())
            .finish()
    }
}
