//! State shared between a connection's loop thread and application threads
//!
//! Application threads only touch the outbound queue, the close request slot,
//! the force flag and the wake signal. Everything else belongs to the
//! dispatcher on the loop thread.

use crate::core::close_status::CloseStatus;
use crate::core::connection_state::{AtomicConnectionState, AtomicStats, ConnectionState, Stats};
use crate::core::message::Message;
use crate::core::options::PendingSendPolicy;
use crate::core::queue::OutboundQueue;
use crate::traits::{Headers, Result, WsmuxError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

pub(crate) struct Link {
    id: u64,
    pub(crate) state: AtomicConnectionState,
    pub(crate) queue: OutboundQueue,
    pub(crate) stats: AtomicStats,
    close_request: Mutex<Option<CloseStatus>>,
    force_stop: AtomicBool,
    wake: Notify,
    policy: PendingSendPolicy,
    headers: OnceLock<Headers>,
}

impl Link {
    pub(crate) fn new(id: u64, policy: PendingSendPolicy) -> Self {
        Self {
            id,
            state: AtomicConnectionState::new(ConnectionState::Idle),
            queue: OutboundQueue::new(),
            stats: AtomicStats::new(),
            close_request: Mutex::new(None),
            force_stop: AtomicBool::new(false),
            wake: Notify::new(),
            policy,
            headers: OnceLock::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Enqueue for the loop thread and wake it
    ///
    /// The state is read again after the push: closing may begin in between,
    /// and a message that lands behind the close frame is never written.
    pub(crate) fn send(&self, message: Message) -> Result<()> {
        match self.state.get() {
            ConnectionState::Established => {}
            ConnectionState::Idle | ConnectionState::Connecting => {
                if self.policy == PendingSendPolicy::Reject {
                    return Err(WsmuxError::NotEstablished);
                }
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                return Err(WsmuxError::ConnectionClosed);
            }
        }
        self.queue.push(message);
        if matches!(
            self.state.get(),
            ConnectionState::Closing | ConnectionState::Closed
        ) {
            return Err(WsmuxError::ConnectionClosed);
        }
        self.wake.notify_one();
        Ok(())
    }

    /// Ask the loop to start the close handshake
    ///
    /// The first request wins; later ones are ignored.
    pub(crate) fn request_close(&self, status: Option<CloseStatus>) {
        if self.state.is_closed() {
            return;
        }
        {
            let mut slot = self.close_request.lock();
            if slot.is_none() {
                *slot = Some(status.unwrap_or_default());
            }
        }
        self.wake.notify_one();
    }

    /// Tear down without waiting for the peer
    pub(crate) fn force(&self) {
        self.force_stop.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_request.lock().is_some()
    }

    pub(crate) fn take_close_request(&self) -> Option<CloseStatus> {
        self.close_request.lock().take()
    }

    pub(crate) fn force_requested(&self) -> bool {
        self.force_stop.load(Ordering::Acquire)
    }

    /// Resolves once an application thread signalled this connection
    pub(crate) async fn woken(&self) {
        self.wake.notified().await;
    }

    pub(crate) fn set_headers(&self, headers: Headers) {
        let _ = self.headers.set(headers);
    }

    pub(crate) fn headers(&self) -> Option<&Headers> {
        self.headers.get()
    }
}

/// Cloneable application-side handle to one connection
///
/// Passed to every callback. All methods are non-blocking and safe to call
/// from any thread, including from inside a callback.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub(crate) link: Arc<Link>,
}

impl ConnectionHandle {
    pub(crate) fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Connection id, unique within the owning client or server
    pub fn id(&self) -> u64 {
        self.link.id()
    }

    /// Queue a message for transmission
    ///
    /// Fails with `ConnectionClosed` once closing has begun, and with
    /// `NotEstablished` before the handshake when the pending-send policy is
    /// `Reject`. `Ok` means the message was queued before closing began; queued
    /// messages still unsent when the close frame goes out are discarded.
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.link.send(message.into())
    }

    /// Request a close handshake without waiting for it
    pub fn close(&self, status: Option<CloseStatus>) {
        self.link.request_close(status);
    }

    pub fn state(&self) -> ConnectionState {
        self.link.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.link.state.is_connected()
    }

    pub fn stats(&self) -> Stats {
        self.link.stats.snapshot()
    }

    /// Handshake headers: the response for a client, the request for a session
    pub fn headers(&self) -> Option<&Headers> {
        self.link.headers()
    }

    /// Messages waiting to be written
    pub fn pending(&self) -> usize {
        self.link.queue.len()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
