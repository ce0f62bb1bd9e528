use crate::core::close_status::CloseStatus;
use crate::core::connection_state::{ConnectionState, Stats};
use crate::core::link::{ConnectionHandle, Link};
use crate::core::message::Message;
use crate::server::server::ServerContext;
use crate::traits::{EventHandler, Headers, Result};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::warn;

pub(crate) type ErrorCallback = Arc<dyn Fn(&ServerContext, &Session, &str) + Send + Sync>;
pub(crate) type EstablishCallback = Arc<dyn Fn(&ServerContext, &Session) + Send + Sync>;
pub(crate) type ReceiveCallback = Arc<dyn Fn(&ServerContext, &Session, Message) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&ServerContext, &Session, &CloseStatus) + Send + Sync>;
pub(crate) type NetworkFilter = Arc<dyn Fn(&ServerContext, SocketAddr) -> bool + Send + Sync>;
pub(crate) type ProtocolFilter = Arc<dyn Fn(&ServerContext, &Session) -> bool + Send + Sync>;

#[derive(Clone, Default)]
pub(crate) struct ServerCallbacks {
    pub(crate) on_error: Option<ErrorCallback>,
    pub(crate) on_establish: Option<EstablishCallback>,
    pub(crate) on_receive: Option<ReceiveCallback>,
    pub(crate) on_close: Option<CloseCallback>,
    pub(crate) on_filter_network: Option<NetworkFilter>,
    pub(crate) on_filter_protocol: Option<ProtocolFilter>,
}

/// Server-side view of one peer connection
///
/// Cheap to clone. Handshake headers become visible once the peer's upgrade
/// request has been read, which is before `on_filter_protocol` runs.
#[derive(Clone)]
pub struct Session {
    handle: ConnectionHandle,
    peer: SocketAddr,
}

impl Session {
    pub(crate) fn new(link: Arc<Link>, peer: SocketAddr) -> Self {
        Self {
            handle: ConnectionHandle::new(link),
            peer,
        }
    }

    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Peer IP address
    pub fn ip(&self) -> IpAddr {
        self.peer.ip()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Request headers from the peer's handshake
    pub fn headers(&self) -> Option<&Headers> {
        self.handle.headers()
    }

    /// Queue a message for this peer
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        self.handle.send(message)
    }

    /// Ask the loop to close this session; does not wait
    pub fn disconnect(&self, status: Option<CloseStatus>) {
        self.handle.close(status);
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    pub fn is_connected(&self) -> bool {
        self.handle.is_connected()
    }

    pub fn stats(&self) -> Stats {
        self.handle.stats()
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub(crate) fn link(&self) -> &Arc<Link> {
        &self.handle.link
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id())
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Routes one session's dispatcher events to the server callbacks
pub(crate) struct SessionEvents {
    pub(crate) ctx: ServerContext,
    pub(crate) session: Session,
    pub(crate) callbacks: ServerCallbacks,
}

impl EventHandler for SessionEvents {
    fn on_error(&mut self, message: &str) {
        match &self.callbacks.on_error {
            Some(cb) => cb(&self.ctx, &self.session, message),
            None => warn!(
                session = self.session.id(),
                peer = %self.session.peer_addr(),
                "Session error: {}",
                message
            ),
        }
    }

    fn on_establish(&mut self) {
        if let Some(cb) = &self.callbacks.on_establish {
            cb(&self.ctx, &self.session);
        }
    }

    fn on_receive(&mut self, message: Message) {
        if let Some(cb) = &self.callbacks.on_receive {
            cb(&self.ctx, &self.session, message);
        }
    }

    fn on_close(&mut self, status: &CloseStatus) {
        if let Some(cb) = &self.callbacks.on_close {
            cb(&self.ctx, &self.session, status);
        }
    }
}
