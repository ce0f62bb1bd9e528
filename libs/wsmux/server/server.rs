use crate::core::close_status::CloseStatus;
use crate::core::config::{capture_headers, ConnectionConfig};
use crate::core::dispatcher::Dispatcher;
use crate::core::event_loop::{drive, DriveSettings};
use crate::core::link::Link;
use crate::core::message::Message;
use crate::core::options::{PendingSendPolicy, ServerOptions};
use crate::server::session::{ServerCallbacks, Session, SessionEvents};
use crate::traits::handler::guarded;
use crate::traits::{Headers, Result, WsmuxError};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{self, StatusCode};
use tracing::{debug, error, info, warn};

/// Extra wait on top of the close timeout when draining sessions
const STOP_MARGIN: Duration = Duration::from_millis(250);
/// How long forced teardown may take before giving up on a clean drain
const FORCE_GRACE: Duration = Duration::from_secs(1);
/// Upper bound on reading a peer's upgrade request
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a failed accept so a persistent error does not spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// State shared by the loop thread, every session task and application threads
pub(crate) struct ServerShared {
    sessions: Mutex<HashMap<u64, Session>>,
    /// Signalled whenever a session leaves the map
    drained: Condvar,
    stopping: AtomicBool,
    shutdown: Notify,
    next_id: AtomicU64,
    /// Upgrades accepted whose session task has not ended yet
    slots: AtomicUsize,
    local_addr: SocketAddr,
}

impl ServerShared {
    pub(crate) fn new(local_addr: SocketAddr) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            drained: Condvar::new(),
            stopping: AtomicBool::new(false),
            shutdown: Notify::new(),
            next_id: AtomicU64::new(0),
            slots: AtomicUsize::new(0),
            local_addr,
        }
    }

    /// Track an established session; asks it to close if the server is stopping
    fn insert(&self, session: Session) {
        let mut sessions = self.sessions.lock();
        if self.stopping.load(Ordering::SeqCst) {
            session.disconnect(Some(CloseStatus::going_away()));
        }
        sessions.insert(session.id(), session);
    }

    fn remove(&self, id: u64) {
        let mut sessions = self.sessions.lock();
        sessions.remove(&id);
        self.drained.notify_all();
    }

    /// Block until no sessions remain or `deadline` passes
    fn wait_drained(&self, deadline: Instant) -> bool {
        let mut sessions = self.sessions.lock();
        while !sessions.is_empty() {
            if self.drained.wait_until(&mut sessions, deadline).timed_out() {
                return sessions.is_empty();
            }
        }
        true
    }
}

/// One place under `max_sessions`, held from the upgrade until the task ends
///
/// Taken inside the handshake callback so concurrent upgrades cannot all see
/// room before any of them is inserted.
struct SessionSlot {
    shared: Arc<ServerShared>,
}

impl SessionSlot {
    fn reserve(shared: &Arc<ServerShared>, max: usize) -> Option<Self> {
        shared
            .slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |taken| {
                (taken < max).then_some(taken + 1)
            })
            .ok()?;
        Some(Self {
            shared: Arc::clone(shared),
        })
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.shared.slots.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Removes a session from the map when its task ends, aborted or not
struct SessionGuard {
    shared: Arc<ServerShared>,
    id: u64,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.shared.remove(self.id);
    }
}

/// Cloneable view of a running server, handed to every server callback
#[derive(Clone)]
pub struct ServerContext {
    shared: Arc<ServerShared>,
}

impl ServerContext {
    pub(crate) fn new(shared: Arc<ServerShared>) -> Self {
        Self { shared }
    }

    /// Queue `message` on every established session
    ///
    /// Returns the number of sessions that accepted it.
    pub fn send(&self, message: impl Into<Message>) -> usize {
        let message = message.into();
        let sessions = self.shared.sessions.lock();
        let mut count = 0;

        for (id, session) in sessions.iter() {
            if session.is_connected() {
                match session.send(message.clone()) {
                    Ok(()) => count += 1,
                    Err(e) => warn!(session = id, "Failed to broadcast: {}", e),
                }
            }
        }

        count
    }

    /// Queue `message` on one session
    pub fn send_to(&self, id: u64, message: impl Into<Message>) -> Result<()> {
        let session = self.session(id).ok_or(WsmuxError::NotConnected)?;
        session.send(message)
    }

    pub fn session(&self, id: u64) -> Option<Session> {
        self.shared.sessions.lock().get(&id).cloned()
    }

    /// Snapshot of the tracked sessions
    pub fn sessions(&self) -> Vec<Session> {
        self.shared.sessions.lock().values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().len()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }
}

/// Handshake settings shared by all session tasks
struct AcceptSettings {
    drive: DriveSettings,
    protocol: Option<String>,
    response_headers: Headers,
    max_sessions: Option<usize>,
}

struct RunningServer {
    ctx: ServerContext,
    thread: JoinHandle<()>,
    close_timeout: Duration,
}

/// Multi-session WebSocket server
///
/// All sessions share one loop thread. Callbacks fire on that thread with the
/// originating [`Session`].
pub struct Server {
    config: ConnectionConfig,
    options: ServerOptions,
    callbacks: ServerCallbacks,
    running: Option<RunningServer>,
}

impl Server {
    pub fn new() -> Self {
        let options = ServerOptions::default();
        let mut config = ConnectionConfig::new();
        config.host = options.host.clone();
        config.port = Some(options.port);
        Self {
            config,
            options,
            callbacks: ServerCallbacks::default(),
            running: None,
        }
    }

    pub fn set_host(&mut self, host: impl Into<String>) -> &mut Self {
        self.config.host = host.into();
        self
    }

    /// Listen port; 0 picks an ephemeral port, see [`local_addr`](Self::local_addr)
    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.config.port = Some(port);
        self
    }

    /// Subprotocol accepted when a client offers it
    pub fn set_protocol(&mut self, protocol: impl Into<String>) -> &mut Self {
        self.config.protocol = Some(protocol.into());
        self
    }

    /// Extra header added to every handshake response
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.config.headers.insert(name, value);
        self
    }

    /// Apply runtime options, including host, port and protocol
    pub fn set_options(&mut self, options: ServerOptions) -> &mut Self {
        self.config.host = options.host.clone();
        self.config.port = Some(options.port);
        if options.protocol.is_some() {
            self.config.protocol = options.protocol.clone();
        }
        self.options = options;
        self
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn on_error<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ServerContext, &Session, &str) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_establish<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ServerContext, &Session) + Send + Sync + 'static,
    {
        self.callbacks.on_establish = Some(Arc::new(f));
        self
    }

    pub fn on_receive<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ServerContext, &Session, Message) + Send + Sync + 'static,
    {
        self.callbacks.on_receive = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ServerContext, &Session, &CloseStatus) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Decide on a peer before any bytes are read; `false` drops the socket
    pub fn on_filter_network<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ServerContext, SocketAddr) -> bool + Send + Sync + 'static,
    {
        self.callbacks.on_filter_network = Some(Arc::new(f));
        self
    }

    /// Decide on a peer once its handshake headers are known; `false` answers 403
    pub fn on_filter_protocol<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ServerContext, &Session) -> bool + Send + Sync + 'static,
    {
        self.callbacks.on_filter_protocol = Some(Arc::new(f));
        self
    }

    /// Bind and start the loop thread
    ///
    /// Binding happens on the calling thread, so address errors are returned
    /// here. Returns the bound address.
    pub fn start(&mut self) -> Result<SocketAddr> {
        self.reap();
        if self.running.is_some() {
            return Err(WsmuxError::AlreadyRunning);
        }

        let port = self.config.port.unwrap_or(self.options.port);
        let listener = std::net::TcpListener::bind((self.config.host.as_str(), port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let ctx = ServerContext::new(Arc::new(ServerShared::new(local_addr)));
        let settings = Arc::new(AcceptSettings {
            drive: DriveSettings {
                close_timeout: self.options.close_timeout(),
                keepalive: self.options.keepalive,
            },
            protocol: self.config.protocol.clone(),
            response_headers: self.config.headers.clone(),
            max_sessions: self.options.max_sessions,
        });
        let callbacks = self.callbacks.clone();

        let thread = {
            let ctx = ctx.clone();
            std::thread::Builder::new()
                .name("wsmux-server".to_string())
                .spawn(move || {
                    runtime.block_on(accept_loop(listener, ctx, callbacks, settings));
                })?
        };

        info!(addr = %local_addr, "Server listening");
        self.running = Some(RunningServer {
            ctx,
            thread,
            close_timeout: self.options.close_timeout(),
        });
        Ok(local_addr)
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.ctx.local_addr())
    }

    /// Context handle while running
    pub fn context(&self) -> Option<ServerContext> {
        self.running.as_ref().map(|r| r.ctx.clone())
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Broadcast to every established session; returns how many were reached
    pub fn send(&self, message: impl Into<Message>) -> usize {
        match &self.running {
            Some(running) => running.ctx.send(message),
            None => 0,
        }
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.running
            .as_ref()
            .map(|r| r.ctx.sessions())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.running
            .as_ref()
            .map(|r| r.ctx.session_count())
            .unwrap_or(0)
    }

    /// Close every session with GOING_AWAY, wait for them to drain, then join
    ///
    /// Sessions that do not finish their close handshake within the close
    /// timeout are torn down. Calling it again is a no-op.
    pub fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        let shared = &running.ctx.shared;

        shared.stopping.store(true, Ordering::SeqCst);
        shared.shutdown.notify_one();
        let count = {
            let sessions = shared.sessions.lock();
            for session in sessions.values() {
                session.disconnect(Some(CloseStatus::going_away()));
            }
            sessions.len()
        };
        info!(sessions = count, "Stopping server");

        let deadline = Instant::now() + running.close_timeout + STOP_MARGIN;
        if !shared.wait_drained(deadline) {
            let remaining = running.ctx.sessions();
            warn!(remaining = remaining.len(), "Sessions did not close in time, forcing teardown");
            for session in &remaining {
                session.link().force();
            }
            if !shared.wait_drained(Instant::now() + FORCE_GRACE) {
                error!("Sessions still tracked after forced teardown");
            }
        }

        if running.thread.join().is_err() {
            error!("Server loop thread panicked");
        }
        info!("Server stopped");
    }

    /// Join a loop thread that exited on its own
    fn reap(&mut self) {
        let finished = self
            .running
            .as_ref()
            .map(|r| r.thread.is_finished())
            .unwrap_or(false);
        if finished {
            if let Some(running) = self.running.take() {
                if running.thread.join().is_err() {
                    error!("Server loop thread panicked");
                }
            }
        }
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(
    listener: std::net::TcpListener,
    ctx: ServerContext,
    callbacks: ServerCallbacks,
    settings: Arc<AcceptSettings>,
) {
    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to register listener: {}", e);
            return;
        }
    };
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = ctx.shared.shutdown.notified() => {
                debug!("Accept loop received shutdown");
                break;
            }

            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        if ctx.is_stopping() {
                            continue;
                        }
                        let allowed = match &callbacks.on_filter_network {
                            Some(filter) => guarded("on_filter_network", || filter(&ctx, peer)).unwrap_or(false),
                            None => true,
                        };
                        if !allowed {
                            debug!(peer = %peer, "Connection refused by network filter");
                            continue;
                        }
                        tasks.spawn(serve_peer(
                            stream,
                            peer,
                            ctx.clone(),
                            callbacks.clone(),
                            Arc::clone(&settings),
                        ));
                    }
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!("Session task panicked");
                    }
                }
            }
        }
    }

    drop(listener);
    let grace = settings.drive.close_timeout + STOP_MARGIN;
    let drain = async { while tasks.join_next().await.is_some() {} };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!(remaining = tasks.len(), "Session tasks still running, aborting");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }
    info!("Server loop finished");
}

/// Outcome of the handshake callback, used to tell refusals from failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Accepted,
    Full,
    Vetoed,
}

async fn serve_peer(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ServerContext,
    callbacks: ServerCallbacks,
    settings: Arc<AcceptSettings>,
) {
    let id = ctx.shared.next_id.fetch_add(1, Ordering::Relaxed) + 1;
    let link = Arc::new(Link::new(id, PendingSendPolicy::Queue));
    let session = Session::new(Arc::clone(&link), peer);
    let mut dispatcher = Dispatcher::new(
        link,
        SessionEvents {
            ctx: ctx.clone(),
            session: session.clone(),
            callbacks: callbacks.clone(),
        },
    );
    dispatcher.begin_connect();
    debug!(session = id, peer = %peer, "Accepted connection");

    let mut verdict = Verdict::Accepted;
    let mut slot: Option<SessionSlot> = None;
    let handshake = {
        let ctx = &ctx;
        let session = &session;
        let callbacks = &callbacks;
        let settings = &settings;
        let verdict = &mut verdict;
        let slot = &mut slot;
        accept_hdr_async(
            stream,
            move |request: &Request, mut response: Response| -> std::result::Result<Response, ErrorResponse> {
                session.link().set_headers(capture_headers(request.headers()));

                if let Some(max) = settings.max_sessions {
                    match SessionSlot::reserve(&ctx.shared, max) {
                        Some(reserved) => *slot = Some(reserved),
                        None => {
                            *verdict = Verdict::Full;
                            return Err(reject(StatusCode::SERVICE_UNAVAILABLE, "session limit reached"));
                        }
                    }
                }
                if let Some(filter) = &callbacks.on_filter_protocol {
                    if !guarded("on_filter_protocol", || filter(ctx, session)).unwrap_or(false) {
                        *slot = None;
                        *verdict = Verdict::Vetoed;
                        return Err(reject(StatusCode::FORBIDDEN, "connection refused"));
                    }
                }

                negotiate_protocol(request, &mut response, settings.protocol.as_deref());
                add_response_headers(&mut response, &settings.response_headers);
                Ok(response)
            },
        )
    };

    let outcome = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake).await;
    let ws = match outcome {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            match verdict {
                Verdict::Accepted => {
                    warn!(session = id, peer = %peer, "Handshake failed: {}", e);
                    dispatcher.on_connect_error(&format!("handshake failed: {}", e));
                }
                Verdict::Full => {
                    info!(session = id, peer = %peer, "Refused: session limit reached");
                    dispatcher.on_rejected();
                }
                Verdict::Vetoed => {
                    debug!(session = id, peer = %peer, "Refused by protocol filter");
                    dispatcher.on_rejected();
                }
            }
            return;
        }
        Err(_) => {
            warn!(session = id, peer = %peer, "Handshake timed out");
            dispatcher.on_connect_error("handshake timed out");
            return;
        }
    };

    // Released when this task ends, after the guard below removes the session
    let _slot = slot;
    ctx.shared.insert(session.clone());
    let _guard = SessionGuard {
        shared: Arc::clone(&ctx.shared),
        id,
    };
    info!(session = id, peer = %peer, "Session established");

    let headers = session.headers().cloned().unwrap_or_default();
    drive(ws, &mut dispatcher, headers, settings.drive).await;
    debug!(session = id, "Session finished");
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Echo the configured subprotocol if the client offered it
fn negotiate_protocol(request: &Request, response: &mut Response, protocol: Option<&str>) {
    let Some(protocol) = protocol else {
        return;
    };
    let offered = request
        .headers()
        .get_all(http::header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|p| p.trim() == protocol);
    if !offered {
        return;
    }
    if let Ok(value) = protocol.parse::<http::header::HeaderValue>() {
        response
            .headers_mut()
            .insert(http::header::SEC_WEBSOCKET_PROTOCOL, value);
    }
}

fn add_response_headers(response: &mut Response, headers: &Headers) {
    for (name, value) in headers.iter() {
        match (
            name.parse::<http::header::HeaderName>(),
            value.parse::<http::header::HeaderValue>(),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!("Skipping invalid response header '{}'", name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection_state::ConnectionState;

    fn established_session(shared: &ServerShared, id: u64) -> Session {
        let link = Arc::new(Link::new(id, PendingSendPolicy::Queue));
        link.state.set(ConnectionState::Established);
        let session = Session::new(link, "127.0.0.1:50000".parse().unwrap());
        shared.insert(session.clone());
        session
    }

    #[test]
    fn test_broadcast_reaches_every_established_session() {
        let shared = Arc::new(ServerShared::new("127.0.0.1:0".parse().unwrap()));
        let ctx = ServerContext::new(Arc::clone(&shared));
        let a = established_session(&shared, 1);
        let b = established_session(&shared, 2);

        let reached = ctx.send(Message::binary(vec![0x01, 0x02]));
        assert_eq!(reached, 2);

        let from_a = a.link().queue.pop().unwrap();
        let from_b = b.link().queue.pop().unwrap();
        assert_eq!(from_a, from_b);
        assert_eq!(from_a.as_binary().unwrap(), &[0x01, 0x02]);
    }

    #[test]
    fn test_broadcast_skips_sessions_not_established() {
        let shared = Arc::new(ServerShared::new("127.0.0.1:0".parse().unwrap()));
        let ctx = ServerContext::new(Arc::clone(&shared));
        let open = established_session(&shared, 1);
        let closing = established_session(&shared, 2);
        closing.link().state.set(ConnectionState::Closing);

        assert_eq!(ctx.send(Message::text("hi")), 1);
        assert_eq!(open.link().queue.len(), 1);
        assert!(closing.link().queue.is_empty());
    }

    #[test]
    fn test_guard_removal_wakes_drain_waiters() {
        let shared = Arc::new(ServerShared::new("127.0.0.1:0".parse().unwrap()));
        established_session(&shared, 7);
        assert!(!shared.wait_drained(Instant::now() + Duration::from_millis(10)));

        let remover = {
            let shared = Arc::clone(&shared);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                drop(SessionGuard { shared, id: 7 });
            })
        };
        assert!(shared.wait_drained(Instant::now() + Duration::from_secs(5)));
        remover.join().unwrap();
    }

    #[test]
    fn test_session_slots_cap_and_release() {
        let shared = Arc::new(ServerShared::new("127.0.0.1:0".parse().unwrap()));
        let first = SessionSlot::reserve(&shared, 2).unwrap();
        let second = SessionSlot::reserve(&shared, 2).unwrap();
        assert!(SessionSlot::reserve(&shared, 2).is_none());
        assert_eq!(shared.slots.load(Ordering::SeqCst), 2);

        drop(first);
        let third = SessionSlot::reserve(&shared, 2);
        assert!(third.is_some());
        drop((second, third));
        assert_eq!(shared.slots.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_session_slots_race_to_the_cap() {
        let shared = Arc::new(ServerShared::new("127.0.0.1:0".parse().unwrap()));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let (tx, rx) = std::sync::mpsc::channel();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let shared = Arc::clone(&shared);
                let barrier = Arc::clone(&barrier);
                let tx = tx.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    tx.send(SessionSlot::reserve(&shared, 3)).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        drop(tx);
        let held: Vec<_> = rx.into_iter().flatten().collect();
        assert_eq!(held.len(), 3);
        assert_eq!(shared.slots.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_insert_while_stopping_requests_close() {
        let shared = ServerShared::new("127.0.0.1:0".parse().unwrap());
        shared.stopping.store(true, Ordering::SeqCst);
        let session = established_session(&shared, 3);
        assert!(session.link().close_requested());
    }

    #[test]
    fn test_start_reports_bind_errors() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut server = Server::new();
        server.set_host("127.0.0.1").set_port(port);
        assert!(matches!(server.start(), Err(WsmuxError::Io(_))));
        assert!(!server.is_running());
    }
}
