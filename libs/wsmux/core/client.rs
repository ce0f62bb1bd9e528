use crate::core::close_status::CloseStatus;
use crate::core::config::{capture_headers, BindInterface, ConnectionConfig};
use crate::core::connection_state::{ConnectionState, Stats};
use crate::core::dispatcher::Dispatcher;
use crate::core::event_loop::{drive, DriveSettings};
use crate::core::link::{ConnectionHandle, Link};
use crate::core::message::Message;
use crate::core::options::ClientOptions;
use crate::traits::{EventHandler, Headers, Result, WsmuxError};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::{client_async_tls, connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Extra wait on top of the close timeout before forcing teardown
const STOP_MARGIN: Duration = Duration::from_millis(250);
/// How long a forced teardown may take before the thread is detached
const FORCE_GRACE: Duration = Duration::from_secs(1);

type ErrorCallback = Arc<dyn Fn(&ConnectionHandle, &str) + Send + Sync>;
type EstablishCallback = Arc<dyn Fn(&ConnectionHandle) + Send + Sync>;
type ReceiveCallback = Arc<dyn Fn(&ConnectionHandle, Message) + Send + Sync>;
type CloseCallback = Arc<dyn Fn(&ConnectionHandle, &CloseStatus) + Send + Sync>;

#[derive(Clone, Default)]
struct ClientCallbacks {
    on_error: Option<ErrorCallback>,
    on_establish: Option<EstablishCallback>,
    on_receive: Option<ReceiveCallback>,
    on_close: Option<CloseCallback>,
}

/// Routes dispatcher events to the registered closures
struct ClientEvents {
    handle: ConnectionHandle,
    callbacks: ClientCallbacks,
}

impl EventHandler for ClientEvents {
    fn on_error(&mut self, message: &str) {
        match &self.callbacks.on_error {
            Some(cb) => cb(&self.handle, message),
            None => warn!(conn = self.handle.id(), "Client error: {}", message),
        }
    }

    fn on_establish(&mut self) {
        if let Some(cb) = &self.callbacks.on_establish {
            cb(&self.handle);
        }
    }

    fn on_receive(&mut self, message: Message) {
        if let Some(cb) = &self.callbacks.on_receive {
            cb(&self.handle, message);
        }
    }

    fn on_close(&mut self, status: &CloseStatus) {
        if let Some(cb) = &self.callbacks.on_close {
            cb(&self.handle, status);
        }
    }
}

struct Running {
    thread: JoinHandle<()>,
    /// Disconnects when the loop thread exits
    done: Receiver<()>,
    close_timeout: Duration,
}

/// WebSocket client with a background event loop
///
/// Configure with the setters, register callbacks, then `connect()`. The
/// handshake and all I/O run on a dedicated thread; callbacks fire on that
/// thread. `send()` may be called from any thread once connecting.
///
/// Dropping an active client performs `disconnect(None)`.
pub struct Client {
    config: ConnectionConfig,
    options: ClientOptions,
    callbacks: ClientCallbacks,
    next_id: u64,
    handle: Option<ConnectionHandle>,
    running: Option<Running>,
}

impl Client {
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::new(),
            options: ClientOptions::default(),
            callbacks: ClientCallbacks::default(),
            next_id: 0,
            handle: None,
            running: None,
        }
    }

    /// Replace scheme, host, port and path from a URL
    pub fn set_url(&mut self, url: &str) -> Result<&mut Self> {
        self.config.set_url(url)?;
        Ok(self)
    }

    pub fn set_scheme(&mut self, scheme: impl Into<String>) -> &mut Self {
        self.config.scheme = scheme.into().to_ascii_lowercase();
        self
    }

    pub fn set_host(&mut self, host: impl Into<String>) -> &mut Self {
        self.config.host = host.into();
        self
    }

    pub fn set_port(&mut self, port: u16) -> &mut Self {
        self.config.port = Some(port);
        self
    }

    pub fn set_path(&mut self, path: impl Into<String>) -> &mut Self {
        self.config.path = path.into();
        self
    }

    /// Subprotocol offered in `Sec-WebSocket-Protocol`
    pub fn set_protocol(&mut self, protocol: impl Into<String>) -> &mut Self {
        self.config.protocol = Some(protocol.into());
        self
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.config.headers.insert(name, value);
        self
    }

    pub fn set_cookie(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.config.cookies.insert(name, value);
        self
    }

    /// Local address or device the socket binds to before connecting
    pub fn set_interface(&mut self, interface: impl Into<BindInterface>) -> &mut Self {
        self.config.interface = Some(interface.into());
        self
    }

    /// Apply runtime options; a configured URL replaces the target
    pub fn set_options(&mut self, options: ClientOptions) -> Result<&mut Self> {
        if let Some(url) = &options.url {
            self.config.set_url(url)?;
        }
        self.options = options;
        Ok(self)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn on_error<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ConnectionHandle, &str) + Send + Sync + 'static,
    {
        self.callbacks.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_establish<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ConnectionHandle) + Send + Sync + 'static,
    {
        self.callbacks.on_establish = Some(Arc::new(f));
        self
    }

    pub fn on_receive<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ConnectionHandle, Message) + Send + Sync + 'static,
    {
        self.callbacks.on_receive = Some(Arc::new(f));
        self
    }

    pub fn on_close<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(&ConnectionHandle, &CloseStatus) + Send + Sync + 'static,
    {
        self.callbacks.on_close = Some(Arc::new(f));
        self
    }

    /// Start connecting in the background
    ///
    /// Returns as soon as the loop thread is running; the outcome arrives
    /// through `on_establish` or `on_error`. Configuration and callbacks are
    /// captured now.
    pub fn connect(&mut self) -> Result<()> {
        self.reap();
        if self.running.is_some() {
            return Err(WsmuxError::AlreadyRunning);
        }

        self.next_id += 1;
        let id = self.next_id;
        let config = self.config.clone();
        let settings = DriveSettings {
            close_timeout: self.options.close_timeout(),
            keepalive: self.options.keepalive,
        };

        let link = Arc::new(Link::new(id, self.options.pending_send));
        let handle = ConnectionHandle::new(Arc::clone(&link));
        let events = ClientEvents {
            handle: handle.clone(),
            callbacks: self.callbacks.clone(),
        };
        let mut dispatcher = Dispatcher::new(link, events);
        dispatcher.begin_connect();

        info!(conn = id, url = %config.url(), "Connecting");
        let (done_tx, done_rx) = bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name(format!("wsmux-client-{}", id))
            .spawn(move || {
                let _done = done_tx;
                run_client(config, settings, dispatcher);
            })?;

        self.handle = Some(handle);
        self.running = Some(Running {
            thread,
            done: done_rx,
            close_timeout: settings.close_timeout,
        });
        Ok(())
    }

    /// `set_url` followed by `connect`
    pub fn connect_url(&mut self, url: &str) -> Result<()> {
        self.config.set_url(url)?;
        self.connect()
    }

    /// Queue a message on the current connection
    pub fn send(&self, message: impl Into<Message>) -> Result<()> {
        match &self.handle {
            Some(handle) if self.running.is_some() => handle.send(message),
            Some(_) => Err(WsmuxError::ConnectionClosed),
            None => Err(WsmuxError::NotConnected),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.handle
            .as_ref()
            .map(ConnectionHandle::state)
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Established
    }

    /// Handle to the current (or most recent) connection
    pub fn handle(&self) -> Option<&ConnectionHandle> {
        self.handle.as_ref()
    }

    pub fn stats(&self) -> Stats {
        self.handle
            .as_ref()
            .map(ConnectionHandle::stats)
            .unwrap_or_default()
    }

    /// Headers of the server's handshake response
    pub fn response_headers(&self) -> Option<Headers> {
        self.handle.as_ref().and_then(|h| h.headers().cloned())
    }

    /// Close the connection and wait for the loop thread to stop
    ///
    /// Waits at most the close timeout for a clean close handshake, then
    /// forces teardown. Calling it again, or without a connection, is a no-op.
    pub fn disconnect(&mut self, status: Option<CloseStatus>) {
        let Some(running) = self.running.take() else {
            return;
        };
        let Some(handle) = self.handle.as_ref() else {
            return;
        };
        let id = handle.id();
        debug!(conn = id, "Disconnecting");
        handle.close(status);

        let mut stopped = wait_stopped(&running.done, running.close_timeout + STOP_MARGIN);
        if !stopped {
            warn!(conn = id, "Loop did not stop within {:?}, forcing teardown", running.close_timeout);
            handle.link.force();
            stopped = wait_stopped(&running.done, FORCE_GRACE);
        }

        if stopped {
            if running.thread.join().is_err() {
                error!(conn = id, "Client loop thread panicked");
            }
            info!(conn = id, "Disconnected");
        } else {
            error!(conn = id, "Client loop thread did not stop; detaching it");
        }
    }

    /// Join a loop thread that already finished on its own
    fn reap(&mut self) {
        let finished = self
            .running
            .as_ref()
            .map(|r| r.thread.is_finished())
            .unwrap_or(false);
        if finished {
            if let Some(running) = self.running.take() {
                if running.thread.join().is_err() {
                    error!("Client loop thread panicked");
                }
            }
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.disconnect(None);
    }
}

fn wait_stopped(done: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(done.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Loop thread body: one current-thread runtime for the whole connection
fn run_client(config: ConnectionConfig, settings: DriveSettings, mut dispatcher: Dispatcher<ClientEvents>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create event loop: {}", e);
            dispatcher.on_connect_error(&format!("failed to create event loop: {}", e));
            return;
        }
    };

    runtime.block_on(async move {
        let conn = dispatcher.link().id();
        let request = match config.client_request() {
            Ok(request) => request,
            Err(e) => {
                error!(conn, "Failed to create request: {}", e);
                dispatcher.on_connect_error(&e.to_string());
                return;
            }
        };

        let link = Arc::clone(dispatcher.link());
        let outcome = tokio::select! {
            result = open(&config, request) => result,
            _ = interrupted(&link) => {
                Err(WsmuxError::Connection("connection attempt cancelled".to_string()))
            }
        };

        match outcome {
            Ok((ws, headers)) => {
                info!(conn, "Connected to {}", config.url());
                drive(ws, &mut dispatcher, headers, settings).await;
            }
            Err(e) => {
                error!(conn, "Failed to connect: {}", e);
                dispatcher.on_connect_error(&e.to_string());
            }
        }
    });
}

/// Resolves when the application asked to stop while still connecting
async fn interrupted(link: &Link) {
    loop {
        if link.close_requested() || link.force_requested() {
            return;
        }
        link.woken().await;
    }
}

async fn open(config: &ConnectionConfig, request: Request) -> Result<(WsStream, Headers)> {
    let (ws, response) = match config.interface() {
        None => connect_async(request)
            .await
            .map_err(|e| WsmuxError::Connection(e.to_string()))?,
        Some(interface) => {
            let stream = connect_bound(config, interface).await?;
            client_async_tls(request, stream)
                .await
                .map_err(|e| WsmuxError::Connection(e.to_string()))?
        }
    };
    Ok((ws, capture_headers(response.headers())))
}

async fn connect_bound(config: &ConnectionConfig, interface: &BindInterface) -> Result<TcpStream> {
    let addr = tokio::net::lookup_host((config.host(), config.port()))
        .await?
        .next()
        .ok_or_else(|| WsmuxError::Connection(format!("no address for host '{}'", config.host())))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    match interface {
        BindInterface::Address(ip) => socket.bind(SocketAddr::new(*ip, 0))?,
        BindInterface::Device(name) => bind_device(&socket, name)?,
    }
    debug!(interface = %interface, peer = %addr, "Connecting from bound socket");
    Ok(socket.connect(addr).await?)
}

#[cfg(any(target_os = "android", target_os = "fuchsia", target_os = "linux"))]
fn bind_device(socket: &TcpSocket, name: &str) -> Result<()> {
    socket.bind_device(Some(name.as_bytes()))?;
    Ok(())
}

#[cfg(not(any(target_os = "android", target_os = "fuchsia", target_os = "linux")))]
fn bind_device(_socket: &TcpSocket, name: &str) -> Result<()> {
    Err(WsmuxError::InvalidConfig(format!(
        "binding to device '{}' is not supported on this platform",
        name
    )))
}
