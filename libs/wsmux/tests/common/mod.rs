//! Common test utilities for wsmux integration tests
//!
//! The library API is synchronous, so the mock server runs its own
//! current-thread runtime on a background thread.

#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WireMessage;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
#[macro_export]
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

/// How the mock treats a connection after the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
    /// Echo text and binary frames; answer pings and close frames
    Echo,
    /// Never read again: no pongs, no close reply
    Silent,
}

/// What the mock observed on its connections
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    Handshake(Vec<(String, String)>),
    Frame(WireMessage),
    Closed,
}

/// A mock WebSocket server for testing
pub struct MockWsServer {
    pub addr: SocketAddr,
    pub observed: Receiver<Observed>,
    shutdown: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl MockWsServer {
    pub fn start(mode: MockMode) -> Self {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let addr = std_listener.local_addr().unwrap();
        let shutdown = Arc::new(Notify::new());
        let (tx, rx) = unbounded();

        let thread = {
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(async move {
                    let listener = TcpListener::from_std(std_listener).unwrap();
                    loop {
                        tokio::select! {
                            result = listener.accept() => {
                                match result {
                                    Ok((stream, _)) => {
                                        let tx = tx.clone();
                                        let shutdown = Arc::clone(&shutdown);
                                        tokio::spawn(async move {
                                            Self::handle_connection(stream, mode, tx, shutdown).await;
                                        });
                                    }
                                    Err(e) => {
                                        eprintln!("Accept error: {}", e);
                                        break;
                                    }
                                }
                            }
                            _ = shutdown.notified() => {
                                break;
                            }
                        }
                    }
                });
            })
        };

        Self {
            addr,
            observed: rx,
            shutdown,
            thread: Some(thread),
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        mode: MockMode,
        tx: Sender<Observed>,
        shutdown: Arc<Notify>,
    ) {
        let handshake_tx = tx.clone();
        let callback = move |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
            let headers = request
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
                .collect();
            let _ = handshake_tx.send(Observed::Handshake(headers));

            // Accept the first offered subprotocol
            if let Some(offered) = request.headers().get("sec-websocket-protocol") {
                if let Some(first) = offered.to_str().ok().and_then(|v| v.split(',').next()) {
                    response
                        .headers_mut()
                        .insert("sec-websocket-protocol", HeaderValue::from_str(first.trim()).unwrap());
                }
            }
            response
                .headers_mut()
                .insert("x-mock", HeaderValue::from_static("1"));
            Ok(response)
        };

        let ws_stream = match accept_hdr_async(stream, callback).await {
            Ok(ws) => ws,
            Err(e) => {
                eprintln!("WebSocket handshake failed: {}", e);
                return;
            }
        };

        if mode == MockMode::Silent {
            shutdown.notified().await;
            drop(ws_stream);
            return;
        }

        let (mut write, mut read) = ws_stream.split();
        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            let _ = tx.send(Observed::Frame(msg.clone()));
                            if msg.is_text() || msg.is_binary() {
                                if write.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            // Pings and close replies are answered by tungstenite
                        }
                        Some(Err(_)) | None => break,
                    }
                }
                _ = shutdown.notified() => {
                    break;
                }
            }
        }
        let _ = tx.send(Observed::Closed);
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }

    /// Next observed data frame, skipping handshakes and control frames
    pub fn next_data_frame(&self, timeout: Duration) -> Option<WireMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            match self.observed.recv_timeout(remaining).ok()? {
                Observed::Frame(msg) if msg.is_text() || msg.is_binary() => return Some(msg),
                _ => continue,
            }
        }
    }

    /// Headers of the next handshake seen
    pub fn next_handshake(&self, timeout: Duration) -> Option<Vec<(String, String)>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.checked_duration_since(Instant::now())?;
            if let Observed::Handshake(headers) = self.observed.recv_timeout(remaining).ok()? {
                return Some(headers);
            }
        }
    }

    pub fn shutdown(&mut self) {
        self.shutdown.notify_waiters();
        // The accept loop may not be parked on notified() yet
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for MockWsServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Plain TCP peer that writes WebSocket frames by hand
///
/// Lets tests put bytes on the wire that no conforming client would send.
pub struct RawPeer {
    stream: std::net::TcpStream,
}

impl RawPeer {
    /// Open a socket and send an upgrade request without reading the answer
    pub fn request(addr: SocketAddr) -> Self {
        use std::io::Write;

        let mut stream = std::net::TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let request = format!(
            "GET / HTTP/1.1\r\n\
             Host: {}\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            addr
        );
        stream.write_all(request.as_bytes()).unwrap();
        Self { stream }
    }

    /// Upgrade and expect `101 Switching Protocols`
    pub fn connect(addr: SocketAddr) -> Self {
        let mut peer = Self::request(addr);
        let status = peer.read_response();
        assert!(status.contains(" 101 "), "unexpected response: {}", status);
        peer
    }

    /// Read the HTTP response head and return its status line
    pub fn read_response(&mut self) -> String {
        use std::io::Read;

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            match self.stream.read(&mut byte) {
                Ok(1) => head.push(byte[0]),
                _ => break,
            }
        }
        let head = String::from_utf8_lossy(&head).into_owned();
        head.lines().next().unwrap_or_default().to_string()
    }

    /// Write one frame under a zero mask key; `payload` must be under 126 bytes
    pub fn send_frame(&mut self, first_byte: u8, payload: &[u8]) {
        use std::io::Write;

        assert!(payload.len() < 126);
        let mut frame = vec![first_byte, 0x80 | payload.len() as u8, 0, 0, 0, 0];
        frame.extend_from_slice(payload);
        self.stream.write_all(&frame).unwrap();
    }

    /// Read one unmasked frame from the server as (first byte, payload)
    pub fn read_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        use std::io::Read;

        let mut header = [0u8; 2];
        self.stream.read_exact(&mut header).ok()?;
        let len = match header[1] & 0x7f {
            126 => {
                let mut ext = [0u8; 2];
                self.stream.read_exact(&mut ext).ok()?;
                u16::from_be_bytes(ext) as usize
            }
            127 => {
                let mut ext = [0u8; 8];
                self.stream.read_exact(&mut ext).ok()?;
                u64::from_be_bytes(ext) as usize
            }
            n => n as usize,
        };
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload).ok()?;
        Some((header[0], payload))
    }

    /// Skip data frames until a close frame arrives and return its code
    pub fn read_close_code(&mut self) -> Option<u16> {
        loop {
            let (first, payload) = self.read_frame()?;
            if first & 0x0f == 0x8 {
                return (payload.len() >= 2).then(|| u16::from_be_bytes([payload[0], payload[1]]));
            }
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Test fixture for connection states
pub mod fixtures {
    use wsmux::core::connection_state::{AtomicConnectionState, ConnectionState};

    pub fn idle_state() -> AtomicConnectionState {
        AtomicConnectionState::new(ConnectionState::Idle)
    }

    pub fn established_state() -> AtomicConnectionState {
        AtomicConnectionState::new(ConnectionState::Established)
    }

    pub fn connecting_state() -> AtomicConnectionState {
        AtomicConnectionState::new(ConnectionState::Connecting)
    }
}
