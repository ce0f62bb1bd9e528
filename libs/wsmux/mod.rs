//! # wsmux
//!
//! WebSocket connection management: clients and multi-session servers driven
//! by background event loops.
//!
//! ## Features
//!
//! - **Background loops**: one current-thread tokio runtime per client, one per server
//! - **Thread-safe sends**: per-connection crossbeam queues; any thread may send
//! - **Lifecycle callbacks**: establish, receive, close and error, fired on the loop thread
//! - **Bounded shutdown**: close handshakes time out and fall back to forced teardown
//! - **Server filters**: veto peers by address or by handshake headers

pub mod core;
pub mod server;
pub mod traits;

// Re-export all traits
pub use traits::*;

// Re-export core functionality
pub use core::{
    BindInterface, Client, ClientOptions, CloseOrigin, CloseStatus, ConfigError, ConnectionConfig,
    ConnectionHandle, ConnectionState, KeepAlive, Message, MessageType, PendingSendPolicy,
    ServerOptions, Stats,
};

// Re-export server
pub use server::{Server, ServerContext, Session};
