//! # wsmux core
//!
//! Connection building blocks and the WebSocket client.
//!
//! ## Example
//!
//! ```rust,ignore
//! use wsmux::{Client, Message};
//!
//! let mut client = Client::new();
//! client
//!     .on_establish(|conn| {
//!         conn.send(Message::text("hello")).ok();
//!     })
//!     .on_receive(|_conn, msg| {
//!         println!("got {:?}", msg.as_text());
//!     });
//! client.connect_url("ws://127.0.0.1:9001/")?;
//! // ...
//! client.disconnect(None);
//! ```

pub mod client;
pub mod close_status;
pub mod config;
pub mod connection_state;
pub(crate) mod dispatcher;
pub(crate) mod event_loop;
pub(crate) mod keepalive;
pub mod link;
pub mod message;
pub mod options;
pub mod queue;

pub use client::Client;
pub use close_status::{CloseOrigin, CloseStatus};
pub use config::{BindInterface, ConnectionConfig};
pub use connection_state::{AtomicConnectionState, AtomicStats, ConnectionState, Stats};
pub use link::ConnectionHandle;
pub use message::{Message, MessageType};
pub use options::{ClientOptions, ConfigError, KeepAlive, PendingSendPolicy, ServerOptions};
pub use queue::OutboundQueue;
