//! Multi-session WebSocket server
//!
//! One loop thread accepts peers and drives every [`Session`]. Sessions are
//! tracked in a mutex-guarded map from the end of their handshake until their
//! loop task has finished with them.

pub mod server;
pub mod session;

pub use server::{Server, ServerContext};
pub use session::Session;
