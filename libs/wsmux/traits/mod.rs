//! # wsmux traits
//!
//! Seams and shared types used across the crate:
//!
//! - **EventHandler**: lifecycle callbacks driven by the dispatcher
//! - **Transport**: the write side the dispatcher talks to
//! - **Headers / Cookies**: handshake metadata
//! - **WsmuxError**: the crate error type

pub mod error;
pub mod handler;
pub mod headers;
pub mod transport;

pub use error::{Result, WsmuxError};
pub use handler::EventHandler;
pub use headers::{Cookies, Headers};
pub use transport::{FramePosition, Transport};
