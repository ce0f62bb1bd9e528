use crate::core::close_status::CloseStatus;
use crate::core::message::{Message, MessageType};

/// Where a data frame sits within its message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramePosition {
    /// Unfragmented message
    Whole(MessageType),
    /// First fragment; declares the message type
    First(MessageType),
    /// Middle fragment
    Continuation,
    /// Final fragment
    Last,
}

/// Outbound side of a connection as seen by the dispatcher
///
/// The dispatcher never writes to a socket directly. It asks for write
/// readiness and hands over frames; the event loop decides when they reach
/// the wire.
pub trait Transport {
    /// Ask for exactly one `on_writable` callback once the socket can take a frame
    fn request_writable(&mut self);

    /// Queue a data message for transmission
    fn write(&mut self, message: Message);

    /// Queue the close frame; nothing is written after it
    fn close(&mut self, status: &CloseStatus);
}
