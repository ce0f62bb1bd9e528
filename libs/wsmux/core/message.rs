//! Application-level WebSocket messages
//!
//! A [`Message`] is a tagged payload: UTF-8 text or opaque binary. The tag is
//! fixed at construction and the typed accessors refuse to hand out the wrong
//! kind, so `as_binary()` on a text message is an error rather than an empty
//! buffer.
//!
//! The dispatcher builds inbound messages fragment by fragment through the
//! crate-private [`Message::append`]; applications only ever see complete
//! messages.

use crate::traits::{Result, WsmuxError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of payload carried by a [`Message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text,
    Binary,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Text => write!(f, "text"),
            MessageType::Binary => write!(f, "binary"),
        }
    }
}

/// A complete text or binary WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageType,
    payload: Vec<u8>,
}

impl Message {
    /// Create a text message
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: MessageType::Text,
            payload: text.into().into_bytes(),
        }
    }

    /// Create a binary message
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: MessageType::Binary,
            payload: data.into(),
        }
    }

    /// Create a text message holding `value` serialized as JSON
    pub fn from_json<T: Serialize>(value: &T) -> Result<Self> {
        let text = serde_json::to_string(value)
            .map_err(|e| WsmuxError::InvalidConfig(format!("JSON encode failed: {}", e)))?;
        Ok(Self::text(text))
    }

    /// Empty message of the given kind, used as the reassembly target
    pub(crate) fn empty(kind: MessageType) -> Self {
        Self {
            kind,
            payload: Vec::new(),
        }
    }

    /// The payload kind
    #[inline]
    pub fn message_type(&self) -> MessageType {
        self.kind
    }

    #[inline]
    pub fn is_text(&self) -> bool {
        self.kind == MessageType::Text
    }

    #[inline]
    pub fn is_binary(&self) -> bool {
        self.kind == MessageType::Binary
    }

    /// Borrow the payload as text
    ///
    /// Fails with [`WsmuxError::TypeMismatch`] on a binary message.
    pub fn as_text(&self) -> Result<&str> {
        self.expect_kind(MessageType::Text)?;
        std::str::from_utf8(&self.payload)
            .map_err(|e| WsmuxError::ProtocolViolation(format!("invalid UTF-8 in text message: {}", e)))
    }

    /// Borrow the payload as binary
    ///
    /// Fails with [`WsmuxError::TypeMismatch`] on a text message.
    pub fn as_binary(&self) -> Result<&[u8]> {
        self.expect_kind(MessageType::Binary)?;
        Ok(&self.payload)
    }

    /// Take the payload as an owned string
    pub fn into_text(self) -> Result<String> {
        self.expect_kind(MessageType::Text)?;
        String::from_utf8(self.payload)
            .map_err(|e| WsmuxError::ProtocolViolation(format!("invalid UTF-8 in text message: {}", e)))
    }

    /// Take the payload as owned bytes
    pub fn into_binary(self) -> Result<Vec<u8>> {
        self.expect_kind(MessageType::Binary)?;
        Ok(self.payload)
    }

    /// Parse a text message as JSON
    pub fn json<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        let text = self.as_text()?;
        serde_json::from_str(text)
            .map_err(|e| WsmuxError::ProtocolViolation(format!("JSON decode failed: {}", e)))
    }

    /// Raw payload bytes regardless of kind
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.payload
    }

    /// Pre-size the payload buffer for `additional` more bytes
    pub fn reserve(&mut self, additional: usize) {
        self.payload.reserve(additional);
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Append a fragment payload in place
    pub(crate) fn append(&mut self, fragment: &[u8]) {
        self.payload.extend_from_slice(fragment);
    }

    /// Check the assembled payload honours its tag
    pub(crate) fn validate(&self) -> Result<()> {
        if self.kind == MessageType::Text {
            std::str::from_utf8(&self.payload).map_err(|e| {
                WsmuxError::ProtocolViolation(format!("invalid UTF-8 in text message: {}", e))
            })?;
        }
        Ok(())
    }

    pub(crate) fn into_parts(self) -> (MessageType, Vec<u8>) {
        (self.kind, self.payload)
    }

    fn expect_kind(&self, expected: MessageType) -> Result<()> {
        if self.kind != expected {
            return Err(WsmuxError::TypeMismatch {
                expected,
                actual: self.kind,
            });
        }
        Ok(())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self::text(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::text(s)
    }
}

impl From<Vec<u8>> for Message {
    fn from(b: Vec<u8>) -> Self {
        Self::binary(b)
    }
}

impl From<&[u8]> for Message {
    fn from(b: &[u8]) -> Self {
        Self::binary(b.to_vec())
    }
}
