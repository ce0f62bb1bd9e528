//! WebSocket close status
//!
//! A close code, an optional status label and an optional human-readable
//! reason. Codes outside the standard table are still valid values and travel
//! over the wire unchanged; they are only classified as unknown.

use std::fmt;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

/// Which side initiated the close
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CloseOrigin {
    /// Requested through `disconnect()` or forced by this endpoint
    #[default]
    Local,
    /// Close frame received from the peer, or the transport dropped
    Peer,
}

/// Close code plus optional status and reason text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    code: u16,
    status: Option<String>,
    reason: Option<String>,
    origin: CloseOrigin,
}

impl CloseStatus {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL_ERROR: u16 = 1002;
    pub const UNSUPPORTED: u16 = 1003;
    pub const NO_STATUS: u16 = 1005;
    pub const ABNORMAL: u16 = 1006;
    pub const UNSUPPORTED_DATA: u16 = 1007;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const TOO_LARGE: u16 = 1009;
    pub const EXTENSION_REQUIRED: u16 = 1010;
    pub const INTERNAL_ERROR: u16 = 1011;
    pub const TLS_FAILURE: u16 = 1015;

    /// Build a status from any 16-bit code
    pub fn new(code: u16) -> Self {
        Self {
            code,
            status: None,
            reason: None,
            origin: CloseOrigin::Local,
        }
    }

    /// NORMAL (1000)
    pub fn normal() -> Self {
        Self::new(Self::NORMAL)
    }

    /// GOING_AWAY (1001)
    pub fn going_away() -> Self {
        Self::new(Self::GOING_AWAY)
    }

    /// ABNORMAL (1006) with the transport's explanation
    pub fn abnormal(reason: impl Into<String>) -> Self {
        Self::new(Self::ABNORMAL).with_reason(reason)
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub(crate) fn with_origin(mut self, origin: CloseOrigin) -> Self {
        self.origin = origin;
        self
    }

    #[inline]
    pub fn code(&self) -> u16 {
        self.code
    }

    /// Status label, falling back to the standard name of the code
    pub fn status(&self) -> Option<&str> {
        self.status.as_deref().or_else(|| standard_name(self.code))
    }

    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    pub fn origin(&self) -> CloseOrigin {
        self.origin
    }

    /// True when the code is not one of the standard defined codes
    pub fn is_unknown(&self) -> bool {
        standard_name(self.code).is_none()
    }

    /// Codes that may appear in a close frame on the wire
    ///
    /// NO_STATUS, ABNORMAL and TLS_FAILURE are reserved for local reporting.
    pub fn is_sendable(&self) -> bool {
        !matches!(
            self.code,
            Self::NO_STATUS | Self::ABNORMAL | Self::TLS_FAILURE
        )
    }

    /// Close frame to hand to the transport
    ///
    /// A reserved code is sent as an empty close frame.
    pub(crate) fn to_frame(&self) -> Option<CloseFrame<'static>> {
        if !self.is_sendable() {
            return None;
        }
        let reason = self
            .reason
            .clone()
            .or_else(|| self.status.clone())
            .unwrap_or_default();
        Some(CloseFrame {
            code: CloseCode::from(self.code),
            reason: reason.into(),
        })
    }

    /// Status reported for a close frame received from the peer
    pub(crate) fn from_peer_frame(frame: Option<&CloseFrame<'_>>) -> Self {
        match frame {
            Some(frame) => {
                let status = Self::new(u16::from(frame.code)).with_origin(CloseOrigin::Peer);
                if frame.reason.is_empty() {
                    status
                } else {
                    status.with_reason(frame.reason.to_string())
                }
            }
            None => Self::new(Self::NO_STATUS).with_origin(CloseOrigin::Peer),
        }
    }
}

impl Default for CloseStatus {
    fn default() -> Self {
        Self::normal()
    }
}

impl From<u16> for CloseStatus {
    fn from(code: u16) -> Self {
        Self::new(code)
    }
}

impl fmt::Display for CloseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(status) = self.status() {
            write!(f, " ({})", status)?;
        }
        if let Some(reason) = &self.reason {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

fn standard_name(code: u16) -> Option<&'static str> {
    let name = match code {
        CloseStatus::NORMAL => "Normal",
        CloseStatus::GOING_AWAY => "Going Away",
        CloseStatus::PROTOCOL_ERROR => "Protocol Error",
        CloseStatus::UNSUPPORTED => "Unsupported",
        CloseStatus::NO_STATUS => "No Status",
        CloseStatus::ABNORMAL => "Abnormal",
        CloseStatus::UNSUPPORTED_DATA => "Unsupported Data",
        CloseStatus::POLICY_VIOLATION => "Policy Violation",
        CloseStatus::TOO_LARGE => "Too Large",
        CloseStatus::EXTENSION_REQUIRED => "Extension Required",
        CloseStatus::INTERNAL_ERROR => "Internal Error",
        CloseStatus::TLS_FAILURE => "TLS Failure",
        _ => return None,
    };
    Some(name)
}
