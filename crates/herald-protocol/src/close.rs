//! WebSocket close codes and `pusher:error` codes.
//!
//! Client libraries decide how to reconnect from the numeric range:
//! 4000–4099 means do not reconnect, 4100–4199 reconnect with backoff,
//! 4200–4299 reconnect immediately.

use std::fmt;

/// Reasons the server closes a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    Normal = 1000,
    AppNotFound = 4001,
    ProtocolViolation = 4002,
    AppDisabled = 4003,
    OverQuota = 4004,
    UnsupportedProtocol = 4007,
    NoProtocolVersion = 4008,
    Unauthorized = 4009,
    OverCapacity = 4100,
    PongTimeout = 4201,
    RateLimited = 4301,
}

impl CloseCode {
    /// Numeric code sent in the close frame.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Human-readable reason sent in the close frame.
    #[must_use]
    pub fn reason(self) -> &'static str {
        match self {
            CloseCode::Normal => "Normal closure",
            CloseCode::AppNotFound => "Application does not exist",
            CloseCode::ProtocolViolation => "Protocol violation",
            CloseCode::AppDisabled => "Application disabled",
            CloseCode::OverQuota => "Application is over connection quota",
            CloseCode::UnsupportedProtocol => "Unsupported protocol version",
            CloseCode::NoProtocolVersion => "No protocol version supplied",
            CloseCode::Unauthorized => "Unauthorized",
            CloseCode::OverCapacity => "Over capacity",
            CloseCode::PongTimeout => "Pong reply not received",
            CloseCode::RateLimited => "Rate limit exceeded",
        }
    }

    /// Look up a close code by its numeric value.
    #[must_use]
    pub fn from_code(code: u16) -> Option<Self> {
        let found = match code {
            1000 => CloseCode::Normal,
            4001 => CloseCode::AppNotFound,
            4002 => CloseCode::ProtocolViolation,
            4003 => CloseCode::AppDisabled,
            4004 => CloseCode::OverQuota,
            4007 => CloseCode::UnsupportedProtocol,
            4008 => CloseCode::NoProtocolVersion,
            4009 => CloseCode::Unauthorized,
            4100 => CloseCode::OverCapacity,
            4201 => CloseCode::PongTimeout,
            4301 => CloseCode::RateLimited,
            _ => return None,
        };
        Some(found)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code(), self.reason())
    }
}

/// Codes carried in `pusher:error` frames that do not close the socket.
pub mod error_codes {
    /// Generic rejection of a client request.
    pub const UNAUTHORIZED: u16 = 4009;
    /// Client event over the per-connection rate.
    pub const RATE_LIMITED: u16 = 4301;
    /// Payload or quota limits exceeded.
    pub const OVER_CAPACITY: u16 = 4100;
}
