//! Error types for the WebSocket client

use std::fmt;
use std::io;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
///
/// Each variant corresponds to one failure stage of the connection
/// lifecycle; synchronous calls return these directly and worker-detected
/// failures are reported through the error callback.
#[derive(Debug, Clone)]
pub enum Error {
    /// The URL could not be parsed as a WebSocket endpoint
    BadUrl(String),
    /// DNS resolution, TCP connect, or socket I/O failed
    Transport(String),
    /// TLS setup or handshake failed
    Tls(String),
    /// The HTTP upgrade was refused or malformed
    Handshake(String),
    /// The peer violated RFC 6455 framing rules
    Protocol(&'static str),
    /// A deadline elapsed (connect, handshake response, or pong wait)
    Timeout(&'static str),
    /// The connection is closed
    Closed,
    /// Operation requires a different connection state
    NotOpen,
    /// A caller-supplied value is out of range or unsupported
    BadArgument(&'static str),
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Internal error
    pub const INTERNAL: u16 = 1011;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code is valid per RFC 6455
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1011 | 3000..=4999)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadUrl(msg) => write!(f, "invalid URL: {}", msg),
            Error::Transport(msg) => write!(f, "transport failed: {}", msg),
            Error::Tls(msg) => write!(f, "TLS failed: {}", msg),
            Error::Handshake(msg) => write!(f, "handshake failed: {}", msg),
            Error::Protocol(msg) => write!(f, "protocol violation: {}", msg),
            Error::Timeout(msg) => write!(f, "timed out: {}", msg),
            Error::Closed => write!(f, "connection closed"),
            Error::NotOpen => write!(f, "connection not in a valid state for this operation"),
            Error::BadArgument(msg) => write!(f, "bad argument: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => Error::Timeout("socket I/O"),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => Error::Closed,
            _ => Error::Transport(e.to_string()),
        }
    }
}
