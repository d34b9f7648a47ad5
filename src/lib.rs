//! # Tether-WS: blocking WebSocket client
//!
//! An RFC 6455 WebSocket client built on plain blocking sockets. Each
//! connection runs one dedicated worker thread that reads frames, answers
//! pings, drives the heartbeat, and performs the closing handshake, while
//! user threads send through a serialized writer. There is no async runtime;
//! the worker stays responsive through short receive slices.
//!
//! ## Example
//!
//! ```ignore
//! use tether_ws::{Config, WebSocketClient};
//!
//! let mut client = WebSocketClient::new(Config::default());
//! client.on_text(|text| println!("received: {text}"));
//! client.connect("wss://echo.example.com/chat")?;
//! client.send_text("Hello")?;
//! client.disconnect();
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub mod client;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod mask;
pub mod transform;
pub mod transport;
pub mod url;

pub use client::{State, WebSocketClient};
pub use error::{CloseReason, Error, Result};
pub use frame::{Frame, OpCode};
pub use transform::PayloadTransform;
pub use url::{Scheme, Url};

/// WebSocket GUID for the handshake accept proof
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Maximum WebSocket frame header size (2 + 8 + 4 = 14 bytes)
pub const MAX_FRAME_HEADER_SIZE: usize = 14;

/// Largest payload encodable in the base 7-bit length field, and the
/// control-frame payload limit
pub const SMALL_PAYLOAD_MAX: usize = 125;

/// Largest payload encodable with the 16-bit extended length
pub const MEDIUM_PAYLOAD_MAX: usize = 65535;

/// Configuration for a WebSocket connection
///
/// All options are read-only once `connect` begins.
///
/// # Example
///
/// ```
/// use tether_ws::Config;
///
/// let config = Config::builder()
///     .timeout_ms(3_000)
///     .max_frame_size(256 * 1024)
///     .ping_interval_ms(15_000)
///     .header("Authorization", "Bearer token")
///     .build();
/// ```
#[derive(Clone)]
pub struct Config {
    /// Combined TCP connect + TLS + upgrade deadline in milliseconds
    /// (default: 5000)
    pub timeout_ms: u64,
    /// Maximum decoded frame payload (default: 1MB)
    pub max_frame_size: usize,
    /// Maximum reassembled message size across fragments (default: 16MB)
    pub max_message_size: usize,
    /// Interval between unsolicited pings in milliseconds
    /// (default: 30000, 0 = disabled)
    pub ping_interval_ms: u64,
    /// How long to wait for a pong before declaring the link dead
    /// (default: 10000, 0 = disabled)
    pub pong_timeout_ms: u64,
    /// Extra headers appended verbatim to the upgrade request
    pub headers: BTreeMap<String, String>,
    /// Extension tokens emitted in `Sec-WebSocket-Extensions`
    pub extensions: BTreeMap<String, String>,
    /// Optional payload transform applied to data messages
    pub transform: Option<Arc<dyn PayloadTransform>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            max_frame_size: 1024 * 1024,
            max_message_size: 16 * 1024 * 1024,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 10_000,
            headers: BTreeMap::new(),
            extensions: BTreeMap::new(),
            transform: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("timeout_ms", &self.timeout_ms)
            .field("max_frame_size", &self.max_frame_size)
            .field("max_message_size", &self.max_message_size)
            .field("ping_interval_ms", &self.ping_interval_ms)
            .field("pong_timeout_ms", &self.pong_timeout_ms)
            .field("headers", &self.headers)
            .field("extensions", &self.extensions)
            .field("transform", &self.transform.as_ref().map(|_| ".."))
            .finish()
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }
}

/// Builder for WebSocket configuration
#[derive(Debug, Clone, Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    /// Set the combined connect + handshake deadline in milliseconds
    pub fn timeout_ms(mut self, ms: u64) -> Self {
        self.config.timeout_ms = ms;
        self
    }

    /// Set the maximum decoded frame payload size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    /// Set the maximum reassembled message size
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    /// Set the heartbeat interval in milliseconds (0 disables)
    pub fn ping_interval_ms(mut self, ms: u64) -> Self {
        self.config.ping_interval_ms = ms;
        self
    }

    /// Set the pong wait bound in milliseconds (0 disables enforcement)
    pub fn pong_timeout_ms(mut self, ms: u64) -> Self {
        self.config.pong_timeout_ms = ms;
        self
    }

    /// Append an extra header to the upgrade request
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    /// Advertise a protocol extension with its parameter string
    pub fn extension(mut self, name: impl Into<String>, params: impl Into<String>) -> Self {
        self.config.extensions.insert(name.into(), params.into());
        self
    }

    /// Install a payload transform for data messages
    pub fn transform(mut self, transform: Arc<dyn PayloadTransform>) -> Self {
        self.config.transform = Some(transform);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Config {
        self.config
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::client::{State, WebSocketClient};
    pub use crate::error::{CloseReason, Error, Result};
    pub use crate::frame::{Frame, OpCode};
    pub use crate::Config;
}
