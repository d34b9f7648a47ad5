//! WebSocket URL parsing
//!
//! A strict, allocation-light parser for `ws://` and `wss://` URLs. It
//! deliberately does not percent-decode; path and query reach the upgrade
//! request exactly as written.

use crate::error::{Error, Result};

/// URL scheme, which also decides whether TLS is required
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// `ws://` — plain TCP
    Ws,
    /// `wss://` — TLS
    Wss,
}

impl Scheme {
    /// Port used when the URL does not name one
    #[inline]
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ws => 80,
            Scheme::Wss => 443,
        }
    }

    /// Whether this scheme requires a TLS transport
    #[inline]
    pub fn is_secure(self) -> bool {
        self == Scheme::Wss
    }

    /// The scheme literal without the `://` separator
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }
}

/// A parsed WebSocket endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    /// Scheme; decides the default port and TLS requirement
    pub scheme: Scheme,
    /// Host name or address, never empty
    pub host: String,
    /// Port in 1..=65535
    pub port: u16,
    /// Absolute path, always beginning with `/`
    pub path: String,
    /// Query string without the leading `?`, empty when absent
    pub query: String,
}

impl Url {
    /// Parse a WebSocket URL of the form
    /// `ws[s]://host[:port][/path][?query]`.
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| Error::BadUrl("missing scheme".into()))?;
        let scheme = match scheme {
            "ws" => Scheme::Ws,
            "wss" => Scheme::Wss,
            other => {
                return Err(Error::BadUrl(format!(
                    "scheme must be ws or wss, got `{other}`"
                )))
            }
        };

        let (authority, path_and_query) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, "/"),
        };

        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => (host, Self::parse_port(port)?),
            None => (authority, scheme.default_port()),
        };
        if host.is_empty() {
            return Err(Error::BadUrl("empty host".into()));
        }
        if host
            .chars()
            .any(|c| matches!(c, '/' | '?' | '#' | '@') || c.is_whitespace())
        {
            return Err(Error::BadUrl(format!("invalid host `{host}`")));
        }

        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (path_and_query.to_string(), String::new()),
        };

        Ok(Url {
            scheme,
            host: host.to_string(),
            port,
            path,
            query,
        })
    }

    fn parse_port(port: &str) -> Result<u16> {
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::BadUrl(format!("invalid port `{port}`")));
        }
        match port.parse::<u16>() {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(Error::BadUrl(format!("port `{port}` out of range"))),
        }
    }

    /// Request-target for the upgrade request line
    pub fn request_path(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// `Host` header value; the port is appended only when it differs from
    /// the scheme default
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}
