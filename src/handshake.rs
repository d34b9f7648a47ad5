//! Opening handshake (HTTP/1.1 upgrade)
//!
//! Builds the client upgrade request, computes the expected
//! `Sec-WebSocket-Accept` proof, and validates the server response. The
//! accept value is Base64(SHA-1(key + GUID)) over the base64-encoded form
//! of the client nonce, per RFC 6455 §4.2.2.

use std::time::{Duration, Instant};

use base64::Engine;
use bytes::{BufMut, Bytes, BytesMut};
use rand::RngCore;
use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::{RecvOutcome, Transport};
use crate::url::Url;
use crate::{Config, WS_GUID};

/// Upper bound on the response header block
const MAX_RESPONSE_SIZE: usize = 32 * 1024;

/// Generate a random `Sec-WebSocket-Key`: base64 of 16 random bytes
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    base64::engine::general_purpose::STANDARD.encode(nonce)
}

/// Compute the accept value the server must echo for `key`
#[inline]
pub fn accept_for_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Build the client upgrade request
pub fn build_request(url: &Url, key: &str, config: &Config) -> Bytes {
    let mut buf = BytesMut::with_capacity(512);

    buf.put_slice(b"GET ");
    buf.put_slice(url.request_path().as_bytes());
    buf.put_slice(b" HTTP/1.1\r\n");
    buf.put_slice(b"Host: ");
    buf.put_slice(url.host_header().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Upgrade: websocket\r\n");
    buf.put_slice(b"Connection: Upgrade\r\n");
    buf.put_slice(b"Sec-WebSocket-Key: ");
    buf.put_slice(key.as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

    for (name, value) in &config.headers {
        buf.put_slice(name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if !config.extensions.is_empty() {
        let joined = config
            .extensions
            .iter()
            .map(|(name, params)| {
                if params.is_empty() {
                    name.clone()
                } else {
                    format!("{name}; {params}")
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        buf.put_slice(b"Sec-WebSocket-Extensions: ");
        buf.put_slice(joined.as_bytes());
        buf.put_slice(b"\r\n");
    }

    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// Read the response header block through the terminating blank line.
///
/// Times out at `deadline`; a block over 32KB without a terminator is a
/// handshake failure.
pub fn read_response(transport: &mut Transport, deadline: Instant) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(2048);
    let mut tmp = [0u8; 2048];

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout("handshake response"));
        }
        let slice = (deadline - now).min(Duration::from_millis(500));

        match transport.recv_some(&mut tmp, slice)? {
            RecvOutcome::Idle => continue,
            RecvOutcome::Closed => {
                return Err(Error::Handshake(
                    "connection closed before upgrade completed".into(),
                ))
            }
            RecvOutcome::Data(n) => {
                buf.extend_from_slice(&tmp[..n]);
                if header_end(&buf).is_some() {
                    return Ok(buf);
                }
                if buf.len() > MAX_RESPONSE_SIZE {
                    return Err(Error::Handshake("response header block too large".into()));
                }
            }
        }
    }
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Validate the server's upgrade response against the expected accept value.
///
/// Field names are matched case-insensitively; the accept value is compared
/// byte-for-byte after trimming surrounding whitespace.
pub fn validate_response(raw: &[u8], expected_accept: &str) -> Result<()> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);

    match response.parse(raw) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(Error::Handshake("truncated upgrade response".into()))
        }
        Err(e) => return Err(Error::Handshake(format!("malformed upgrade response: {e}"))),
    }

    if response.version != Some(1) || response.code != Some(101) {
        return Err(Error::Handshake(format!(
            "expected HTTP/1.1 101, got HTTP/1.{} {}",
            response.version.unwrap_or(0),
            response.code.unwrap_or(0),
        )));
    }

    let mut upgrade_ok = false;
    let mut connection_ok = false;
    let mut accept = None;

    for header in response.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|_| Error::Handshake(format!("non-UTF-8 value in `{}`", header.name)))?;

        if header.name.eq_ignore_ascii_case("upgrade") {
            upgrade_ok = value.to_ascii_lowercase().contains("websocket");
        } else if header.name.eq_ignore_ascii_case("connection") {
            connection_ok = value.to_ascii_lowercase().contains("upgrade");
        } else if header.name.eq_ignore_ascii_case("sec-websocket-accept") {
            accept = Some(value.trim());
        }
    }

    if !upgrade_ok {
        return Err(Error::Handshake(
            "missing `websocket` token in Upgrade header".into(),
        ));
    }
    if !connection_ok {
        return Err(Error::Handshake(
            "missing `upgrade` token in Connection header".into(),
        ));
    }
    match accept {
        Some(value) if value == expected_accept => Ok(()),
        Some(_) => Err(Error::Handshake("Sec-WebSocket-Accept mismatch".into())),
        None => Err(Error::Handshake("missing Sec-WebSocket-Accept".into())),
    }
}

/// Run the client side of the opening handshake on an established
/// transport.
///
/// Returns any bytes that arrived after the response header block; they
/// are the first bytes of the frame stream and must reach the decoder.
pub fn perform(
    transport: &mut Transport,
    url: &Url,
    config: &Config,
    deadline: Instant,
) -> Result<Bytes> {
    let key = generate_key();
    let expected = accept_for_key(&key);

    let request = build_request(url, &key, config);
    trace!(bytes = request.len(), "sending upgrade request");
    transport.send_all(&request)?;

    let raw = read_response(transport, deadline)?;
    validate_response(&raw, &expected)?;
    debug!(host = %url.host, path = %url.path, "websocket upgrade accepted");

    let body_start = header_end(&raw).map_or(raw.len(), |end| end + 4);
    Ok(Bytes::copy_from_slice(&raw[body_start..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::Url;

    fn response_with_accept(accept: &str) -> String {
        format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\
             \r\n"
        )
    }

    #[test]
    fn rfc_accept_vector() {
        // Test vector from RFC 6455 §1.3
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        assert_eq!(accept_for_key(key), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn generated_keys_decode_to_16_bytes() {
        let key = generate_key();
        let raw = base64::engine::general_purpose::STANDARD
            .decode(&key)
            .unwrap();
        assert_eq!(raw.len(), 16);
        assert_ne!(generate_key(), key);
    }

    #[test]
    fn request_contains_required_fields() {
        let url = Url::parse("ws://server.example.com/chat?room=1").unwrap();
        let config = Config::builder()
            .header("X-Api-Key", "secret")
            .extension("x-custom-frames", "window=8")
            .build();
        let request = build_request(&url, "dGhlIHNhbXBsZSBub25jZQ==", &config);
        let text = std::str::from_utf8(&request).unwrap();

        assert!(text.starts_with("GET /chat?room=1 HTTP/1.1\r\n"));
        assert!(text.contains("Host: server.example.com\r\n"));
        assert!(text.contains("Upgrade: websocket\r\n"));
        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(text.contains("Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n"));
        assert!(text.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(text.contains("X-Api-Key: secret\r\n"));
        assert!(text.contains("Sec-WebSocket-Extensions: x-custom-frames; window=8\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn request_host_includes_non_default_port() {
        let url = Url::parse("ws://server.example.com:9001/").unwrap();
        let request = build_request(&url, "a2V5a2V5a2V5a2V5a2V5a2==", &Config::default());
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.contains("Host: server.example.com:9001\r\n"));
    }

    #[test]
    fn accepts_exact_response() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let accept = accept_for_key(key);
        let response = response_with_accept(&accept);
        assert!(validate_response(response.as_bytes(), &accept).is_ok());
    }

    #[test]
    fn accepts_case_and_whitespace_variance() {
        let accept = accept_for_key("dGhlIHNhbXBsZSBub25jZQ==");
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             UPGRADE: WebSocket\r\n\
             connection: keep-alive, Upgrade\r\n\
             SEC-WEBSOCKET-ACCEPT:   {accept}  \r\n\
             \r\n"
        );
        assert!(validate_response(response.as_bytes(), &accept).is_ok());
    }

    #[test]
    fn rejects_wrong_status() {
        let accept = accept_for_key("dGhlIHNhbXBsZSBub25jZQ==");
        let response = "HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n";
        assert!(matches!(
            validate_response(response.as_bytes(), &accept),
            Err(Error::Handshake(_))
        ));
    }

    #[test]
    fn rejects_missing_upgrade_header() {
        let accept = accept_for_key("dGhlIHNhbXBsZSBub25jZQ==");
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {accept}\r\n\
             \r\n"
        );
        let err = validate_response(response.as_bytes(), &accept).unwrap_err();
        assert!(err.to_string().contains("Upgrade"));
    }

    #[test]
    fn rejects_perturbed_accept() {
        let accept = accept_for_key("dGhlIHNhbXBsZSBub25jZQ==");
        let mut tampered = accept.clone().into_bytes();
        tampered[0] ^= 0x01;
        let response = response_with_accept(std::str::from_utf8(&tampered).unwrap());
        assert!(matches!(
            validate_response(response.as_bytes(), &accept),
            Err(Error::Handshake(_))
        ));
    }
}
