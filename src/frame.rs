//! WebSocket frame encoding and incremental decoding
//!
//! Implements RFC 6455 framing: header layout, extended payload lengths,
//! and client-side masking. The decoder consumes nothing until the buffer
//! holds a complete frame, so a caller can feed it partial network reads
//! and retry as bytes arrive.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::apply_mask;
use crate::{MEDIUM_PAYLOAD_MAX, SMALL_PAYLOAD_MAX};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A complete WebSocket frame
///
/// The payload is always stored unmasked; `mask` records the key the frame
/// was (or will be) masked with on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Masking key, present iff the wire form is masked
    pub mask: Option<[u8; 4]>,
    /// Unmasked payload
    pub payload: Bytes,
}

impl Frame {
    /// Create an unmasked frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            fin,
            opcode,
            mask: None,
            payload,
        }
    }

    /// Create a final text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a final binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame with a status code and reason text
    pub fn close(code: u16, reason: &str) -> Self {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(OpCode::Close, payload.freeze(), true)
    }

    /// Create a close frame with an empty body
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Attach a masking key; encoding will mask the payload on the wire
    pub fn masked(mut self, key: [u8; 4]) -> Self {
        self.mask = Some(key);
        self
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Parse a close frame payload into code and reason.
    ///
    /// An empty payload is a close with no reason supplied. A 1-byte
    /// payload or a reserved status code violates RFC 6455 §5.5.1.
    pub fn parse_close(&self) -> Result<Option<CloseReason>> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        if self.payload.len() < 2 {
            return Err(Error::Protocol("invalid close frame payload"));
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        if !CloseReason::is_valid_code(code) {
            return Err(Error::Protocol("invalid close status code"));
        }
        let reason = if self.payload.len() > 2 {
            String::from_utf8_lossy(&self.payload[2..]).into_owned()
        } else {
            String::new()
        };
        Ok(Some(CloseReason::new(code, reason)))
    }
}

/// Encode a frame into a buffer
///
/// Payload lengths pick the smallest header form: 7-bit, 16-bit, or
/// 64-bit. When `mask` is given, the mask key is written and the payload
/// copy is XORed in place.
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    let payload_len = payload.len();

    let header_size = 2
        + if payload_len > MEDIUM_PAYLOAD_MAX {
            8
        } else if payload_len > SMALL_PAYLOAD_MAX {
            2
        } else {
            0
        }
        + if mask.is_some() { 4 } else { 0 };

    buf.reserve(header_size + payload_len);

    let mut b0 = opcode as u8;
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };

    if payload_len <= SMALL_PAYLOAD_MAX {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_PAYLOAD_MAX {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(key) = mask {
        buf.put_slice(&key);

        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], key);
    } else {
        buf.put_slice(payload);
    }
}

/// Incremental frame decoder
///
/// Stateless between calls: a frame is taken off the front of the buffer
/// only once every byte of it has arrived, so partial reads simply leave
/// the buffer untouched until the next append.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder enforcing the given payload bound
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns:
    /// - `Ok(Some(frame))` with the consumed bytes removed from `buf`
    /// - `Ok(None)` if the buffer does not yet hold a whole frame
    /// - `Err(_)` on a framing violation; nothing is consumed
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let b0 = buf[0];
        let b1 = buf[1];

        // No extension that claims reserved bits is ever negotiated.
        if b0 & 0x70 != 0 {
            return Err(Error::Protocol("reserved bits set"));
        }

        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(Error::Protocol("unknown opcode"))?;
        let masked = b1 & 0x80 != 0;

        let (payload_len, len_bytes) = match b1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
                if len <= SMALL_PAYLOAD_MAX as u64 {
                    return Err(Error::Protocol("extended length not minimal"));
                }
                (len, 2)
            }
            127 => {
                if buf.len() < 10 {
                    return Ok(None);
                }
                let len = u64::from_be_bytes([
                    buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
                ]);
                if len >> 63 != 0 {
                    return Err(Error::Protocol("payload length high bit set"));
                }
                if len <= MEDIUM_PAYLOAD_MAX as u64 {
                    return Err(Error::Protocol("extended length not minimal"));
                }
                (len, 8)
            }
            n => (n as u64, 0),
        };

        if opcode.is_control() {
            if !fin {
                return Err(Error::Protocol("fragmented control frame"));
            }
            if payload_len > SMALL_PAYLOAD_MAX as u64 {
                return Err(Error::Protocol("control frame payload over 125 bytes"));
            }
        }
        if payload_len > self.max_frame_size as u64 {
            return Err(Error::Protocol("frame exceeds configured maximum"));
        }
        let payload_len = payload_len as usize;

        let header_len = 2 + len_bytes + if masked { 4 } else { 0 };
        if buf.len() < header_len + payload_len {
            return Ok(None);
        }

        buf.advance(2 + len_bytes);
        let mask = if masked {
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[..4]);
            buf.advance(4);
            Some(key)
        } else {
            None
        };

        let mut payload = buf.split_to(payload_len);
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        Ok(Some(Frame {
            fin,
            opcode,
            mask,
            payload: payload.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_classes() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::Text.is_data());
        assert!(OpCode::Binary.is_data());
        assert!(OpCode::Continuation.is_data());
        assert!(OpCode::from_u8(0x3).is_none());
    }

    #[test]
    fn decode_small_unmasked() {
        let decoder = FrameDecoder::new(1024 * 1024);
        let mut buf = BytesMut::from(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_small_masked() {
        let decoder = FrameDecoder::new(1024 * 1024);
        let mask = [0x37, 0xfa, 0x21, 0x3d];

        let mut payload = *b"Hello";
        apply_mask(&mut payload, mask);

        let mut buf = BytesMut::new();
        buf.put_u8(0x81);
        buf.put_u8(0x85);
        buf.put_slice(&mask);
        buf.put_slice(&payload);

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload.as_ref(), b"Hello");
        assert_eq!(frame.mask, Some(mask));
    }

    #[test]
    fn round_trip_boundary_lengths() {
        let decoder = FrameDecoder::new(2 * 1024 * 1024);
        for len in [0usize, 1, 125, 126, 127, 65535, 65536, 100_000] {
            let payload = vec![0x42u8; len];
            let mask = [0xDE, 0xAD, 0xBE, 0xEF];

            let mut buf = BytesMut::new();
            encode_frame(&mut buf, OpCode::Binary, &payload, true, Some(mask));
            let encoded_len = buf.len();

            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert!(buf.is_empty(), "length {len}: exact consumption");
            assert_eq!(frame.opcode, OpCode::Binary);
            assert_eq!(frame.mask, Some(mask));
            assert_eq!(frame.payload.len(), len);
            assert_eq!(frame.payload.as_ref(), &payload[..]);

            let expected_header = 2
                + if len > MEDIUM_PAYLOAD_MAX {
                    8
                } else if len > SMALL_PAYLOAD_MAX {
                    2
                } else {
                    0
                }
                + 4;
            assert_eq!(encoded_len, expected_header + len);
        }
    }

    #[test]
    fn partial_frames_consume_nothing() {
        let decoder = FrameDecoder::new(1024 * 1024);
        let mut full = BytesMut::new();
        encode_frame(&mut full, OpCode::Text, b"fragmented read", true, Some([1, 2, 3, 4]));
        let full = full.freeze();

        for split in 0..full.len() {
            let mut buf = BytesMut::from(&full[..split]);
            assert!(decoder.decode(&mut buf).unwrap().is_none(), "split {split}");
            assert_eq!(buf.len(), split, "split {split}: nothing consumed");

            buf.extend_from_slice(&full[split..]);
            let frame = decoder.decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.payload.as_ref(), b"fragmented read");
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn rejects_oversized_frame() {
        let decoder = FrameDecoder::new(16);
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &[0u8; 64], true, None);

        assert!(matches!(
            decoder.decode(&mut buf),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn rejects_high_bit_length() {
        let decoder = FrameDecoder::new(usize::MAX);
        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(127);
        buf.put_u64(0x8000_0000_0000_0001);

        assert!(matches!(
            decoder.decode(&mut buf),
            Err(Error::Protocol("payload length high bit set"))
        ));
    }

    #[test]
    fn rejects_non_minimal_lengths() {
        let decoder = FrameDecoder::new(1024 * 1024);

        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(126);
        buf.put_u16(125);
        assert!(decoder.decode(&mut buf).is_err());

        let mut buf = BytesMut::new();
        buf.put_u8(0x82);
        buf.put_u8(127);
        buf.put_u64(65535);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_fragmented_control() {
        let decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&[0x09, 0x00][..]); // ping without FIN
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(Error::Protocol("fragmented control frame"))
        ));
    }

    #[test]
    fn rejects_oversized_control_payload() {
        let decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::new();
        buf.put_u8(0x89);
        buf.put_u8(126);
        buf.put_u16(200);
        buf.put_slice(&[0u8; 200]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn rejects_reserved_bits() {
        let decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::from(&[0xC1, 0x00][..]); // RSV1 set
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(Error::Protocol("reserved bits set"))
        ));
    }

    #[test]
    fn close_frame_payload() {
        let frame = Frame::close(1000, "goodbye");
        assert_eq!(frame.opcode, OpCode::Close);

        let close = frame.parse_close().unwrap().unwrap();
        assert_eq!(close.code, 1000);
        assert_eq!(close.reason, "goodbye");

        assert!(Frame::close_empty().parse_close().unwrap().is_none());
        assert_eq!(Frame::close(4000, "app code").parse_close().unwrap().unwrap().code, 4000);
    }

    #[test]
    fn rejects_one_byte_close_payload() {
        let frame = Frame::new(OpCode::Close, Bytes::copy_from_slice(&[0x03]), true);
        assert!(matches!(
            frame.parse_close(),
            Err(Error::Protocol("invalid close frame payload"))
        ));
    }

    #[test]
    fn rejects_reserved_close_codes() {
        for code in [1005u16, 1006, 2999, 5000] {
            let frame = Frame::close(code, "");
            assert!(
                matches!(frame.parse_close(), Err(Error::Protocol(_))),
                "code {code} must be rejected"
            );
        }
    }

    #[test]
    fn multiple_frames_in_one_buffer() {
        let decoder = FrameDecoder::new(1024);
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Text, b"one", true, None);
        encode_frame(&mut buf, OpCode::Text, b"two", true, None);

        let first = decoder.decode(&mut buf).unwrap().unwrap();
        let second = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"one");
        assert_eq!(second.payload.as_ref(), b"two");
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }
}
