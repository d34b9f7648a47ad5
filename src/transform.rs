//! Payload transform plug-in point
//!
//! A transform is applied to outgoing data-message payloads after the user
//! hands them over and to incoming ones before delivery. It operates
//! entirely outside the framing layer: transformed bytes travel in ordinary
//! TEXT/BINARY frames with no reserved bits set, so both endpoints must
//! agree on the transform out of band.
//!
//! RFC 7692 `permessage-deflate` is deliberately not expressible through
//! this trait, because it requires ownership of the RSV1 bit and negotiated
//! sliding windows. Configuring it as an extension token is rejected at
//! connect time instead of silently producing non-conformant frames.

use crate::error::Result;

/// Two-way transform over data-message payloads
pub trait PayloadTransform: Send + Sync {
    /// Transform an outgoing payload before it is framed
    fn compress(&self, payload: &[u8]) -> Result<Vec<u8>>;

    /// Undo the transform on a received payload before delivery
    fn decompress(&self, payload: &[u8]) -> Result<Vec<u8>>;
}
