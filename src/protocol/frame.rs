//! A complete frame: header plus payload.
//!
//! Uses `bytes::Bytes` so the payload is shared, not copied, on its way to
//! the envelope decoder.

use bytes::Bytes;

use super::wire_format::{FrameHeader, FRAME_HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded header.
    pub header: FrameHeader,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame from header and payload.
    pub fn new(header: FrameHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Get a reference to the payload bytes.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Build a complete frame as a single byte vector.
///
/// # Example
///
/// ```
/// use chanmux::protocol::build_frame;
///
/// let bytes = build_frame(b"hello");
/// assert_eq!(bytes.len(), 5 + 5);
/// ```
pub fn build_frame(payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(payload.len() as u32);
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
