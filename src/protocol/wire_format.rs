//! Wire format encoding and decoding.
//!
//! Every envelope travels in one frame with a 5-byte header:
//! ```text
//! ┌─────────┬──────────┐
//! │ Version │ Length   │
//! │ 1 byte  │ 4 bytes  │
//! │         │ uint32 BE│
//! └─────────┴──────────┘
//! ```

use crate::error::{ChannelError, Result};

/// Frame header size in bytes (fixed, exactly 5).
pub const FRAME_HEADER_SIZE: usize = 5;

/// Framing version written by this crate.
pub const FRAME_VERSION: u8 = 1;

/// Default maximum payload size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Framing version.
    pub version: u8,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Create a header for a payload of the given length.
    pub fn new(payload_length: u32) -> Self {
        Self {
            version: FRAME_VERSION,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use chanmux::protocol::FrameHeader;
    ///
    /// let bytes = FrameHeader::new(100).encode();
    /// assert_eq!(bytes, [1, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0] = self.version;
        buf[1..5].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes. Returns `None` if the buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(Self {
            version: buf[0],
            payload_length: u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]),
        })
    }

    /// Validate version and payload size.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if self.version != FRAME_VERSION {
            return Err(ChannelError::Protocol(format!(
                "Unsupported frame version {}",
                self.version
            )));
        }

        if self.payload_length > max_payload_size {
            return Err(ChannelError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_length() {
        let bytes = FrameHeader::new(0x0102_0304).encode();
        assert_eq!(bytes, [FRAME_VERSION, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(FrameHeader::decode(&[1, 0, 0, 0]).is_none());
    }

    #[test]
    fn test_decode_reads_fields() {
        let header = FrameHeader::decode(&[1, 0, 0, 1, 0]).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.payload_length, 256);
    }

    #[test]
    fn test_validate_unknown_version() {
        let header = FrameHeader {
            version: 9,
            payload_length: 0,
        };
        let err = header.validate(DEFAULT_MAX_FRAME_SIZE).unwrap_err();
        assert!(err.to_string().contains("Unsupported frame version 9"));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let err = FrameHeader::new(1_000).validate(100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }
}
