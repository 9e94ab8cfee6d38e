//! Frame buffer for accumulating partial reads.
//!
//! Implements a small state machine over a single `BytesMut`:
//! - `WaitingForHeader`: need at least 5 bytes
//! - `WaitingForPayload`: header parsed, need N more payload bytes

use bytes::{Bytes, BytesMut};

use super::wire_format::{FrameHeader, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};
use super::Frame;
use crate::error::Result;

/// Initial read buffer capacity.
const INITIAL_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Clone)]
enum State {
    WaitingForHeader,
    WaitingForPayload { header: FrameHeader },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    buffer: BytesMut,
    state: State,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default maximum frame size.
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom maximum payload size.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            state: State::WaitingForHeader,
            max_payload_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` on an unknown framing version or an oversized payload.
    /// The stream cannot be resynchronized after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = match FrameHeader::decode(&self.buffer) {
                        Some(header) => header,
                        None => return Ok(None),
                    };
                    header.validate(self.max_payload_size)?;

                    let _ = self.buffer.split_to(FRAME_HEADER_SIZE);

                    if header.payload_length == 0 {
                        return Ok(Some(Frame::new(header, Bytes::new())));
                    }
                    self.state = State::WaitingForPayload { header };
                }

                State::WaitingForPayload { header } => {
                    let remaining = header.payload_length as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    let header = *header;
                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Frame::new(header, payload)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
