//! Protocol module - framing of envelopes on a byte stream.
//!
//! - 5-byte frame header encoding/decoding
//! - Frame buffer for accumulating partial reads

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use wire_format::{FrameHeader, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, FRAME_VERSION};
