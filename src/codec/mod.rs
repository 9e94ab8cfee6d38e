//! Codec module - payload serialization.
//!
//! - [`MsgPackCodec`] - generic msgpack helpers over serde
//! - [`EnvelopeCodec`] - envelopes to and from frame payloads
//!
//! Codecs are marker structs with static methods, selected at compile time.

mod msgpack;

pub use msgpack::{EnvelopeCodec, MsgPackCodec};
