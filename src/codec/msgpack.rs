//! MsgPack codecs using `rmp-serde`.
//!
//! An envelope travels as the msgpack array `[header, name, args]`:
//!
//! ```text
//! [ {"message_id": "...", "channel_id": "...", "v": 3}, "add", [1, 2] ]
//! ```
//!
//! # Example
//!
//! ```
//! use chanmux::codec::EnvelopeCodec;
//! use chanmux::{Envelope, Value};
//!
//! let envelope = Envelope::new("add", vec![Value::from(1), Value::from(2)]);
//! let bytes = EnvelopeCodec::encode(&envelope).unwrap();
//! let decoded = EnvelopeCodec::decode(&bytes).unwrap();
//! assert_eq!(decoded, envelope);
//! ```

use bytes::Bytes;

use crate::envelope::{Envelope, EnvelopeHeader, Value, MESSAGE_ID_KEY};
use crate::error::{ChannelError, Result};

/// MessagePack codec for structured data.
///
/// Structs are written as maps (`to_vec_named`), never positionally.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Codec between [`Envelope`] and frame payloads.
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    /// Encode an envelope into a frame payload.
    pub fn encode(envelope: &Envelope) -> Result<Bytes> {
        let payload = MsgPackCodec::encode(&(&envelope.header, &envelope.name, &envelope.args))?;
        Ok(Bytes::from(payload))
    }

    /// Decode and validate a frame payload.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the payload is not `[header, name, args]`, the
    /// header has no `message_id`, or the name is not a string.
    pub fn decode(bytes: &[u8]) -> Result<Envelope> {
        let value: Value = MsgPackCodec::decode(bytes)?;

        let mut parts = match value {
            Value::Array(parts) if parts.len() == 3 => parts.into_iter(),
            _ => return Err(protocol("expected array of size 3")),
        };
        let (header, name, args) = match (parts.next(), parts.next(), parts.next()) {
            (Some(header), Some(name), Some(args)) => (header, name, args),
            _ => return Err(protocol("expected array of size 3")),
        };

        let header = decode_header(header)?;
        if header.message_id().is_none() {
            return Err(protocol("bad header: missing message_id"));
        }

        let name = match name {
            Value::String(s) => s
                .into_str()
                .ok_or_else(|| protocol("bad name: invalid utf-8"))?,
            _ => return Err(protocol("bad name")),
        };

        let args = match args {
            Value::Array(args) => args,
            Value::Nil => Vec::new(),
            single => vec![single],
        };

        Ok(Envelope::from_parts(header, name, args))
    }
}

fn decode_header(value: Value) -> Result<EnvelopeHeader> {
    let entries = match value {
        Value::Map(entries) => entries,
        _ => return Err(protocol("bad header: expected map")),
    };

    let mut header = EnvelopeHeader::new();
    for (key, value) in entries {
        match key {
            Value::String(key) => match key.as_str() {
                Some(key) => header.insert(key, value),
                None => return Err(protocol("bad header: invalid utf-8 key")),
            },
            _ => return Err(protocol("bad header: non-string key")),
        }
    }
    if header.get(MESSAGE_ID_KEY).is_none() {
        return Err(protocol("bad header: missing message_id"));
    }
    Ok(header)
}

fn protocol(message: &str) -> ChannelError {
    ChannelError::Protocol(format!("Invalid envelope: {}", message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::ChannelId;

    fn raw(value: Value) -> Vec<u8> {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();
        buf
    }

    fn header_map(message_id: &str) -> Value {
        Value::Map(vec![
            (Value::from("message_id"), Value::from(message_id)),
            (Value::from("v"), Value::from(3)),
        ])
    }

    #[test]
    fn test_envelope_layout_is_three_element_array() {
        let envelope = Envelope::new("add", vec![Value::from(1), Value::from(2)]);
        let bytes = EnvelopeCodec::encode(&envelope).unwrap();

        // fixarray with 3 elements, then a fixmap header
        assert_eq!(bytes[0], 0x93);
        assert_eq!(bytes[1] & 0xF0, 0x80);
    }

    #[test]
    fn test_header_fields_survive() {
        let mut envelope = Envelope::new("OK", vec![Value::from("done")]);
        let id = ChannelId::generate();
        envelope.header.set_channel_id(&id);

        let decoded = EnvelopeCodec::decode(&EnvelopeCodec::encode(&envelope).unwrap()).unwrap();

        assert_eq!(decoded.channel_id(), Some(id));
        assert_eq!(decoded.header.message_id(), envelope.header.message_id());
        assert_eq!(decoded.header.version(), Some(3));
        assert_eq!(decoded.args, vec![Value::from("done")]);
    }

    #[test]
    fn test_scalar_args_become_single_argument() {
        let bytes = raw(Value::Array(vec![
            header_map("m1"),
            Value::from("coucou"),
            Value::from(7),
        ]));

        let envelope = EnvelopeCodec::decode(&bytes).unwrap();
        assert_eq!(envelope.args, vec![Value::from(7)]);
    }

    #[test]
    fn test_nil_args_become_empty() {
        let bytes = raw(Value::Array(vec![
            header_map("m1"),
            Value::from("openthat"),
            Value::Nil,
        ]));

        let envelope = EnvelopeCodec::decode(&bytes).unwrap();
        assert!(envelope.args.is_empty());
    }

    #[test]
    fn test_rejects_wrong_arity() {
        let bytes = raw(Value::Array(vec![header_map("m1"), Value::from("x")]));
        let err = EnvelopeCodec::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("array of size 3"));
    }

    #[test]
    fn test_rejects_header_without_message_id() {
        let header = Value::Map(vec![(Value::from("v"), Value::from(3))]);
        let bytes = raw(Value::Array(vec![header, Value::from("x"), Value::Nil]));
        let err = EnvelopeCodec::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("message_id"));
    }

    #[test]
    fn test_rejects_non_string_name() {
        let bytes = raw(Value::Array(vec![header_map("m1"), Value::from(5), Value::Nil]));
        let err = EnvelopeCodec::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("bad name"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(EnvelopeCodec::decode(b"\xc1").is_err());
    }

    #[test]
    fn test_binary_args_stay_binary() {
        let envelope = Envelope::new("blob", vec![Value::Binary(vec![1, 2, 3])]);
        let bytes = EnvelopeCodec::encode(&envelope).unwrap();
        let decoded = EnvelopeCodec::decode(&bytes).unwrap();
        assert_eq!(decoded.args, vec![Value::Binary(vec![1, 2, 3])]);
    }

    #[test]
    fn test_msgpack_struct_as_map() {
        #[derive(serde::Serialize)]
        struct Pair {
            a: u8,
            b: u8,
        }

        let encoded = MsgPackCodec::encode(&Pair { a: 1, b: 2 }).unwrap();
        assert_eq!(encoded[0], 0x82);
    }
}
