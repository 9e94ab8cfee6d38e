//! The unit of exchange: a name, an ordered argument list and a header.
//!
//! The header carries the correlation metadata every layer relies on:
//!
//! | key          | meaning                                          |
//! |--------------|--------------------------------------------------|
//! | `message_id` | unique per conversation turn                     |
//! | `channel_id` | owning logical channel (absent for broadcast)    |
//! | `v`          | protocol version ([`PROTOCOL_VERSION`])          |
//!
//! # Example
//!
//! ```
//! use chanmux::{Envelope, Value};
//!
//! let envelope = Envelope::new("add", vec![Value::from(1), Value::from(2)]);
//! assert_eq!(envelope.name, "add");
//! assert!(envelope.header.message_id().is_some());
//! assert!(envelope.header.channel_id().is_none());
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

pub use rmpv::Value;

/// Protocol version stamped on every envelope.
pub const PROTOCOL_VERSION: u64 = 3;

/// Header key holding the message id.
pub const MESSAGE_ID_KEY: &str = "message_id";

/// Header key holding the channel id.
pub const CHANNEL_ID_KEY: &str = "channel_id";

/// Header key holding the protocol version.
pub const VERSION_KEY: &str = "v";

/// Counter wraps after 48 bits (12 hex digits).
const COUNTER_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// Identifier of one logical channel on a multiplexer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    /// Allocate a fresh id, never handed out before by this process.
    pub fn generate() -> Self {
        Self(next_message_id())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Fast unique ids: a random per-process base followed by a counter.
struct MessageIdGenerator {
    base: String,
    counter: AtomicU64,
}

impl MessageIdGenerator {
    fn new() -> Self {
        let mut base = uuid::Uuid::new_v4().simple().to_string();
        base.truncate(24);
        Self {
            base,
            counter: AtomicU64::new(0),
        }
    }

    fn next(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
        format!("{}{:012x}", self.base, counter)
    }
}

/// Generate a new message id.
pub fn next_message_id() -> String {
    static GENERATOR: OnceLock<MessageIdGenerator> = OnceLock::new();
    GENERATOR.get_or_init(MessageIdGenerator::new).next()
}

/// Read a header value as text; ids may arrive as str or bin.
fn value_as_text(value: &Value) -> Option<&str> {
    match value {
        Value::String(s) => s.as_str(),
        Value::Binary(b) => std::str::from_utf8(b).ok(),
        _ => None,
    }
}

/// Envelope header: an ordered string-to-value map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvelopeHeader(BTreeMap<String, Value>);

impl EnvelopeHeader {
    /// Create an empty header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a header with a fresh message id and the current version.
    pub fn stamped() -> Self {
        let mut header = Self::new();
        header.insert(MESSAGE_ID_KEY, Value::from(next_message_id()));
        header.insert(VERSION_KEY, Value::from(PROTOCOL_VERSION));
        header
    }

    /// Get a raw header value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Set a header value, replacing any previous one.
    pub fn insert(&mut self, key: &str, value: Value) {
        self.0.insert(key.to_string(), value);
    }

    /// Remove a header value.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// The message id, if present.
    pub fn message_id(&self) -> Option<&str> {
        self.get(MESSAGE_ID_KEY).and_then(value_as_text)
    }

    /// The owning channel id, if present.
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.get(CHANNEL_ID_KEY)
            .and_then(value_as_text)
            .map(ChannelId::from)
    }

    /// Attach or overwrite the channel id.
    pub fn set_channel_id(&mut self, id: &ChannelId) {
        self.insert(CHANNEL_ID_KEY, Value::from(id.as_str()));
    }

    /// The protocol version, if present.
    pub fn version(&self) -> Option<u64> {
        self.get(VERSION_KEY).and_then(Value::as_u64)
    }

    /// Number of header entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the header has no entries.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// One event exchanged over a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Event name.
    pub name: String,
    /// Ordered arguments.
    pub args: Vec<Value>,
    /// Correlation metadata.
    pub header: EnvelopeHeader,
}

impl Envelope {
    /// Create an envelope with a fresh message id.
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
            header: EnvelopeHeader::stamped(),
        }
    }

    /// Create an envelope from already-built parts.
    pub fn from_parts(header: EnvelopeHeader, name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
            header,
        }
    }

    /// The owning channel id, if any.
    #[inline]
    pub fn channel_id(&self) -> Option<ChannelId> {
        self.header.channel_id()
    }

    /// Whether this envelope is addressed to no channel (broadcast).
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        self.header.channel_id().is_none()
    }
}
