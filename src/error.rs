//! Error types for chanmux.
//!
//! Callers must be able to tell "the peer is gone" ([`ChannelError::LostRemote`])
//! apart from "no reply within my own deadline" ([`ChannelError::Timeout`]).
//! Congestion is not an error: see
//! [`BufferedChannel::try_emit`](crate::BufferedChannel::try_emit).

use std::time::Duration;

use thiserror::Error;

/// Main error type for all channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The peer is presumed unreachable (heartbeat expired or connection gone).
    #[error("Lost remote: {0}")]
    LostRemote(String),

    /// A caller-supplied deadline elapsed.
    #[error("Timeout expired after {0:?}")]
    Timeout(Duration),

    /// The channel was closed locally.
    #[error("Channel closed")]
    Closed,

    /// The multiplexer's connection is closed; nothing can be sent.
    #[error("Connection closed")]
    ConnectionClosed,

    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error (configuration loading only).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol error (invalid frame or envelope, credit overrun, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl ChannelError {
    /// Whether this is a liveness failure.
    pub fn is_lost_remote(&self) -> bool {
        matches!(self, ChannelError::LostRemote(_))
    }

    /// Whether this is an expired caller deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout(_))
    }
}

/// Result type alias using ChannelError.
pub type Result<T> = std::result::Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ChannelError::LostRemote("gone".into()).is_lost_remote());
        assert!(!ChannelError::LostRemote("gone".into()).is_timeout());
        assert!(ChannelError::Timeout(Duration::from_secs(3)).is_timeout());
        assert!(!ChannelError::Closed.is_lost_remote());
    }

    #[test]
    fn test_display() {
        let err = ChannelError::LostRemote("heartbeat expired".into());
        assert_eq!(err.to_string(), "Lost remote: heartbeat expired");

        let err = ChannelError::Timeout(Duration::from_secs(3));
        assert_eq!(err.to_string(), "Timeout expired after 3s");
    }
}
