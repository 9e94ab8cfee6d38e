//! Configuration for every layer of the stack.
//!
//! Typed configs ([`MultiplexerConfig`], [`HeartbeatConfig`],
//! [`BufferedConfig`]) are plain structs with `Default` impls and fluent
//! setters. [`ChannelConfig`] is the serde-facing aggregate, loadable from
//! JSON, that converts into the typed ones.
//!
//! Both peers of a conversation must agree out of band on the heartbeat
//! period, the control envelope names and the bootstrap credit.
//!
//! # Example
//!
//! ```
//! use chanmux::ChannelConfig;
//! use std::time::Duration;
//!
//! let config = ChannelConfig::from_json_str(r#"{ "heartbeat_secs": 2.0 }"#).unwrap();
//! assert_eq!(config.heartbeat().period, Duration::from_secs(2));
//! assert_eq!(config.buffered().capacity, 100);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::channel::Channel;
use crate::credit::{DEFAULT_BOOTSTRAP_CREDIT, DEFAULT_CAPACITY};
use crate::error::{ChannelError, Result};
use crate::protocol::DEFAULT_MAX_FRAME_SIZE;
use crate::writer::WriterConfig;
use crate::{BufferedChannel, HeartbeatChannel, ReliableChannel};

/// Default heartbeat period.
pub const DEFAULT_HEARTBEAT_PERIOD: Duration = Duration::from_secs(5);

/// Reserved name of heartbeat pulse envelopes.
pub const DEFAULT_PULSE_NAME: &str = "_zpc_hb";

/// Reserved name of credit grant envelopes.
pub const DEFAULT_CREDIT_NAME: &str = "_zpc_more";

/// Default number of pending or closed routes remembered by a multiplexer.
pub const DEFAULT_MAX_INACTIVE_ROUTES: usize = 1024;

/// Multiplexer configuration.
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Drop envelopes that belong to no open channel instead of queuing
    /// them for [`Multiplexer::recv`](crate::Multiplexer::recv).
    pub ignore_broadcast: bool,
    /// Writer task settings.
    pub writer: WriterConfig,
    /// Largest accepted inbound frame payload.
    pub max_frame_size: u32,
    /// Pending and closed routes kept before the oldest are forgotten.
    pub max_inactive_routes: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            ignore_broadcast: false,
            writer: WriterConfig::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_inactive_routes: DEFAULT_MAX_INACTIVE_ROUTES,
        }
    }
}

impl MultiplexerConfig {
    /// Configuration for a pure initiator that never accepts new channels.
    pub fn initiator() -> Self {
        Self::default().ignore_broadcast(true)
    }

    /// Set whether broadcast traffic is dropped.
    pub fn ignore_broadcast(mut self, ignore: bool) -> Self {
        self.ignore_broadcast = ignore;
        self
    }

    /// Set the maximum inbound frame payload.
    pub fn max_frame_size(mut self, size: u32) -> Self {
        self.max_frame_size = size;
        self
    }
}

/// Heartbeat configuration.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Pulse period. The peer is lost after twice this much silence.
    pub period: Duration,
    /// Stay dormant until the peer's first pulse arrives.
    pub passive: bool,
    /// Reserved name of pulse envelopes.
    pub pulse_name: String,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_HEARTBEAT_PERIOD,
            passive: false,
            pulse_name: DEFAULT_PULSE_NAME.to_string(),
        }
    }
}

impl HeartbeatConfig {
    /// Configuration with the given period.
    pub fn with_period(period: Duration) -> Self {
        Self {
            period,
            ..Self::default()
        }
    }

    /// Set passive mode.
    pub fn passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    /// Set the pulse envelope name.
    pub fn pulse_name(mut self, name: impl Into<String>) -> Self {
        self.pulse_name = name.into();
        self
    }

    /// Silence after which the peer is considered lost.
    pub fn lost_after(&self) -> Duration {
        self.period * 2
    }
}

/// Buffered channel configuration.
#[derive(Debug, Clone)]
pub struct BufferedConfig {
    /// Receive buffer capacity and steady-state credit window.
    pub capacity: usize,
    /// Credit each side assumes before the first grant.
    pub bootstrap_credit: usize,
    /// Reserved name of credit grant envelopes.
    pub credit_name: String,
}

impl Default for BufferedConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            bootstrap_credit: DEFAULT_BOOTSTRAP_CREDIT,
            credit_name: DEFAULT_CREDIT_NAME.to_string(),
        }
    }
}

impl BufferedConfig {
    /// Configuration with the given capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    /// Set the bootstrap credit.
    pub fn bootstrap_credit(mut self, credit: usize) -> Self {
        self.bootstrap_credit = credit;
        self
    }

    /// Set the credit envelope name.
    pub fn credit_name(mut self, name: impl Into<String>) -> Self {
        self.credit_name = name.into();
        self
    }
}

/// Serializable configuration for the standard channel stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Heartbeat period in seconds.
    pub heartbeat_secs: f64,
    /// Start the heartbeat only once the peer pulses.
    pub passive_heartbeat: bool,
    /// Buffer capacity.
    pub capacity: usize,
    /// Bootstrap credit.
    pub bootstrap_credit: usize,
    /// Pure initiator mode.
    pub ignore_broadcast: bool,
    /// Pulse envelope name.
    pub pulse_name: String,
    /// Credit envelope name.
    pub credit_name: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: DEFAULT_HEARTBEAT_PERIOD.as_secs_f64(),
            passive_heartbeat: false,
            capacity: DEFAULT_CAPACITY,
            bootstrap_credit: DEFAULT_BOOTSTRAP_CREDIT,
            ignore_broadcast: false,
            pulse_name: DEFAULT_PULSE_NAME.to_string(),
            credit_name: DEFAULT_CREDIT_NAME.to_string(),
        }
    }
}

impl ChannelConfig {
    /// Parse and validate a JSON configuration.
    ///
    /// Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values describe a usable stack.
    pub fn validate(&self) -> Result<()> {
        if !self.heartbeat_secs.is_finite() || self.heartbeat_secs <= 0.0 {
            return Err(invalid("heartbeat_secs must be a positive number"));
        }
        if self.capacity == 0 {
            return Err(invalid("capacity must be at least 1"));
        }
        if self.bootstrap_credit == 0 || self.bootstrap_credit > self.capacity {
            return Err(invalid("bootstrap_credit must be between 1 and capacity"));
        }
        if self.pulse_name.is_empty() || self.credit_name.is_empty() {
            return Err(invalid("control envelope names must not be empty"));
        }
        if self.pulse_name == self.credit_name {
            return Err(invalid("pulse_name and credit_name must differ"));
        }
        Ok(())
    }

    /// Multiplexer settings.
    pub fn multiplexer(&self) -> MultiplexerConfig {
        MultiplexerConfig::default().ignore_broadcast(self.ignore_broadcast)
    }

    /// Heartbeat settings.
    pub fn heartbeat(&self) -> HeartbeatConfig {
        HeartbeatConfig::with_period(Duration::from_secs_f64(self.heartbeat_secs))
            .passive(self.passive_heartbeat)
            .pulse_name(self.pulse_name.clone())
    }

    /// Buffered channel settings.
    pub fn buffered(&self) -> BufferedConfig {
        BufferedConfig::with_capacity(self.capacity)
            .bootstrap_credit(self.bootstrap_credit)
            .credit_name(self.credit_name.clone())
    }

    /// Wrap a raw channel in the heartbeat and buffered layers.
    ///
    /// Must be called from within a tokio runtime.
    pub fn wrap(&self, channel: Channel) -> ReliableChannel {
        BufferedChannel::new(HeartbeatChannel::new(channel, self.heartbeat()), self.buffered())
    }
}

fn invalid(message: &str) -> ChannelError {
    ChannelError::Protocol(format!("Invalid configuration: {}", message))
}
