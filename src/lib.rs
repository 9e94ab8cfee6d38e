//! # chanmux
//!
//! The channel layer of a message-oriented RPC transport: many logical
//! conversations over one connection, with liveness detection and
//! credit-based flow control.
//!
//! ## Architecture
//!
//! ```text
//!  BufferedChannel   local buffer, credit grants, congestion
//!        │
//!  HeartbeatChannel  pulses, watchdog, lost-remote detection
//!        │
//!  Channel           one id, one ordered queue
//!        │
//!  Multiplexer       dispatch loop + writer task over one stream
//! ```
//!
//! Every layer implements [`EventChannel`]; [`ReliableChannel`] is the
//! full stack. Envelopes travel as msgpack `[header, name, args]` inside
//! length-prefixed frames.
//!
//! ## Example
//!
//! ```ignore
//! use chanmux::{ChannelConfig, EventChannel, Multiplexer, MultiplexerConfig, Value};
//!
//! #[tokio::main]
//! async fn main() -> chanmux::Result<()> {
//!     let stream = tokio::net::TcpStream::connect("127.0.0.1:4242").await?;
//!     let mux = Multiplexer::new(stream, MultiplexerConfig::initiator());
//!     let config = ChannelConfig::default();
//!
//!     let channel = config.wrap(mux.channel());
//!     channel.emit("add", vec![Value::from(1), Value::from(2)]).await?;
//!     let reply = channel.recv(Some(std::time::Duration::from_secs(3))).await?;
//!     println!("{} {:?}", reply.name, reply.args);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod config;
pub mod credit;
pub mod error;
pub mod protocol;
#[cfg(unix)]
pub mod transport;
pub mod writer;

mod buffered;
mod channel;
mod envelope;
mod heartbeat;
mod multiplexer;

pub use buffered::{BufferedChannel, ClosePredicate, ReliableChannel};
pub use channel::{Channel, EventChannel};
pub use config::{BufferedConfig, ChannelConfig, HeartbeatConfig, MultiplexerConfig};
pub use envelope::{
    next_message_id, ChannelId, Envelope, EnvelopeHeader, Value, CHANNEL_ID_KEY, MESSAGE_ID_KEY, PROTOCOL_VERSION,
    VERSION_KEY,
};
pub use error::{ChannelError, Result};
pub use heartbeat::{HeartbeatChannel, HeartbeatState};
pub use multiplexer::Multiplexer;
