//! Transport module - connected byte streams for the multiplexer.
//!
//! Any `AsyncRead + AsyncWrite` stream works (TCP, in-memory duplex);
//! Unix-domain socket helpers live here.

mod pipe;

pub use pipe::{generate_pipe_path, PipeListener, PipeStream};
