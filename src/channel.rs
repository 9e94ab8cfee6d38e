//! Logical channels over a multiplexer.
//!
//! [`EventChannel`] is the interface every layer of the stack implements:
//! the raw [`Channel`], [`HeartbeatChannel`](crate::HeartbeatChannel) and
//! [`BufferedChannel`](crate::BufferedChannel). Wrappers are generic over
//! it, so layers compose in any order the application needs.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::envelope::{ChannelId, Envelope, Value};
use crate::error::{ChannelError, Result};
use crate::multiplexer::MuxShared;

/// One logical, ordered, bidirectional conversation.
pub trait EventChannel: Send + Sync + 'static {
    /// Identifier shared by both ends of the conversation.
    fn channel_id(&self) -> &ChannelId;

    /// Send a prepared envelope.
    fn emit_envelope(&self, envelope: Envelope) -> impl Future<Output = Result<()>> + Send;

    /// Send an event built from a name and arguments.
    fn emit(&self, name: &str, args: Vec<Value>) -> impl Future<Output = Result<()>> + Send {
        self.emit_envelope(Envelope::new(name, args))
    }

    /// Receive the next envelope.
    ///
    /// With `Some(timeout)` the call fails with [`ChannelError::Timeout`]
    /// once the deadline passes; the channel stays usable.
    fn recv(&self, timeout: Option<Duration>) -> impl Future<Output = Result<Envelope>> + Send;

    /// Close this layer and every layer below it. Idempotent.
    fn close(&self);

    /// Whether `close` has been called.
    fn is_closed(&self) -> bool;
}

/// Await `future`, failing with [`ChannelError::Timeout`] after `timeout`.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| ChannelError::Timeout(limit))?,
        None => future.await,
    }
}

/// A channel registered on a [`Multiplexer`](crate::Multiplexer).
///
/// Its queue is fed only by the multiplexer's dispatch loop and is
/// unbounded; flow control belongs to
/// [`BufferedChannel`](crate::BufferedChannel).
pub struct Channel {
    id: ChannelId,
    mux: Arc<MuxShared>,
    queue: Mutex<mpsc::UnboundedReceiver<Envelope>>,
    closed: AtomicBool,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, mux: Arc<MuxShared>, queue: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self {
            id,
            mux,
            queue: Mutex::new(queue),
            closed: AtomicBool::new(false),
        }
    }

    async fn next(&self) -> Result<Envelope> {
        let mut queue = self.queue.lock().await;
        match queue.recv().await {
            Some(envelope) => Ok(envelope),
            None if self.closed.load(Ordering::Acquire) => Err(ChannelError::Closed),
            None => Err(ChannelError::LostRemote("connection closed".to_string())),
        }
    }
}

impl EventChannel for Channel {
    fn channel_id(&self) -> &ChannelId {
        &self.id
    }

    async fn emit_envelope(&self, envelope: Envelope) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.mux.emit(&self.id, envelope).await
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Envelope> {
        with_timeout(timeout, self.next()).await
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Closing channel {}", self.id);
            self.mux.deregister(&self.id);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
