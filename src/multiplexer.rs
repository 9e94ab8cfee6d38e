//! Channel multiplexer: many logical channels over one connection.
//!
//! ```text
//!                        ┌──────────────────────────────┐
//!  stream ─► read half ─►│ dispatch loop                │
//!                        │   FrameBuffer → EnvelopeCodec│
//!                        │   routes by channel_id ──────┼─► Channel queues
//!                        │   unknown ids ───────────────┼─► broadcast (recv)
//!                        └──────────────────────────────┘
//!  Channel::emit ─► WriterHandle ─► writer task ─► write half
//! ```
//!
//! The dispatch loop is the only reader of the connection and the only
//! producer into channel queues. When it stops (end of stream, read error
//! or [`Multiplexer::close`]) every queue sender is dropped, so blocked
//! receivers fail with [`ChannelError::LostRemote`].
//!
//! # Example
//!
//! ```ignore
//! let client = Multiplexer::new(stream_a, MultiplexerConfig::initiator());
//! let server = Multiplexer::new(stream_b, MultiplexerConfig::default());
//!
//! let channel = client.channel();
//! channel.emit("hello", vec![]).await?;
//!
//! let first = server.recv().await?;
//! let remote = server.channel_from(first)?;
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::channel::Channel;
use crate::codec::EnvelopeCodec;
use crate::config::MultiplexerConfig;
use crate::envelope::{ChannelId, Envelope};
use crate::error::{ChannelError, Result};
use crate::protocol::FrameBuffer;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Read buffer size for the dispatch loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Envelopes held for one id seen on the broadcast path but not yet bound.
const MAX_HELD_PER_ROUTE: usize = 128;

enum Route {
    Open(mpsc::UnboundedSender<Envelope>),
    /// Announced on the broadcast path; later envelopes wait here.
    Pending(Vec<Envelope>),
    /// Closed locally; late envelopes are dropped.
    Closed,
}

enum Dispatch {
    Delivered,
    Broadcast(Envelope),
    Dropped(Envelope, &'static str),
}

/// Channel id to route mapping, owned by [`MuxShared`].
struct RoutingTable {
    routes: HashMap<ChannelId, Route>,
    inactive: VecDeque<ChannelId>,
    max_inactive: usize,
    accept_broadcast: bool,
}

impl RoutingTable {
    fn new(config: &MultiplexerConfig) -> Self {
        Self {
            routes: HashMap::new(),
            inactive: VecDeque::new(),
            max_inactive: config.max_inactive_routes,
            accept_broadcast: !config.ignore_broadcast,
        }
    }

    fn dispatch(&mut self, envelope: Envelope) -> Dispatch {
        let id = match envelope.channel_id() {
            Some(id) => id,
            None if self.accept_broadcast => return Dispatch::Broadcast(envelope),
            None => return Dispatch::Dropped(envelope, "broadcast ignored"),
        };

        match self.routes.get_mut(&id) {
            Some(Route::Open(tx)) => match tx.send(envelope) {
                Ok(()) => Dispatch::Delivered,
                Err(mpsc::error::SendError(envelope)) => Dispatch::Dropped(envelope, "channel queue gone"),
            },
            Some(Route::Pending(held)) => {
                if held.len() >= MAX_HELD_PER_ROUTE {
                    Dispatch::Dropped(envelope, "too many envelopes for an unbound channel")
                } else {
                    held.push(envelope);
                    Dispatch::Delivered
                }
            }
            Some(Route::Closed) => Dispatch::Dropped(envelope, "channel closed"),
            None if self.accept_broadcast => {
                self.remember(id, Route::Pending(Vec::new()));
                Dispatch::Broadcast(envelope)
            }
            None => Dispatch::Dropped(envelope, "unknown channel"),
        }
    }

    /// Register a freshly generated id.
    fn open_new(&mut self, id: ChannelId) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.routes.insert(id, Route::Open(tx));
        rx
    }

    /// Bind `id`, queuing `first` ahead of anything held for it.
    fn bind(&mut self, id: ChannelId, first: Envelope) -> Result<mpsc::UnboundedReceiver<Envelope>> {
        let held = match self.routes.get_mut(&id) {
            Some(Route::Open(_)) => {
                return Err(ChannelError::Protocol(format!("channel {} is already open", id)));
            }
            Some(Route::Pending(held)) => std::mem::take(held),
            Some(Route::Closed) | None => Vec::new(),
        };
        self.inactive.retain(|inactive| inactive != &id);

        let (tx, rx) = mpsc::unbounded_channel();
        for envelope in std::iter::once(first).chain(held) {
            let _ = tx.send(envelope);
        }
        self.routes.insert(id, Route::Open(tx));
        Ok(rx)
    }

    fn close(&mut self, id: &ChannelId) {
        if let Some(route) = self.routes.get_mut(id) {
            if matches!(route, Route::Open(_)) {
                *route = Route::Closed;
                self.inactive.push_back(id.clone());
                self.evict();
            }
        }
    }

    fn remember(&mut self, id: ChannelId, route: Route) {
        self.routes.insert(id.clone(), route);
        self.inactive.push_back(id);
        self.evict();
    }

    fn evict(&mut self) {
        while self.inactive.len() > self.max_inactive {
            let Some(id) = self.inactive.pop_front() else {
                break;
            };
            if matches!(self.routes.get(&id), Some(Route::Pending(_) | Route::Closed)) {
                self.routes.remove(&id);
            }
        }
    }

    fn open_count(&self) -> usize {
        self.routes
            .values()
            .filter(|route| matches!(route, Route::Open(_)))
            .count()
    }

    fn clear(&mut self) {
        self.routes.clear();
        self.inactive.clear();
    }
}

/// State shared between the multiplexer, its channels and its tasks.
pub(crate) struct MuxShared {
    writer: WriterHandle,
    routes: Mutex<RoutingTable>,
    closed: CancellationToken,
    max_frame_size: u32,
}

impl MuxShared {
    fn routes(&self) -> MutexGuard<'_, RoutingTable> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Tag `envelope` with `channel_id` and queue it for writing.
    pub(crate) async fn emit(&self, channel_id: &ChannelId, mut envelope: Envelope) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::ConnectionClosed);
        }
        envelope.header.set_channel_id(channel_id);
        let payload = EnvelopeCodec::encode(&envelope)?;
        // The peer drops the whole connection on an oversized frame.
        if payload.len() > self.max_frame_size as usize {
            return Err(ChannelError::Protocol(format!(
                "envelope {} is {} bytes, frame limit is {}",
                envelope.name,
                payload.len(),
                self.max_frame_size
            )));
        }
        self.writer.send(OutboundFrame::new(payload)?).await
    }

    pub(crate) fn deregister(&self, id: &ChannelId) {
        self.routes().close(id);
    }

    /// Run `open` on the routing table unless the connection is closed.
    ///
    /// The closed check happens under the routing lock, so a concurrent
    /// `shutdown` either sees the new route and clears it, or this returns
    /// `None` and nothing is registered.
    fn register<T>(&self, open: impl FnOnce(&mut RoutingTable) -> T) -> Option<T> {
        let mut routes = self.routes();
        if self.closed.is_cancelled() {
            return None;
        }
        Some(open(&mut routes))
    }

    /// Dead queue for channels created after shutdown.
    fn dead_queue() -> mpsc::UnboundedReceiver<Envelope> {
        mpsc::unbounded_channel().1
    }

    fn route(&self, envelope: Envelope, broadcast: Option<&mpsc::UnboundedSender<Envelope>>) {
        let dispatch = self.routes().dispatch(envelope);
        match dispatch {
            Dispatch::Delivered => {}
            Dispatch::Broadcast(envelope) => match broadcast {
                Some(tx) => {
                    if tx.send(envelope).is_err() {
                        tracing::debug!("Broadcast receiver gone");
                    }
                }
                None => tracing::debug!("Ignoring broadcast envelope {}", envelope.name),
            },
            Dispatch::Dropped(envelope, reason) => {
                tracing::debug!("Dropping envelope {}: {}", envelope.name, reason);
            }
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        self.writer.shutdown();
        self.routes().clear();
    }
}

/// Owner of one connection, demultiplexing it into channels.
///
/// Dropping the multiplexer closes the connection.
pub struct Multiplexer {
    shared: Arc<MuxShared>,
    broadcast: Option<AsyncMutex<mpsc::UnboundedReceiver<Envelope>>>,
    tasks: TaskTracker,
}

impl Multiplexer {
    /// Take ownership of a connected stream and start its tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new<S>(stream: S, config: MultiplexerConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(writer, config.writer.clone());

        let shared = Arc::new(MuxShared {
            writer,
            routes: Mutex::new(RoutingTable::new(&config)),
            closed: CancellationToken::new(),
            max_frame_size: config.max_frame_size,
        });

        let (broadcast_tx, broadcast_rx) = if config.ignore_broadcast {
            (None, None)
        } else {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(AsyncMutex::new(rx)))
        };

        let tasks = TaskTracker::new();
        tasks.spawn(dispatch_loop(reader, shared.clone(), broadcast_tx, config.max_frame_size));
        {
            let shared = shared.clone();
            tasks.spawn(async move {
                match writer_task.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::error!("Writer task error: {}", e),
                    Err(e) => tracing::error!("Writer task failed: {}", e),
                }
                shared.shutdown();
            });
        }
        tasks.close();

        Self {
            shared,
            broadcast: broadcast_rx,
            tasks,
        }
    }

    /// Send an envelope on `channel_id`, overwriting any id it carries.
    pub async fn emit(&self, channel_id: &ChannelId, envelope: Envelope) -> Result<()> {
        self.shared.emit(channel_id, envelope).await
    }

    /// Receive the next envelope that belongs to no open channel.
    ///
    /// Responders use this to discover new conversations, then bind them
    /// with [`channel_from`](Self::channel_from).
    ///
    /// # Errors
    ///
    /// `Protocol` if this multiplexer ignores broadcast traffic;
    /// `LostRemote` once the connection is closed.
    pub async fn recv(&self) -> Result<Envelope> {
        let broadcast = self.broadcast.as_ref().ok_or_else(|| {
            ChannelError::Protocol("broadcast traffic is ignored by this multiplexer".to_string())
        })?;
        if self.shared.closed.is_cancelled() {
            return Err(lost_connection());
        }

        let mut rx = broadcast.lock().await;
        rx.recv().await.ok_or_else(lost_connection)
    }

    /// Open a channel with a fresh id (initiator side).
    pub fn channel(&self) -> Channel {
        let id = ChannelId::generate();
        let queue = self
            .shared
            .register(|routes| routes.open_new(id.clone()))
            .unwrap_or_else(MuxShared::dead_queue);
        tracing::debug!("Opened channel {}", id);
        Channel::new(id, self.shared.clone(), queue)
    }

    /// Bind a channel to the id carried by a received envelope (responder
    /// side). The envelope is the first one the channel yields, followed by
    /// anything that arrived for the same id in the meantime.
    ///
    /// # Errors
    ///
    /// `Protocol` if the envelope has no `channel_id` or the id is already
    /// open.
    pub fn channel_from(&self, envelope: Envelope) -> Result<Channel> {
        let id = envelope.channel_id().ok_or_else(|| {
            ChannelError::Protocol(format!("envelope {} carries no channel_id", envelope.name))
        })?;

        let queue = match self.shared.register(|routes| routes.bind(id.clone(), envelope)) {
            Some(bound) => bound?,
            None => MuxShared::dead_queue(),
        };
        tracing::debug!("Bound channel {}", id);
        Ok(Channel::new(id, self.shared.clone(), queue))
    }

    /// Number of open channels.
    pub fn active_channels(&self) -> usize {
        self.shared.routes().open_count()
    }

    /// Close the connection. Every channel's pending `recv` fails with
    /// `LostRemote`. Idempotent.
    pub fn close(&self) {
        if !self.shared.closed.is_cancelled() {
            tracing::debug!("Closing multiplexer");
        }
        self.shared.shutdown();
    }

    /// Whether the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Wait until the dispatch loop and writer task have exited.
    pub async fn closed(&self) {
        self.tasks.wait().await;
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}

fn lost_connection() -> ChannelError {
    ChannelError::LostRemote("connection closed".to_string())
}

async fn dispatch_loop<R>(
    reader: R,
    shared: Arc<MuxShared>,
    broadcast: Option<mpsc::UnboundedSender<Envelope>>,
    max_frame_size: u32,
) where
    R: AsyncRead + Unpin,
{
    match read_loop(reader, &shared, broadcast.as_ref(), max_frame_size).await {
        Ok(()) => tracing::debug!("Dispatch loop stopped"),
        Err(e) => tracing::error!("Dispatch loop error: {}", e),
    }
    drop(broadcast);
    shared.shutdown();
}

async fn read_loop<R>(
    mut reader: R,
    shared: &MuxShared,
    broadcast: Option<&mpsc::UnboundedSender<Envelope>>,
    max_frame_size: u32,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameBuffer::with_max_payload(max_frame_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            read = reader.read(&mut buf) => read?,
            _ = shared.closed.cancelled() => return Ok(()),
        };
        if n == 0 {
            tracing::debug!("Connection closed by peer");
            return Ok(());
        }

        for frame in frames.push(&buf[..n])? {
            match EnvelopeCodec::decode(frame.payload()) {
                Ok(envelope) => shared.route(envelope, broadcast),
                Err(e) => tracing::warn!("Skipping undecodable envelope: {}", e),
            }
        }
    }
}
