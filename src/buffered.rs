//! Buffered layer: a local receive buffer with credit-based flow control.
//!
//! A pump task drains the inner channel into a bounded buffer. Each side
//! may only send as many envelopes as the other has granted credit for,
//! so the buffer can never overflow unless the peer misbehaves.
//!
//! ```text
//!           ┌── pump ◄── inner.recv() ◄── peer
//!           │    ├─ credit grant ─► OutboundCredit (our sends)
//!           │    └─ envelope ─────► buffer (capacity C)
//!  recv() ◄─┘
//!    └─ grants credit to the peer as the buffer drains (InboundWindow)
//! ```
//!
//! If the pump hits an error (lost peer, closed channel, protocol
//! violation) it is stored once and reported to every later `recv` and
//! `emit`, after anything already buffered has been read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::channel::{with_timeout, Channel, EventChannel};
use crate::config::BufferedConfig;
use crate::credit::{InboundWindow, OutboundCredit};
use crate::envelope::{ChannelId, Envelope, Value};
use crate::error::{ChannelError, Result};
use crate::heartbeat::HeartbeatChannel;

/// The standard stack: flow control over heartbeat over a raw channel.
pub type ReliableChannel = BufferedChannel<HeartbeatChannel<Channel>>;

/// Predicate deciding that an envelope is the last of a conversation.
pub type ClosePredicate = Box<dyn Fn(&Envelope) -> bool + Send + Sync>;

/// Why the pump stopped. Cloneable form of the error it hit.
#[derive(Debug, Clone)]
enum Terminal {
    Lost(String),
    Closed,
    Protocol(String),
}

impl Terminal {
    fn from_error(error: ChannelError) -> Self {
        match error {
            ChannelError::LostRemote(reason) => Terminal::Lost(reason),
            ChannelError::Closed => Terminal::Closed,
            ChannelError::Protocol(reason) => Terminal::Protocol(reason),
            ChannelError::ConnectionClosed => Terminal::Lost("connection closed".to_string()),
            other => Terminal::Lost(other.to_string()),
        }
    }

    fn to_error(&self) -> ChannelError {
        match self {
            Terminal::Lost(reason) => ChannelError::LostRemote(reason.clone()),
            Terminal::Closed => ChannelError::Closed,
            Terminal::Protocol(reason) => ChannelError::Protocol(reason.clone()),
        }
    }
}

struct BufferedShared<C> {
    channel: C,
    config: BufferedConfig,
    credit: OutboundCredit,
    terminal: OnceLock<Terminal>,
    terminated: CancellationToken,
    shutdown: CancellationToken,
    closed: AtomicBool,
    close_if: Option<ClosePredicate>,
}

impl<C: EventChannel> BufferedShared<C> {
    /// Record why the pump stopped; the first reason wins.
    fn terminate(&self, error: ChannelError) {
        let terminal = Terminal::from_error(error);
        match &terminal {
            Terminal::Closed => {
                tracing::debug!("Buffered channel {} closed", self.channel.channel_id());
            }
            Terminal::Lost(reason) | Terminal::Protocol(reason) => {
                tracing::debug!("Buffered channel {} stopped: {}", self.channel.channel_id(), reason);
            }
        }
        let _ = self.terminal.set(terminal);
        self.terminated.cancel();
    }

    fn terminal_error(&self) -> ChannelError {
        self.terminal
            .get()
            .map(Terminal::to_error)
            .unwrap_or(ChannelError::Closed)
    }

    /// Apply a credit grant from the peer. A grant is never larger than
    /// the shared capacity; anything else is ignored.
    fn apply_grant(&self, envelope: &Envelope) {
        let units = envelope
            .args
            .first()
            .and_then(Value::as_u64)
            .and_then(|units| usize::try_from(units).ok())
            .filter(|units| *units <= self.config.capacity.max(1));
        match units {
            Some(units) => {
                tracing::debug!("Channel {} granted {} credit", self.channel.channel_id(), units);
                self.credit.grant(units);
            }
            None => tracing::warn!(
                "Ignoring invalid credit grant on channel {}: {:?}",
                self.channel.channel_id(),
                envelope.args
            ),
        }
    }
}

/// A channel with a local receive buffer and credit-based flow control.
///
/// Both peers must wrap their end with the same bootstrap credit and
/// credit envelope name.
pub struct BufferedChannel<C: EventChannel> {
    shared: Arc<BufferedShared<C>>,
    buffer: AsyncMutex<mpsc::Receiver<Envelope>>,
    window: Mutex<InboundWindow>,
    tasks: TaskTracker,
}

impl<C: EventChannel> BufferedChannel<C> {
    /// Wrap `channel` and start the pump.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(channel: C, config: BufferedConfig) -> Self {
        Self::build(channel, config, None)
    }

    /// Like [`new`](Self::new), but the channel closes itself after
    /// buffering an envelope for which `close_if` returns `true`.
    ///
    /// Envelopes already buffered stay readable; after them `recv` fails
    /// with [`ChannelError::Closed`].
    pub fn with_close_if<F>(channel: C, config: BufferedConfig, close_if: F) -> Self
    where
        F: Fn(&Envelope) -> bool + Send + Sync + 'static,
    {
        Self::build(channel, config, Some(Box::new(close_if)))
    }

    fn build(channel: C, config: BufferedConfig, close_if: Option<ClosePredicate>) -> Self {
        let capacity = config.capacity.max(1);
        // Both directions assume the same bootstrap, so it cannot exceed the buffer.
        let bootstrap = config.bootstrap_credit.min(capacity);
        let window = InboundWindow::new(capacity, bootstrap);
        let shared = Arc::new(BufferedShared {
            channel,
            credit: OutboundCredit::new(bootstrap),
            config,
            terminal: OnceLock::new(),
            terminated: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
            close_if,
        });

        let (tx, rx) = mpsc::channel(capacity);
        let tasks = TaskTracker::new();
        tasks.spawn(pump(shared.clone(), tx));
        tasks.close();

        Self {
            shared,
            buffer: AsyncMutex::new(rx),
            window: Mutex::new(window),
            tasks,
        }
    }

    /// Send an event, waiting for credit if the peer's window is full.
    pub async fn emit(&self, name: &str, args: Vec<Value>) -> Result<()> {
        self.send(Envelope::new(name, args), true, None).await.map(|_| ())
    }

    /// Send an event only if credit is available.
    ///
    /// Returns `Ok(false)` without sending when the peer's window is full.
    pub async fn try_emit(&self, name: &str, args: Vec<Value>) -> Result<bool> {
        self.send(Envelope::new(name, args), false, None).await
    }

    /// Send an event, waiting at most `timeout` for credit.
    pub async fn emit_timeout(&self, name: &str, args: Vec<Value>, timeout: Duration) -> Result<()> {
        self.send(Envelope::new(name, args), true, Some(timeout))
            .await
            .map(|_| ())
    }

    /// Sends currently allowed by the peer.
    pub fn available_credit(&self) -> usize {
        self.shared.credit.available()
    }

    /// The wrapped channel.
    pub fn inner(&self) -> &C {
        &self.shared.channel
    }

    /// Wait until the pump has exited after `close`.
    pub async fn closed(&self) {
        self.tasks.wait().await;
    }

    fn window(&self) -> std::sync::MutexGuard<'_, InboundWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn send(&self, envelope: Envelope, block: bool, timeout: Option<Duration>) -> Result<bool> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        if self.shared.terminated.is_cancelled() {
            return Err(self.shared.terminal_error());
        }

        if !self.shared.credit.try_take() {
            if !block {
                tracing::debug!("Channel {} is congested", self.shared.channel.channel_id());
                return Ok(false);
            }
            let acquired = with_timeout(timeout, async {
                Ok(self.shared.credit.take(&self.shared.terminated).await)
            })
            .await?;
            if !acquired {
                return Err(self.shared.terminal_error());
            }
        }

        if let Err(e) = self.shared.channel.emit_envelope(envelope).await {
            self.shared.credit.refund();
            return Err(e);
        }
        Ok(true)
    }

    /// Grant the peer more credit if the window has drained enough.
    async fn grant_credit(&self) -> Result<()> {
        if self.shared.terminated.is_cancelled() {
            return Ok(());
        }
        let Some(units) = self.window().pending_grant() else {
            return Ok(());
        };

        self.shared
            .channel
            .emit(&self.shared.config.credit_name, vec![Value::from(units as u64)])
            .await?;
        self.window().commit_grant(units);
        tracing::debug!("Granted {} credit on channel {}", units, self.shared.channel.channel_id());
        Ok(())
    }

    async fn next(&self) -> Result<Envelope> {
        let mut buffer = self.buffer.lock().await;

        if let Err(e) = self.grant_credit().await {
            tracing::debug!("Credit grant failed on channel {}: {}", self.shared.channel.channel_id(), e);
        }

        match buffer.recv().await {
            Some(envelope) => {
                self.window().on_consumed();
                Ok(envelope)
            }
            None => Err(self.shared.terminal_error()),
        }
    }
}

impl<C: EventChannel> EventChannel for BufferedChannel<C> {
    fn channel_id(&self) -> &ChannelId {
        self.shared.channel.channel_id()
    }

    async fn emit_envelope(&self, envelope: Envelope) -> Result<()> {
        self.send(envelope, true, None).await.map(|_| ())
    }

    async fn recv(&self, timeout: Option<Duration>) -> Result<Envelope> {
        with_timeout(timeout, self.next()).await
    }

    fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.shutdown.cancel();
            self.shared.channel.close();
        }
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl<C: EventChannel> Drop for BufferedChannel<C> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump<C: EventChannel>(shared: Arc<BufferedShared<C>>, buffer: mpsc::Sender<Envelope>) {
    let error = loop {
        let envelope = tokio::select! {
            _ = shared.shutdown.cancelled() => break ChannelError::Closed,
            received = shared.channel.recv(None) => match received {
                Ok(envelope) => envelope,
                Err(e) => break e,
            },
        };

        if envelope.name == shared.config.credit_name {
            shared.apply_grant(&envelope);
            continue;
        }

        let last = shared.close_if.as_ref().is_some_and(|close_if| close_if(&envelope));
        match buffer.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                tracing::warn!(
                    "Buffer overflow on channel {}: peer sent {} beyond its credit",
                    shared.channel.channel_id(),
                    envelope.name
                );
                break ChannelError::Protocol(format!(
                    "buffer overflow: peer exceeded {} credit",
                    shared.config.capacity
                ));
            }
            Err(TrySendError::Closed(_)) => break ChannelError::Closed,
        }

        if last {
            shared.closed.store(true, Ordering::Release);
            shared.channel.close();
            break ChannelError::Closed;
        }
    };

    shared.terminate(error);
}
