//! Heartbeat layer: liveness detection for one channel.
//!
//! Three tasks run per wrapped channel:
//!
//! - **reader** drains the inner channel, refreshes the liveness clock on
//!   every envelope and swallows pulses;
//! - **pulse** emits a pulse every `period`;
//! - **watchdog** declares the peer lost once nothing has arrived for
//!   `2 × period`.
//!
//! ```text
//!  ALIVE ──(silence > 2×period or connection gone)──► LOST
//! ```
//!
//! `LOST` is terminal: every pending and future `recv` and `emit` fails
//! with [`ChannelError::LostRemote`]. A new channel is needed to recover.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::channel::{with_timeout, EventChannel};
use crate::config::HeartbeatConfig;
use crate::envelope::{ChannelId, Envelope, Value};
use crate::error::{ChannelError, Result};

/// Liveness state of a [`HeartbeatChannel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Traffic from the peer arrived recently.
    Alive,
    /// The peer is presumed gone.
    Lost,
}

struct HeartbeatShared<C> {
    channel: C,
    config: HeartbeatConfig,
    last_seen: Mutex<Instant>,
    started: watch::Sender<bool>,
    lost: CancellationToken,
    lost_reason: OnceLock<String>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

impl<C: EventChannel> HeartbeatShared<C> {
    fn touch(&self) {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn last_seen(&self) -> Instant {
        *self.last_seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn start(&self) {
        self.started.send_if_modified(|started| !std::mem::replace(started, true));
    }

    /// Wait for the first peer pulse in passive mode. `false` on shutdown.
    async fn wait_started(&self) -> bool {
        let mut started = self.started.subscribe();
        tokio::select! {
            ready = async { started.wait_for(|s| *s).await.is_ok() } => ready,
            _ = self.shutdown.cancelled() => false,
        }
    }

    fn mark_lost(&self, reason: String) {
        if self.lost_reason.set(reason).is_ok() {
            tracing::warn!(
                "Lost remote on channel {}: {}",
                self.channel.channel_id(),
                self.lost_reason.get().map(String::as_str).unwrap_or_default()
            );
        }
        self.lost.cancel();
    }

    fn lost_error(&self) -> ChannelError {
        let reason = self
            .lost_reason
            .get()
            .cloned()
            .unwrap_or_else(|| "connection closed".to_string());
        ChannelError::LostRemote(reason)
    }

    /// Error for a receive that found the inbox drained and closed.
    fn ended_error(&self) -> ChannelError {
        if self.lost.is_cancelled() {
            self.lost_error()
        } else if self.closed.load(Ordering::Acquire) {
            ChannelError::Closed
        } else {
            ChannelError::LostRemote("connection closed".to_string())
        }
    }
}

/// A channel that detects a silent peer.
///
/// Both peers must wrap their end with the same period and pulse name.
pub struct HeartbeatChannel<C: EventChannel> {
    shared: Arc<HeartbeatShared<C>>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<Envelope>>,
    tasks: TaskTracker,
}

impl<C: EventChannel> HeartbeatChannel<C> {
    /// Wrap `channel` and start the heartbeat tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(channel: C, config: HeartbeatConfig) -> Self {
        let (started, _) = watch::channel(!config.passive);
        let shared = Arc::new(HeartbeatShared {
            channel,
            config,
            last_seen: Mutex::new(Instant::now()),
            started,
            lost: CancellationToken::new(),
            lost_reason: OnceLock::new(),
            shutdown: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let tasks = TaskTracker::new();
        tasks.spawn(reader_task(shared.clone(), tx));
        tasks.spawn(pulse_task(shared.clone()));
        tasks.spawn(watchdog_task(shared.clone()));
        tasks.close();

        Self {
            shared,
            inbox: AsyncMutex::new(rx),
            tasks,
        }
    }

    /// Current liveness state.
    pub fn state(&self) -> HeartbeatState {
        if self.shared.lost.is_cancelled() {
            HeartbeatState::Lost
        } else {
            HeartbeatState::Alive
        }
    }

    /// The configured pulse period.
    pub fn period(&self) -> Duration {
        self.shared.config.period
    }

    /// Wait until the heartbeat tasks have exited after `close`.
    pub async fn closed(&self) {
        self.tasks.wait().await;
    }

    async fn next(&self) -> Result<Envelope> {
        let mut inbox = self.inbox.lock().await;
        tokio::select! {
            biased;
            _ = self.shared.lost.cancelled() => Err(self.shared.lost_error()),
            envelope = inbox.recv() => envelope.ok_or_else(|| self.shared.ended_error()),
        }
    }
}

impl<C: EventChannel> EventChannel for HeartbeatChannel<C> {
    fn channel_id(&self) -> &ChannelId {
        self.shared.channel.channel_id()
    }

    async fn emit_envelope(&self, envelope: Envelope) -> Result<()> {
        if self.shared.lost.is_cancelled() {
            return Err(self.shared.lost_error());
        }
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed);
        }
        self.shared.channel.emit_envelope(envelope).await
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

impl<C: EventChannel> Drop for HeartbeatChannel<C> {
    fn drop(&mut self) {
        self.close();
    }
}

async fn reader_task<C: EventChannel>(shared: Arc<HeartbeatShared<C>>, inbox: mpsc::UnboundedSender<Envelope>) {
    loop {
        let envelope = tokio::select! {
            _ = shared.shutdown.cancelled() => return,
            received = shared.channel.recv(None) => match received {
                Ok(envelope) => envelope,
                Err(ChannelError::Closed) => return,
                Err(e) => {
                    shared.mark_lost(e.to_string());
                    return;
                }
            },
        };

        shared.touch();
        if envelope.name == shared.config.pulse_name {
            shared.start();
            continue;
        }
        if inbox.send(envelope).is_err() {
            return;
        }
    }
}

async fn pulse_task<C: EventChannel>(shared: Arc<HeartbeatShared<C>>) {
    if !shared.wait_started().await {
        return;
    }

    loop {
        tokio::select! {
            _ = tokio::time::sleep(shared.config.period) => {}
            _ = shared.lost.cancelled() => return,
            _ = shared.shutdown.cancelled() => return,
        }

        if let Err(e) = shared.channel.emit(&shared.config.pulse_name, vec![Value::from(0)]).await {
            tracing::debug!("Stopping pulses on channel {}: {}", shared.channel.channel_id(), e);
            return;
        }
    }
}

async fn watchdog_task<C: EventChannel>(shared: Arc<HeartbeatShared<C>>) {
    if !shared.wait_started().await {
        return;
    }
    // Passive mode starts the clock at the first pulse.
    shared.touch();

    let lost_after = shared.config.lost_after();
    loop {
        let deadline = shared.last_seen() + lost_after;
        if Instant::now() >= deadline {
            shared.mark_lost(format!("no heartbeat for {:?}", lost_after));
            return;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = shared.lost.cancelled() => return,
            _ = shared.shutdown.cancelled() => return,
        }
    }
}
