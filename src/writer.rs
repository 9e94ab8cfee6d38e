//! Dedicated writer task: the only place that writes to the connection.
//!
//! ```text
//! Channel A ─┐
//! Channel B ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► stream
//! Pulses    ─┘
//! ```
//!
//! Sends from any number of channels are serialized by the queue and never
//! wait on the receive side. Ready frames are batched into one vectored write.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{ChannelError, Result};
use crate::protocol::{FrameHeader, FRAME_HEADER_SIZE};

/// Default writer queue capacity.
pub const DEFAULT_WRITER_QUEUE: usize = 1024;

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    header: [u8; FRAME_HEADER_SIZE],
    payload: Bytes,
}

impl OutboundFrame {
    /// Frame an encoded payload.
    ///
    /// Fails with `Protocol` if the payload length does not fit the
    /// 32-bit length field.
    pub fn new(payload: Bytes) -> Result<Self> {
        let length = u32::try_from(payload.len()).map_err(|_| {
            ChannelError::Protocol(format!("Payload of {} bytes cannot be framed", payload.len()))
        })?;
        Ok(Self {
            header: FrameHeader::new(length).encode(),
            payload,
        })
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames queued before `send` starts waiting.
    pub queue_capacity: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_WRITER_QUEUE,
        }
    }
}

/// Cloneable handle for sending frames to the writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    shutdown: CancellationToken,
}

impl WriterHandle {
    /// Queue a frame for writing.
    ///
    /// Waits only when the queue is full.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(ChannelError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| ChannelError::ConnectionClosed)
    }

    /// Flush queued frames, then shut the write half down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the writer no longer accepts frames.
    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled() || self.tx.is_closed()
    }
}

/// Spawn the writer task and return a handle for sending frames.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
    let shutdown = CancellationToken::new();

    let handle = WriterHandle {
        tx,
        shutdown: shutdown.clone(),
    };
    let task = tokio::spawn(writer_loop(rx, writer, shutdown));

    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::Receiver<OutboundFrame>,
    mut writer: W,
    shutdown: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = loop {
        let first = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break Ok(()),
            },
            _ = shutdown.cancelled() => break drain(&mut rx, &mut writer).await,
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            break Err(e);
        }
    };

    rx.close();
    shutdown.cancel();
    if let Err(e) = writer.shutdown().await {
        tracing::debug!("Writer shutdown error: {}", e);
    }
    result
}

/// Write whatever is still queued when shutdown is requested.
async fn drain<W>(rx: &mut mpsc::Receiver<OutboundFrame>, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        batch.push(frame);
    }
    write_batch(writer, &batch).await
}

/// Write a batch of frames with one vectored write, finishing any tail
/// left by a partial write with plain writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }
    let total: usize = batch.iter().map(OutboundFrame::size).sum();

    let mut written = writer.write_vectored(&slices).await?;
    if written == 0 {
        return Err(ChannelError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        )));
    }

    if written < total {
        let mut offset = 0;
        for frame in batch {
            for part in [&frame.header[..], &frame.payload[..]] {
                let end = offset + part.len();
                if written < end {
                    writer.write_all(&part[written - offset..]).await?;
                    written = end;
                }
                offset = end;
            }
        }
    }

    writer.flush().await?;
    Ok(())
}
