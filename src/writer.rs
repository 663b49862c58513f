//! Dedicated writer task for response frames.
//!
//! Every connection owns one writer task fed through an mpsc channel, so
//! completions from any thread can queue responses without sharing the
//! socket. Ready frames are batched into vectored writes.
//!
//! ```text
//! completion 1 ─┐
//! completion 2 ─┼─► mpsc::Sender<OutboundFrame> ─► Writer Task ─► socket
//! completion N ─┘
//! ```
//!
//! A frame's payload is a list of [`Bytes`] segments; tensor buffers are
//! written straight from the segments without being concatenated.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::{DEFAULT_BACKPRESSURE_TIMEOUT_MS, DEFAULT_CHANNEL_CAPACITY, DEFAULT_MAX_PENDING_FRAMES};
use crate::error::{Result, WorkerError};
use crate::protocol::{Header, HEADER_SIZE};

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// Longest error message sent back in an error frame.
const MAX_ERROR_MESSAGE: usize = 64 * 1024;

/// A frame ready to be written to the socket.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload segments, written in order.
    pub segments: Vec<Bytes>,
}

impl OutboundFrame {
    /// Frame whose header length is set from the segments.
    ///
    /// # Errors
    ///
    /// [`WorkerError::ResponseTooLarge`] when the segments add up to more
    /// than a `u32` length can describe.
    pub fn new(mut header: Header, segments: Vec<Bytes>) -> Result<Self> {
        let segments: Vec<Bytes> = segments.into_iter().filter(|s| !s.is_empty()).collect();
        let len = segments.iter().map(Bytes::len).sum::<usize>();
        header.payload_length = u32::try_from(len).map_err(|_| WorkerError::ResponseTooLarge(len))?;
        Ok(Self {
            header: header.encode(),
            segments,
        })
    }

    /// Error response carrying `err`'s status and message.
    ///
    /// Messages longer than 64 KiB are cut.
    pub fn error(method: u8, tag: u64, err: &WorkerError) -> Self {
        let mut message = err.to_string().into_bytes();
        message.truncate(MAX_ERROR_MESSAGE);
        let header = Header::error(method, tag, err.status_code(), message.len() as u32);
        let segments = if message.is_empty() {
            Vec::new()
        } else {
            vec![Bytes::from(message)]
        };
        Self {
            header: header.encode(),
            segments,
        }
    }

    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.segments.iter().map(Bytes::len).sum::<usize>()
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Maximum pending frames before backpressure kicks in.
    pub max_pending_frames: usize,
    /// Channel capacity for frame queue.
    pub channel_capacity: usize,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: Duration::from_millis(DEFAULT_BACKPRESSURE_TIMEOUT_MS),
        }
    }
}

/// Queue depth shared between the handles and the writer task.
struct Queue {
    pending: AtomicUsize,
    /// Signalled each time a batch has been written.
    drained: Notify,
}

/// Handle for queueing frames on a connection.
///
/// Cheaply cloneable; shared by every call on the connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<OutboundFrame>,
    queue: Arc<Queue>,
    max_pending: usize,
    timeout: Duration,
    runtime: Handle,
}

impl WriterHandle {
    /// Queue a frame, waiting while the connection is over its pending
    /// limit.
    ///
    /// # Errors
    ///
    /// [`WorkerError::BackpressureTimeout`] if the queue does not drain in
    /// time, [`WorkerError::ConnectionClosed`] once the writer is gone.
    pub async fn send(&self, frame: OutboundFrame) -> Result<()> {
        if self.is_backpressure_active() {
            tokio::time::timeout(self.timeout, self.drained())
                .await
                .map_err(|_| WorkerError::BackpressureTimeout)?;
        }

        self.queue.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(frame).await.map_err(|_| {
            self.queue.pending.fetch_sub(1, Ordering::Release);
            WorkerError::ConnectionClosed
        })
    }

    async fn drained(&self) {
        loop {
            let notified = self.queue.drained.notified();
            if !self.is_backpressure_active() {
                return;
            }
            notified.await;
        }
    }

    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.pending_count() >= self.max_pending
    }

    /// Frames queued but not yet written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.queue.pending.load(Ordering::Acquire)
    }

    /// Queue a frame without waiting.
    ///
    /// The frame comes back with the error so the caller can retry it.
    pub fn try_send(&self, frame: OutboundFrame) -> std::result::Result<(), (OutboundFrame, WorkerError)> {
        if self.is_backpressure_active() {
            return Err((frame, WorkerError::BackpressureTimeout));
        }

        self.queue.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.try_send(frame).map_err(|e| {
            self.queue.pending.fetch_sub(1, Ordering::Release);
            match e {
                mpsc::error::TrySendError::Full(frame) => (frame, WorkerError::BackpressureTimeout),
                mpsc::error::TrySendError::Closed(frame) => (frame, WorkerError::ConnectionClosed),
            }
        })
    }

    /// Queue a frame from synchronous code.
    ///
    /// Completions run on arbitrary threads and cannot await. The fast path
    /// is a non-blocking enqueue; under backpressure the send continues on
    /// the writer's runtime.
    pub fn send_or_spawn(&self, frame: OutboundFrame) {
        match self.try_send(frame) {
            Ok(()) => {}
            Err((_, WorkerError::ConnectionClosed)) => {
                debug!("connection closed before response could be queued");
            }
            Err((frame, _)) => {
                let handle = self.clone();
                self.runtime.spawn(async move {
                    if let Err(e) = handle.send(frame).await {
                        warn!("dropping response frame: {}", e);
                    }
                });
            }
        }
    }
}

/// Spawn the writer task for `writer`.
///
/// Must be called from within a tokio runtime.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity);
    let queue = Arc::new(Queue {
        pending: AtomicUsize::new(0),
        drained: Notify::new(),
    });

    let handle = WriterHandle {
        tx,
        queue: queue.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
        runtime: Handle::current(),
    };

    let task = tokio::spawn(writer_loop(rx, writer, queue));
    (handle, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<OutboundFrame>, mut writer: W, queue: Arc<Queue>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
    loop {
        if rx.recv_many(&mut batch, MAX_BATCH_SIZE).await == 0 {
            return Ok(());
        }
        let written = write_batch(&mut writer, &batch).await;
        queue.pending.fetch_sub(batch.len(), Ordering::Release);
        queue.drained.notify_waiters();
        batch.clear();
        written?;
    }
}

/// Write a batch with vectored writes, resuming after short writes.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let total_size: usize = batch.iter().map(OutboundFrame::size).sum();
    let mut total_written = 0;

    while total_written < total_size {
        let slices = build_remaining_slices(batch, total_written);
        if slices.is_empty() {
            break;
        }

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(WorkerError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for the data after the first `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        push_remaining(&frame.header, &mut offset, skip_bytes, &mut slices);
        for segment in &frame.segments {
            push_remaining(segment, &mut offset, skip_bytes, &mut slices);
        }
    }

    slices
}

fn push_remaining<'a>(
    part: &'a [u8],
    offset: &mut usize,
    skip_bytes: usize,
    slices: &mut Vec<IoSlice<'a>>,
) {
    let start = *offset;
    *offset += part.len();
    if skip_bytes < *offset {
        let from = skip_bytes.saturating_sub(start);
        slices.push(IoSlice::new(&part[from..]));
    }
}
