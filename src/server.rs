//! Server builder and connection loop.
//!
//! The [`ServerBuilder`] provides a fluent API over [`WorkerConfig`] and the
//! worker's collaborators. A [`Server`] serves any byte stream:
//! 1. Split the stream and spawn its writer task
//! 2. Read frames and hand request frames to the dispatch table
//! 3. Route CANCEL frames to the in-flight call with the same tag
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use rendezvous_worker::device::{CpuDevice, DeviceSet};
//! use rendezvous_worker::rendezvous::LocalRendezvous;
//! use rendezvous_worker::{Server, WorkerEnv};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let devices = DeviceSet::new().with_device(Arc::new(CpuDevice::new(
//!         "/job:worker/replica:0/task:0/device:CPU:0",
//!         0x1234,
//!     )));
//!     let env = WorkerEnv::new(Arc::new(devices), Arc::new(LocalRendezvous::new()));
//!
//!     let server = Server::builder(env).max_concurrent_calls(64).build()?;
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:2222").await?;
//!     server.serve_tcp(listener).await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::call::{InFlight, ServerCall};
use crate::config::WorkerConfig;
use crate::error::{Result, WorkerError};
use crate::protocol::{Frame, FrameBuffer};
use crate::service::MethodId;
use crate::worker::{Worker, WorkerEnv};
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

/// Read buffer size of the connection loop.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    env: WorkerEnv,
    config: WorkerConfig,
}

impl ServerBuilder {
    pub fn new(env: WorkerEnv) -> Self {
        Self {
            env,
            config: WorkerConfig::default(),
        }
    }

    /// Replace the whole configuration, e.g. one loaded from JSON.
    pub fn config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    /// Bound on calls running in the compute pool at once.
    ///
    /// Default: 256
    pub fn max_concurrent_calls(mut self, limit: usize) -> Self {
        self.config.max_concurrent_calls = limit;
        self
    }

    /// Pending response frames per connection before senders wait.
    ///
    /// Default: 1024
    pub fn max_pending_frames(mut self, limit: usize) -> Self {
        self.config.max_pending_frames = limit;
        self
    }

    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity;
        self
    }

    /// Default: 5 seconds
    pub fn backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.config.backpressure_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Largest accepted request payload.
    ///
    /// Default: 1 GiB
    pub fn max_payload_size(mut self, size: u32) -> Self {
        self.config.max_payload_size = size;
        self
    }

    /// Emit request timing traces.
    pub fn trace_timing(mut self, enabled: bool) -> Self {
        self.config.trace_timing = enabled;
        self
    }

    /// Terminate the process when a single receive names a malformed
    /// rendezvous key or an unknown device.
    ///
    /// The error response is queued before terminating but is usually lost.
    /// Fused receives are never terminated, only failed.
    pub fn abort_on_bad_key(mut self, enabled: bool) -> Self {
        self.config.abort_on_bad_key = enabled;
        self
    }

    /// Build the server on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails when called outside a runtime.
    pub fn build(self) -> Result<Server> {
        let worker = Worker::new(self.env, self.config)?;
        Ok(Server { worker })
    }
}

/// A worker serving framed connections.
#[derive(Clone)]
pub struct Server {
    worker: Arc<Worker>,
}

impl Server {
    pub fn builder(env: WorkerEnv) -> ServerBuilder {
        ServerBuilder::new(env)
    }

    /// Server around an existing worker.
    pub fn from_worker(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    pub fn worker(&self) -> &Arc<Worker> {
        &self.worker
    }

    /// Accept TCP connections forever, serving each on its own tasks.
    pub async fn serve_tcp(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                warn!(%peer, "failed to set TCP_NODELAY: {}", e);
            }
            debug!(%peer, "accepted connection");
            let _connection = self.serve_connection(stream);
        }
    }

    /// Serve one connection. Must be called from within a tokio runtime.
    pub fn serve_connection<S>(&self, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let config = self.worker.config();
        let (reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, config.writer_config());

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let inflight = Arc::new(InFlight::new());
        let worker = self.worker.clone();
        let loop_writer = writer.clone();
        let max_payload_size = config.max_payload_size;

        tokio::spawn(async move {
            let result = read_loop(reader, &worker, &loop_writer, &inflight, max_payload_size).await;
            if let Err(e) = &result {
                error!("Read loop error: {}", e);
            }
            // Calls still running keep going; their answers are dropped by
            // the closed writer.
            let orphaned: Vec<_> = inflight.iter().map(|e| e.value().clone()).collect();
            for options in orphaned {
                options.start_cancel();
            }
            let _ = shutdown_tx.send(result);
        });

        Connection {
            writer,
            shutdown_rx,
            _writer_task: writer_task,
        }
    }
}

/// A connection being served.
pub struct Connection {
    writer: WriterHandle,
    shutdown_rx: oneshot::Receiver<Result<()>>,
    _writer_task: JoinHandle<Result<()>>,
}

impl Connection {
    pub fn pending_frames(&self) -> usize {
        self.writer.pending_count()
    }

    pub fn is_backpressure_active(&self) -> bool {
        self.writer.is_backpressure_active()
    }

    /// Wait until the peer closes the connection or it fails.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        self.shutdown_rx.await.unwrap_or(Ok(()))
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: R,
    worker: &Arc<Worker>,
    writer: &WriterHandle,
    inflight: &Arc<InFlight>,
    max_payload_size: u32,
) -> Result<()> {
    let mut frame_buffer = FrameBuffer::with_max_payload(max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) => return Err(WorkerError::Io(e)),
        };

        for frame in frame_buffer.push(&buf[..n])? {
            dispatch_frame(frame, worker, writer, inflight);
        }
    }
}

fn dispatch_frame(frame: Frame, worker: &Arc<Worker>, writer: &WriterHandle, inflight: &Arc<InFlight>) {
    let tag = frame.tag();

    if frame.is_cancel() {
        let options = inflight.get(&tag).map(|entry| entry.value().clone());
        match options {
            Some(options) => {
                debug!(tag, "cancel requested");
                options.start_cancel();
            }
            None => debug!(tag, "cancel for a call that is not running"),
        }
        return;
    }

    if frame.is_response() {
        warn!(tag, method = frame.method(), "Received unexpected response frame");
        return;
    }

    let Some(method) = MethodId::from_u8(frame.method()) else {
        let err = WorkerError::UnknownMethod(frame.method());
        error!(tag, method = frame.method(), "request for unknown method");
        writer.send_or_spawn(OutboundFrame::error(frame.method(), tag, &err));
        return;
    };

    let call = ServerCall::on_connection(method, tag, frame.payload, writer.clone(), inflight.clone());
    worker.dispatch(call);
}
