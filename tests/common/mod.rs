//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use rendezvous_worker::call::CallOptions;
use rendezvous_worker::device::{
    Allocator, AllocatorAttributes, CopyCallback, CpuDevice, Device, DeviceContext, DeviceSet,
    HostAllocator,
};
use rendezvous_worker::error::{Result, WorkerError};
use rendezvous_worker::protocol::{build_frame, Frame, FrameBuffer, Header};
use rendezvous_worker::rendezvous::{
    FrameAndIter, FusedRecvCallback, LocalRendezvous, RecvCallback, RendezvousKey, RendezvousStore,
};
use rendezvous_worker::tensor::{DataType, Tensor};
use rendezvous_worker::worker::BoxFuture;
use rendezvous_worker::{GraphWorker, MethodId};

pub const CPU0: &str = "/job:worker/replica:0/task:0/device:CPU:0";
pub const GPU0: &str = "/job:worker/replica:0/task:0/device:GPU:0";
pub const CPU_INCARNATION: u64 = 0xc0ffee;
pub const GPU_INCARNATION: u64 = 0x9e0;

pub fn cpu_key(edge: &str) -> String {
    RendezvousKey::create(CPU0, CPU_INCARNATION, CPU0, edge, FrameAndIter::default())
}

pub fn gpu_key(edge: &str) -> String {
    RendezvousKey::create(GPU0, GPU_INCARNATION, CPU0, edge, FrameAndIter::default())
}

pub fn parse(key: &str) -> RendezvousKey {
    RendezvousKey::parse(key).unwrap()
}

pub fn floats(values: &[f32]) -> Tensor {
    let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    Tensor::from_bytes(DataType::Float, vec![values.len() as u64], Bytes::from(raw)).unwrap()
}

/// Accelerator whose memory must be staged to host before sending.
pub struct MockGpu {
    pub allocator: Arc<HostAllocator>,
    pub staging_requests: Mutex<Vec<AllocatorAttributes>>,
}

impl MockGpu {
    pub fn new() -> Self {
        Self {
            allocator: Arc::new(HostAllocator),
            staging_requests: Mutex::new(Vec::new()),
        }
    }
}

impl Device for MockGpu {
    fn name(&self) -> &str {
        GPU0
    }

    fn device_type(&self) -> &str {
        "GPU"
    }

    fn incarnation(&self) -> u64 {
        GPU_INCARNATION
    }

    fn requires_host_staging(&self) -> bool {
        true
    }

    fn allocator(&self, attrs: AllocatorAttributes) -> Arc<dyn Allocator> {
        self.staging_requests.lock().push(attrs);
        self.allocator.clone()
    }
}

/// Device context that copies on a separate thread, like a DMA stream.
#[derive(Default)]
pub struct MockGpuContext {
    pub copies: AtomicUsize,
    pub fail: AtomicBool,
}

impl DeviceContext for MockGpuContext {
    fn copy_device_to_host(
        &self,
        src: &Tensor,
        _key: &str,
        _device: &dyn Device,
        mut dst: BytesMut,
        done: CopyCallback,
    ) {
        self.copies.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail.load(Ordering::SeqCst);
        let src = src.as_bytes().cloned().unwrap_or_default();
        std::thread::spawn(move || {
            if fail {
                done(Err(WorkerError::CopyFailed("ECC error".into())));
                return;
            }
            dst.copy_from_slice(&src);
            done(Ok(dst));
        });
    }
}

/// Devices of a worker with one CPU and one accelerator.
pub fn devices_with_gpu(gpu: Arc<MockGpu>) -> DeviceSet {
    DeviceSet::new()
        .with_device(Arc::new(CpuDevice::new(CPU0, CPU_INCARNATION)))
        .with_device(gpu)
}

/// Rendezvous that counts the lookups it receives.
#[derive(Default)]
pub struct CountingRendezvous {
    pub inner: LocalRendezvous,
    pub recv_calls: AtomicUsize,
    pub fused_calls: AtomicUsize,
}

impl CountingRendezvous {
    pub fn lookups(&self) -> usize {
        self.recv_calls.load(Ordering::SeqCst) + self.fused_calls.load(Ordering::SeqCst)
    }
}

impl RendezvousStore for CountingRendezvous {
    fn recv_local_async(&self, step_id: i64, key: &RendezvousKey, done: RecvCallback) {
        self.recv_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.recv_local_async(step_id, key, done);
    }

    fn fused_recv_local_async(&self, step_id: i64, keys: &[RendezvousKey], done: FusedRecvCallback) {
        self.fused_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.fused_recv_local_async(step_id, keys, done);
    }
}

/// Graph engine that echoes `method:request`.
#[derive(Default)]
pub struct EchoGraph {
    pub handled: AtomicUsize,
}

impl GraphWorker for EchoGraph {
    fn handle(&self, method: MethodId, request: Bytes) -> Result<Bytes> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        let mut out = format!("{}:", method).into_bytes();
        out.extend_from_slice(&request);
        Ok(Bytes::from(out))
    }

    fn run_graph(&self, _options: Arc<CallOptions>, request: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            let mut out = b"ran:".to_vec();
            out.extend_from_slice(&request);
            Ok(Bytes::from(out))
        })
    }
}

/// Client end of a framed connection.
pub struct FrameClient {
    stream: DuplexStream,
    buffer: FrameBuffer,
    ready: Vec<Frame>,
}

impl FrameClient {
    pub fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            buffer: FrameBuffer::new(),
            ready: Vec::new(),
        }
    }

    pub async fn request(&mut self, method: u8, tag: u64, payload: &[u8]) {
        let header = Header::request(method, tag, payload.len() as u32);
        self.stream.write_all(&build_frame(&header, payload)).await.unwrap();
    }

    pub async fn cancel(&mut self, method: u8, tag: u64) {
        let header = Header::cancel(method, tag);
        self.stream.write_all(&build_frame(&header, &[])).await.unwrap();
    }

    /// Next frame from the server.
    pub async fn next_frame(&mut self) -> Frame {
        let mut buf = vec![0u8; 16 * 1024];
        while self.ready.is_empty() {
            let n = self.stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "server closed the connection");
            self.ready.extend(self.buffer.push(&buf[..n]).unwrap());
        }
        self.ready.remove(0)
    }

    pub async fn close(mut self) {
        self.stream.shutdown().await.unwrap();
    }
}
