//! # rendezvous-worker
//!
//! Worker-side RPC dispatch and tensor transfer for a distributed
//! computation runtime.
//!
//! A worker answers a fixed set of methods. Most are forwarded to the graph
//! engine ([`GraphWorker`]); the two receive methods are served here:
//!
//! - **recv-tensor**: parse a rendezvous key, resolve its source device,
//!   wait for the value in the [`rendezvous`] store, stage it to host memory
//!   when it lives on an accelerator, and answer once.
//! - **fused-recv-tensor**: the same for N keys, answered as one response
//!   when the last of the N values is ready ([`JoinBarrier`]).
//!
//! ## Layers
//!
//! - [`protocol`] / [`writer`]: 16-byte framed wire format, frame reassembly
//!   and the batched writer task
//! - [`server`]: connection loop, routes frames to the dispatch table
//! - [`service`]: method ids, requests and the [`MethodDispatchTable`]
//! - [`call`]: per-call handle, options (cancellation) and state
//! - [`transfer`]: the two receive protocols and the copy decision
//! - [`rendezvous`], [`device`], [`tensor`]: collaborator seams and values
//!
//! ## Example
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
//!         1,
//!     )));
//!     let rendezvous = Arc::new(LocalRendezvous::new());
//!     let server = Server::builder(WorkerEnv::new(Arc::new(devices), rendezvous)).build()?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:2222").await?;
//!     server.serve_tcp(listener).await?;
//!     Ok(())
//! }
//! ```

pub mod call;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod rendezvous;
pub mod server;
pub mod service;
pub mod tensor;
pub mod transfer;
pub mod worker;
pub mod writer;

mod barrier;

pub use barrier::JoinBarrier;
pub use config::WorkerConfig;
pub use error::{Result, StatusCode, WorkerError};
pub use server::{Connection, Server, ServerBuilder};
pub use service::{MethodDispatchTable, MethodId};
pub use worker::{GraphWorker, NoGraphWorker, Worker, WorkerEnv};
