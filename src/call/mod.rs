//! Calls: the handle the transport gives to a handler, and the per-call
//! state a handler owns until it responds.
//!
//! A [`ServerCall`] is answered exactly once: [`ServerCall::respond`] takes
//! it by value. Calls arriving from a connection answer through the
//! connection's writer; [`ServerCall::in_process`] builds a call whose answer
//! arrives on a oneshot channel, for embedding and tests.

mod options;
mod state;

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tracing::{debug, warn};

pub use options::CallOptions;
pub use state::{CallState, WireResponse};

use crate::codec::MsgPackCodec;
use crate::error::Result;
use crate::protocol::Header;
use crate::service::MethodId;
use crate::writer::{OutboundFrame, WriterHandle};

/// Calls currently running on a connection, by tag.
pub type InFlight = DashMap<u64, Arc<CallOptions>>;

/// Encoded response payload, as a list of segments.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseBody {
    segments: Vec<Bytes>,
}

impl ResponseBody {
    pub fn new(segments: Vec<Bytes>) -> Self {
        Self { segments }
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            segments: vec![bytes],
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[Bytes] {
        &self.segments
    }

    pub fn into_segments(self) -> Vec<Bytes> {
        self.segments
    }

    /// Total payload length.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The payload as one contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.as_slice() {
            [] => Bytes::new(),
            [only] => only.clone(),
            many => {
                let mut buf = BytesMut::with_capacity(self.len());
                for segment in many {
                    buf.extend_from_slice(segment);
                }
                buf.freeze()
            }
        }
    }
}

/// How a call ended.
pub type CallOutcome = Result<ResponseBody>;

enum CallSink {
    Connection {
        writer: WriterHandle,
        inflight: Arc<InFlight>,
    },
    Channel(oneshot::Sender<CallOutcome>),
}

/// One incoming call.
pub struct ServerCall {
    method: MethodId,
    tag: u64,
    payload: Bytes,
    options: Arc<CallOptions>,
    sink: CallSink,
}

impl ServerCall {
    /// Call answered through a oneshot channel.
    pub fn in_process(method: MethodId, payload: Bytes) -> (Self, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        let call = Self {
            method,
            tag: 0,
            payload,
            options: Arc::new(CallOptions::new()),
            sink: CallSink::Channel(tx),
        };
        (call, rx)
    }

    /// Call read from a connection; registered in `inflight` until answered.
    pub(crate) fn on_connection(
        method: MethodId,
        tag: u64,
        payload: Bytes,
        writer: WriterHandle,
        inflight: Arc<InFlight>,
    ) -> Self {
        let options = Arc::new(CallOptions::new());
        inflight.insert(tag, options.clone());
        Self {
            method,
            tag,
            payload,
            options,
            sink: CallSink::Connection { writer, inflight },
        }
    }

    #[inline]
    pub fn method(&self) -> MethodId {
        self.method
    }

    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn options(&self) -> &Arc<CallOptions> {
        &self.options
    }

    /// Decode the MsgPack request payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        MsgPackCodec::decode(&self.payload)
    }

    /// Deliver the outcome and release the call.
    ///
    /// Never blocks; may be called from any thread.
    pub fn respond(self, outcome: CallOutcome) {
        let method = self.method;
        let tag = self.tag;
        if let Err(err) = &outcome {
            debug!(%method, tag, error = %err, "call failed");
        }

        match self.sink {
            CallSink::Channel(tx) => {
                let _ = tx.send(outcome);
            }
            CallSink::Connection { writer, inflight } => {
                inflight.remove(&tag);
                let framed = outcome.and_then(|body| {
                    OutboundFrame::new(Header::response(method.as_u8(), tag, 0), body.into_segments())
                        .inspect_err(|err| warn!(%method, tag, error = %err, "response not sendable"))
                });
                let frame = match framed {
                    Ok(frame) => frame,
                    Err(err) => OutboundFrame::error(method.as_u8(), tag, &err),
                };
                writer.send_or_spawn(frame);
            }
        }
    }
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCall")
            .field("method", &self.method)
            .field("tag", &self.tag)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}
